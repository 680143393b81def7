//! Configuration validation.
//!
//! Checks a parsed `stackform.yaml` for values the provider would reject
//! or that make no sense together, then runs structural validation over the
//! declared resource set. All of it happens before planning.

use crate::error::{ConfigError, Result, StackformError};
use crate::resource::ResourceValidator;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ApplyConfig, ProjectConfig, ProviderConfig, ProviderKind, RollbackConfig, StackConfig,
    StateBackend, StateConfig, TopologyConfig,
};

/// Capacity providers the control plane knows about.
const KNOWN_CAPACITY_PROVIDERS: &[&str] = &["FARGATE", "FARGATE_SPOT"];

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(StackformError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!(
            "Configuration validation passed with {} warning(s)",
            result.warnings.len()
        );
        Ok(result)
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_apply(config.apply, &mut result);
        Self::validate_rollback(config.rollback, &mut result);

        if let Some(topology) = &config.topology {
            Self::validate_topology(topology, &mut result);
        } else if config.resources.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("resources"),
                message: String::from("Configuration declares neither a topology nor any resources"),
            });
        }

        for issue in ResourceValidator::new().collect_issues(&config.declared_resources()) {
            result.errors.push(ValidationError {
                field: issue.field,
                message: issue.message,
            });
        }

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3 && state.bucket.as_ref().is_none_or(String::is_empty) {
            result.errors.push(ValidationError {
                field: String::from("state.bucket"),
                message: String::from("S3 bucket name is required when using S3 backend"),
            });
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.kind == ProviderKind::Http {
            match provider.endpoint.as_deref() {
                None | Some("") => result.errors.push(ValidationError {
                    field: String::from("provider.endpoint"),
                    message: String::from("An endpoint is required for the http provider"),
                }),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    result.errors.push(ValidationError {
                        field: String::from("provider.endpoint"),
                        message: format!("Endpoint '{url}' must start with http:// or https://"),
                    });
                }
                Some(_) => {}
            }
        }

        if provider.timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("provider.timeout_secs"),
                message: String::from("Provider timeout must be at least 1 second"),
            });
        }
    }

    fn validate_apply(apply: ApplyConfig, result: &mut ValidationResult) {
        if apply.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("apply.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }
        if apply.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("apply.max_attempts"),
                message: String::from("At least one attempt per provider call is required"),
            });
        }
        if apply.base_delay_ms > apply.max_delay_ms {
            result.warnings.push(format!(
                "apply.base_delay_ms ({}) exceeds apply.max_delay_ms ({}); every retry waits the maximum",
                apply.base_delay_ms, apply.max_delay_ms
            ));
        }
    }

    fn validate_rollback(rollback: RollbackConfig, result: &mut ValidationResult) {
        if !rollback.enabled {
            return;
        }
        if rollback.failure_threshold == 0 {
            result.errors.push(ValidationError {
                field: String::from("rollback.failure_threshold"),
                message: String::from("Failure threshold must be at least 1"),
            });
        }
        if rollback.max_checks < rollback.failure_threshold {
            result.errors.push(ValidationError {
                field: String::from("rollback.max_checks"),
                message: format!(
                    "max_checks ({}) is lower than failure_threshold ({}), so a rollback could never trigger",
                    rollback.max_checks, rollback.failure_threshold
                ),
            });
        }
    }

    fn validate_topology(topology: &TopologyConfig, result: &mut ValidationResult) {
        let image = topology.image.reference();
        if image.is_empty() || image.starts_with(':') {
            result.errors.push(ValidationError {
                field: String::from("topology.image"),
                message: String::from("Container image cannot be empty"),
            });
        } else if image.ends_with(":latest") {
            result.warnings.push(String::from(
                "topology.image: Using ':latest' tag is not recommended for production",
            ));
        }

        if topology.vpc.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("topology.vpc"),
                message: String::from("VPC cannot be empty"),
            });
        }

        if let Some(name) = &topology.cluster.name
            && !is_valid_name(name)
        {
            result.errors.push(ValidationError {
                field: String::from("topology.cluster.name"),
                message: format!(
                    "Cluster name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."
                ),
            });
        }

        Self::validate_sizing(topology, result);
        Self::validate_ports(topology, result);
        Self::validate_capacity(topology, result);

        if topology.enable_autoscaling {
            Self::validate_autoscaling(topology, result);
        }

        for (i, statement) in topology.policies.iter().enumerate() {
            if statement.actions.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("topology.policies[{i}].actions"),
                    message: String::from("Policy statement must grant at least one action"),
                });
            }
            if statement.actions.iter().any(|a| a == "*") {
                result.warnings.push(format!(
                    "topology.policies[{i}]: Granting '*' gives the task role every permission"
                ));
            }
        }
    }

    fn validate_sizing(topology: &TopologyConfig, result: &mut ValidationResult) {
        let task = topology.task;
        if !is_valid_fargate_size(task.cpu, task.memory_mib) {
            result.errors.push(ValidationError {
                field: String::from("topology.task"),
                message: format!(
                    "Unsupported task size: {} CPU units with {} MiB. Valid memory for this CPU: {}",
                    task.cpu,
                    task.memory_mib,
                    describe_memory_options(task.cpu)
                ),
            });
        }

        let container = &topology.container;
        if container.cpu > task.cpu {
            result.errors.push(ValidationError {
                field: String::from("topology.container.cpu"),
                message: format!(
                    "Container CPU ({}) exceeds task CPU ({})",
                    container.cpu, task.cpu
                ),
            });
        }
        if container.memory_mib > task.memory_mib {
            result.errors.push(ValidationError {
                field: String::from("topology.container.memory_mib"),
                message: format!(
                    "Container memory ({} MiB) exceeds task memory ({} MiB)",
                    container.memory_mib, task.memory_mib
                ),
            });
        }
        if container.memory_mib == 0 {
            result.errors.push(ValidationError {
                field: String::from("topology.container.memory_mib"),
                message: String::from("Container memory must be positive"),
            });
        }
    }

    fn validate_ports(topology: &TopologyConfig, result: &mut ValidationResult) {
        let container = &topology.container;
        if container.port == 0 {
            result.errors.push(ValidationError {
                field: String::from("topology.container.port"),
                message: String::from("Container port must be between 1 and 65535"),
            });
        }
        // awsvpc networking requires host and container ports to match.
        if let Some(host) = container.host_port
            && host != container.port
        {
            result.errors.push(ValidationError {
                field: String::from("topology.container.host_port"),
                message: format!(
                    "Host port {host} must equal container port {}",
                    container.port
                ),
            });
        }

        let lb = topology.load_balancer;
        if lb.listener_port == 0 || lb.target_port == 0 {
            result.errors.push(ValidationError {
                field: String::from("topology.load_balancer"),
                message: String::from("Listener and target ports must be between 1 and 65535"),
            });
        }
        if lb.target_port != container.port {
            result.warnings.push(format!(
                "topology.load_balancer.target_port: {} does not match container port {}",
                lb.target_port, container.port
            ));
        }

        let mut seen = HashSet::new();
        for (i, rule) in topology.ingress.iter().enumerate() {
            if rule.port == 0 {
                result.errors.push(ValidationError {
                    field: format!("topology.ingress[{i}].port"),
                    message: String::from("Ingress port must be between 1 and 65535"),
                });
            }
            if !seen.insert((rule.port, rule.cidr.as_str())) {
                result.errors.push(ValidationError {
                    field: format!("topology.ingress[{i}]"),
                    message: format!("Duplicate ingress rule for port {} from {}", rule.port, rule.cidr),
                });
            }
        }
    }

    fn validate_capacity(topology: &TopologyConfig, result: &mut ValidationResult) {
        let strategy = &topology.service.capacity_provider_strategy;
        if !strategy.is_empty() && strategy.iter().all(|item| item.weight == 0) {
            result.errors.push(ValidationError {
                field: String::from("topology.service.capacity_provider_strategy"),
                message: String::from("At least one capacity provider needs a positive weight"),
            });
        }

        for (i, item) in strategy.iter().enumerate() {
            if !KNOWN_CAPACITY_PROVIDERS.contains(&item.capacity_provider.as_str()) {
                result.warnings.push(format!(
                    "topology.service.capacity_provider_strategy[{i}]: Unknown capacity provider '{}'",
                    item.capacity_provider
                ));
            }
            if !topology.cluster.capacity_providers.contains(&item.capacity_provider) {
                result.errors.push(ValidationError {
                    field: format!("topology.service.capacity_provider_strategy[{i}]"),
                    message: format!(
                        "Capacity provider '{}' is not enabled on the cluster",
                        item.capacity_provider
                    ),
                });
            }
        }
    }

    fn validate_autoscaling(topology: &TopologyConfig, result: &mut ValidationResult) {
        let scaling = topology.autoscaling;
        if scaling.max_capacity == 0 {
            result.errors.push(ValidationError {
                field: String::from("topology.autoscaling.max_capacity"),
                message: String::from("Maximum capacity must be at least 1"),
            });
        }
        if scaling.min_capacity > scaling.max_capacity {
            result.errors.push(ValidationError {
                field: String::from("topology.autoscaling.min_capacity"),
                message: format!(
                    "Minimum capacity ({}) exceeds maximum capacity ({})",
                    scaling.min_capacity, scaling.max_capacity
                ),
            });
        }
        if scaling.target_value.is_nan() || scaling.target_value <= 0.0 {
            result.errors.push(ValidationError {
                field: String::from("topology.autoscaling.target_value"),
                message: String::from("Scaling target value must be positive"),
            });
        }

        let desired = topology.service.desired_count;
        if desired < scaling.min_capacity || desired > scaling.max_capacity {
            result.warnings.push(format!(
                "topology.service.desired_count: {desired} is outside the autoscaling bounds {}..={}",
                scaling.min_capacity, scaling.max_capacity
            ));
        }
    }
}

/// Returns true if `memory_mib` is a valid pairing for `cpu` units.
#[must_use]
pub fn is_valid_fargate_size(cpu: u32, memory_mib: u32) -> bool {
    match cpu {
        256 => matches!(memory_mib, 512 | 1024 | 2048),
        512 => (1024..=4096).contains(&memory_mib) && memory_mib % 1024 == 0,
        1024 => (2048..=8192).contains(&memory_mib) && memory_mib % 1024 == 0,
        2048 => (4096..=16384).contains(&memory_mib) && memory_mib % 1024 == 0,
        4096 => (8192..=30720).contains(&memory_mib) && memory_mib % 1024 == 0,
        8192 => (16384..=61440).contains(&memory_mib) && memory_mib % 4096 == 0,
        16384 => (32768..=122_880).contains(&memory_mib) && memory_mib % 8192 == 0,
        _ => false,
    }
}

fn describe_memory_options(cpu: u32) -> &'static str {
    match cpu {
        256 => "512, 1024 or 2048",
        512 => "1024 to 4096 in 1024 steps",
        1024 => "2048 to 8192 in 1024 steps",
        2048 => "4096 to 16384 in 1024 steps",
        4096 => "8192 to 30720 in 1024 steps",
        8192 => "16384 to 61440 in 4096 steps",
        16384 => "32768 to 122880 in 8192 steps",
        _ => "none (CPU must be 256, 512, 1024, 2048, 4096, 8192 or 16384)",
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
