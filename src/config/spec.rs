//! Configuration specification types.
//!
//! This module defines the structs that map to `stackform.yaml`. A document
//! declares the stack either through the `topology` template, through an
//! explicit `resources` list, or both.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::provider::RetryPolicy;
use crate::resource::ResourceSpec;

use super::template::TopologyTemplate;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider control plane.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Apply executor settings.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Post-apply rollback supervision.
    #[serde(default)]
    pub rollback: RollbackConfig,
    /// Parameterized stack topology.
    #[serde(default)]
    pub topology: Option<TopologyConfig>,
    /// Explicit resources, declared after the topology's.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Control plane base URL (required for http).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// JSON control-plane API over HTTP.
    #[default]
    Http,
    /// In-process simulation seeded from the applied state.
    Simulated,
}

/// Apply executor settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Maximum provider calls in flight within one dependency level.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single retry delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Rollback supervision settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackConfig {
    /// Whether to watch services after apply and revert on sustained failure.
    #[serde(default)]
    pub enabled: bool,
    /// Consecutive failed health checks that trigger a rollback.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds between health checks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Health checks before the deployment counts as stable.
    #[serde(default = "default_max_checks")]
    pub max_checks: u32,
}

/// Options of the single parameterized stack topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// CPU architecture of the task's runtime platform.
    #[serde(default)]
    pub architecture: Architecture,
    /// Where the container image comes from.
    pub image: ImageSource,
    /// Adds a target-tracking scaling policy for the service.
    #[serde(default)]
    pub enable_autoscaling: bool,
    /// Enables exec into running tasks and grants the messaging permissions.
    #[serde(default)]
    pub enable_exec_command: bool,
    /// Network the stack lives in.
    #[serde(default = "default_vpc")]
    pub vpc: String,
    /// Cluster options.
    #[serde(default)]
    pub cluster: ClusterOptions,
    /// Task definition options.
    #[serde(default)]
    pub task: TaskOptions,
    /// Container options.
    #[serde(default)]
    pub container: ContainerOptions,
    /// Service options.
    #[serde(default)]
    pub service: ServiceOptions,
    /// Ingress rules attached to the service.
    #[serde(default = "default_ingress")]
    pub ingress: Vec<IngressRule>,
    /// Load balancer and listener options.
    #[serde(default)]
    pub load_balancer: LoadBalancerOptions,
    /// Scaling bounds and target (used with `enable_autoscaling`).
    #[serde(default)]
    pub autoscaling: AutoscalingOptions,
    /// Extra policy statements granted to the task role.
    #[serde(default)]
    pub policies: Vec<PolicyStatement>,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 64-bit x86.
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    /// 64-bit ARM.
    Arm64,
}

/// Container image source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ImageSource {
    /// Public registry reference such as `owner/app:1.2`.
    Registry {
        /// Full image reference.
        reference: String,
    },
    /// Private repository plus tag.
    Repository {
        /// Repository name.
        name: String,
        /// Image tag.
        #[serde(default = "default_image_tag")]
        tag: String,
    },
}

/// Cluster options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterOptions {
    /// Cluster name; `<project>-<environment>` when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Enables container insights.
    #[serde(default)]
    pub container_insights: bool,
    /// Capacity providers enabled on the cluster.
    #[serde(default = "default_capacity_providers")]
    pub capacity_providers: Vec<String>,
}

/// Task definition options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOptions {
    /// Task CPU units.
    #[serde(default = "default_task_cpu")]
    pub cpu: u32,
    /// Task memory in MiB.
    #[serde(default = "default_task_memory")]
    pub memory_mib: u32,
}

/// Container options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Container name.
    #[serde(default = "default_container_name")]
    pub name: String,
    /// Container CPU units.
    #[serde(default = "default_task_cpu")]
    pub cpu: u32,
    /// Container memory limit in MiB.
    #[serde(default = "default_task_memory")]
    pub memory_mib: u32,
    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Container port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host port; same as the container port when absent.
    #[serde(default)]
    pub host_port: Option<u16>,
    /// Environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Log stream prefix.
    #[serde(default = "default_container_name")]
    pub log_stream_prefix: String,
}

/// Service options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Number of tasks to keep running.
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    /// Assigns a public IP to each task.
    #[serde(default = "default_true")]
    pub assign_public_ip: bool,
    /// Capacity provider weights.
    #[serde(default = "default_capacity_strategy")]
    pub capacity_provider_strategy: Vec<CapacityProviderWeight>,
    /// Deployment circuit breaker.
    #[serde(default)]
    pub circuit_breaker: CircuitBreaker,
    /// Grace period before load balancer health checks count.
    #[serde(default)]
    pub health_check_grace_period_secs: Option<u32>,
}

/// One capacity provider strategy item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityProviderWeight {
    /// Capacity provider name.
    pub capacity_provider: String,
    /// Relative weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Tasks always placed on this provider.
    #[serde(default)]
    pub base: u32,
}

/// Deployment circuit breaker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreaker {
    /// Stops a failing deployment.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Rolls a stopped deployment back.
    #[serde(default = "default_true")]
    pub rollback: bool,
}

/// Ingress rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressRule {
    /// TCP port.
    pub port: u16,
    /// Allowed source range.
    #[serde(default = "default_cidr")]
    pub cidr: String,
    /// Rule description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Load balancer and listener options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerOptions {
    /// Public load balancer.
    #[serde(default = "default_true")]
    pub internet_facing: bool,
    /// Listener port.
    #[serde(default = "default_port")]
    pub listener_port: u16,
    /// Port on the targets.
    #[serde(default = "default_port")]
    pub target_port: u16,
    /// Idle connection timeout.
    #[serde(default)]
    pub idle_timeout_secs: Option<u32>,
}

/// Autoscaling options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AutoscalingOptions {
    /// Minimum task count.
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,
    /// Maximum task count.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
    /// Tracked metric.
    #[serde(default)]
    pub metric: ScalingMetric,
    /// Target value of the metric.
    #[serde(default = "default_target_value")]
    pub target_value: f64,
    /// Cooldown after scaling in.
    #[serde(default = "default_cooldown")]
    pub scale_in_cooldown_secs: u32,
    /// Cooldown after scaling out.
    #[serde(default = "default_cooldown")]
    pub scale_out_cooldown_secs: u32,
}

/// Target-tracking metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    /// Average CPU utilization.
    #[default]
    Cpu,
    /// Average memory utilization.
    Memory,
    /// Requests per target.
    RequestCount,
}

/// IAM policy statement granted to the task role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyStatement {
    /// Allowed actions.
    pub actions: Vec<String>,
    /// Resources the actions apply to.
    #[serde(default = "default_policy_resources")]
    pub resources: Vec<String>,
    /// Statement description.
    #[serde(default)]
    pub description: Option<String>,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    1
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_interval_secs() -> u64 {
    10
}

const fn default_max_checks() -> u32 {
    30
}

fn default_vpc() -> String {
    String::from("default")
}

fn default_image_tag() -> String {
    String::from("latest")
}

fn default_capacity_providers() -> Vec<String> {
    vec![String::from("FARGATE"), String::from("FARGATE_SPOT")]
}

const fn default_task_cpu() -> u32 {
    256
}

const fn default_task_memory() -> u32 {
    512
}

fn default_container_name() -> String {
    String::from("web")
}

const fn default_port() -> u16 {
    80
}

const fn default_desired_count() -> u32 {
    3
}

const fn default_true() -> bool {
    true
}

const fn default_weight() -> u32 {
    1
}

fn default_capacity_strategy() -> Vec<CapacityProviderWeight> {
    vec![CapacityProviderWeight {
        capacity_provider: String::from("FARGATE"),
        weight: 1,
        base: 0,
    }]
}

fn default_cidr() -> String {
    String::from("0.0.0.0/0")
}

fn default_ingress() -> Vec<IngressRule> {
    vec![IngressRule {
        port: 80,
        cidr: default_cidr(),
        description: Some(String::from("Http from anywhere")),
    }]
}

const fn default_min_capacity() -> u32 {
    1
}

const fn default_max_capacity() -> u32 {
    10
}

const fn default_target_value() -> f64 {
    50.0
}

const fn default_cooldown() -> u32 {
    60
}

fn default_policy_resources() -> Vec<String> {
    vec![String::from("*")]
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            interval_secs: default_interval_secs(),
            max_checks: default_max_checks(),
        }
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            name: None,
            container_insights: false,
            capacity_providers: default_capacity_providers(),
        }
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            cpu: default_task_cpu(),
            memory_mib: default_task_memory(),
        }
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            name: default_container_name(),
            cpu: default_task_cpu(),
            memory_mib: default_task_memory(),
            command: Vec::new(),
            port: default_port(),
            host_port: None,
            environment: BTreeMap::new(),
            log_stream_prefix: default_container_name(),
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            desired_count: default_desired_count(),
            assign_public_ip: true,
            capacity_provider_strategy: default_capacity_strategy(),
            circuit_breaker: CircuitBreaker::default(),
            health_check_grace_period_secs: None,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            enable: true,
            rollback: true,
        }
    }
}

impl Default for LoadBalancerOptions {
    fn default() -> Self {
        Self {
            internet_facing: true,
            listener_port: default_port(),
            target_port: default_port(),
            idle_timeout_secs: None,
        }
    }
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            min_capacity: default_min_capacity(),
            max_capacity: default_max_capacity(),
            metric: ScalingMetric::default(),
            target_value: default_target_value(),
            scale_in_cooldown_secs: default_cooldown(),
            scale_out_cooldown_secs: default_cooldown(),
        }
    }
}

impl TopologyConfig {
    /// Creates a topology with default options for `image`.
    #[must_use]
    pub fn new(image: ImageSource) -> Self {
        Self {
            architecture: Architecture::default(),
            image,
            enable_autoscaling: false,
            enable_exec_command: false,
            vpc: default_vpc(),
            cluster: ClusterOptions::default(),
            task: TaskOptions::default(),
            container: ContainerOptions::default(),
            service: ServiceOptions::default(),
            ingress: default_ingress(),
            load_balancer: LoadBalancerOptions::default(),
            autoscaling: AutoscalingOptions::default(),
            policies: Vec::new(),
        }
    }
}

impl Architecture {
    /// Name as the provider spells it.
    #[must_use]
    pub const fn provider_name(self) -> &'static str {
        match self {
            Self::X86_64 => "X86_64",
            Self::Arm64 => "ARM64",
        }
    }
}

impl ImageSource {
    /// Full image reference.
    #[must_use]
    pub fn reference(&self) -> String {
        match self {
            Self::Registry { reference } => reference.clone(),
            Self::Repository { name, tag } => format!("{name}:{tag}"),
        }
    }

    /// Source name stored on the container resource.
    #[must_use]
    pub const fn source_name(&self) -> &'static str {
        match self {
            Self::Registry { .. } => "registry",
            Self::Repository { .. } => "repository",
        }
    }
}

impl ScalingMetric {
    /// Predefined metric name.
    #[must_use]
    pub const fn provider_name(self) -> &'static str {
        match self {
            Self::Cpu => "ECSServiceAverageCPUUtilization",
            Self::Memory => "ECSServiceAverageMemoryUtilization",
            Self::RequestCount => "ALBRequestCountPerTarget",
        }
    }
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// The declared resource set: the topology's resources followed by the
    /// explicit ones.
    #[must_use]
    pub fn declared_resources(&self) -> Vec<ResourceSpec> {
        let mut specs = self
            .topology
            .as_ref()
            .map(|topology| TopologyTemplate::new(topology).build(&self.project))
            .unwrap_or_default();
        specs.extend(self.resources.iter().cloned());
        specs
    }

    /// Retry policy for provider calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.apply.max_attempts,
            self.apply.base_delay_ms,
            self.apply.max_delay_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference() {
        let registry = ImageSource::Registry {
            reference: String::from("owner/api:1.2"),
        };
        assert_eq!(registry.reference(), "owner/api:1.2");

        let repo: ImageSource = serde_yaml::from_str("source: repository\nname: api-repo").expect("Repository source should parse");
        assert_eq!(repo.reference(), "api-repo:latest");
        assert_eq!(repo.source_name(), "repository");
    }

    #[test]
    fn test_topology_defaults() {
        let topology: TopologyConfig =
            serde_yaml::from_str("image:\n  source: registry\n  reference: nginx:1.27").expect("Registry source should parse");
        assert_eq!(topology, TopologyConfig::new(ImageSource::Registry {
            reference: String::from("nginx:1.27"),
        }));
        assert_eq!(topology.task.cpu, 256);
        assert_eq!(topology.service.desired_count, 3);
        assert_eq!(topology.ingress.len(), 1);
        assert_eq!(topology.ingress[0].port, 80);
        assert!(topology.service.circuit_breaker.rollback);
    }

    #[test]
    fn test_architecture_names() {
        let arch: Architecture = serde_yaml::from_str("arm64").expect("Architecture should parse");
        assert_eq!(arch.provider_name(), "ARM64");
        assert_eq!(Architecture::default().provider_name(), "X86_64");
    }
}
