//! Structural validation of resource specs.
//!
//! Runs before planning. Any error here rejects the whole plan before a
//! single provider call is made.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{ConfigError, Result, StackformError};

use super::model::{ResourceKind, ResourceSpec};

/// A single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIssue {
    /// Field path, e.g. `resources[service].task_definition`.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// Validator for declared resource sets.
#[derive(Debug, Default)]
pub struct ResourceValidator;

impl ResourceValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a full declared set.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, specs: &[ResourceSpec]) -> Result<()> {
        let issues = self.collect_issues(specs);
        if let Some(first) = issues.into_iter().next() {
            return Err(StackformError::Config(ConfigError::ValidationError {
                message: first.message,
                field: Some(first.field),
            }));
        }
        debug!("Validated {} resource specs", specs.len());
        Ok(())
    }

    /// Validates one spec against the kinds of the other declared ids.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate_spec(
        &self,
        spec: &ResourceSpec,
        known: &HashMap<&str, ResourceKind>,
    ) -> Result<()> {
        let mut issues = Vec::new();
        Self::check_spec(spec, known, &mut issues);
        match issues.into_iter().next() {
            Some(first) => Err(StackformError::Config(ConfigError::ValidationError {
                message: first.message,
                field: Some(first.field),
            })),
            None => Ok(()),
        }
    }

    /// Returns every issue in the declared set.
    #[must_use]
    pub fn collect_issues(&self, specs: &[ResourceSpec]) -> Vec<ResourceIssue> {
        let mut issues = Vec::new();
        let mut known: HashMap<&str, ResourceKind> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, spec) in specs.iter().enumerate() {
            if spec.id.trim().is_empty() {
                issues.push(ResourceIssue {
                    field: format!("resources[{i}].id"),
                    message: String::from("Resource id cannot be empty"),
                });
            } else if !seen.insert(spec.id.as_str()) {
                issues.push(ResourceIssue {
                    field: format!("resources[{}].id", spec.id),
                    message: format!("Duplicate resource id: {}", spec.id),
                });
            }
            known.entry(spec.id.as_str()).or_insert(spec.kind);
        }

        for spec in specs {
            Self::check_spec(spec, &known, &mut issues);
        }

        issues
    }

    fn check_spec(
        spec: &ResourceSpec,
        known: &HashMap<&str, ResourceKind>,
        issues: &mut Vec<ResourceIssue>,
    ) {
        let prefix = format!("resources[{}]", spec.id);
        let schema = spec.kind.schema();

        for attr in schema.required {
            let missing = spec.attr(attr).is_none_or(serde_json::Value::is_null);
            if missing {
                issues.push(ResourceIssue {
                    field: format!("{prefix}.{attr}"),
                    message: format!("{spec} is missing required attribute '{attr}'"),
                });
            }
        }

        for dep in &spec.depends_on {
            if dep == &spec.id {
                issues.push(ResourceIssue {
                    field: format!("{prefix}.depends_on"),
                    message: format!("{spec} depends on itself"),
                });
            } else if !known.contains_key(dep.as_str()) {
                issues.push(ResourceIssue {
                    field: format!("{prefix}.depends_on"),
                    message: format!("{spec} depends on unknown resource '{dep}'"),
                });
            }
        }

        for (attr, expected_kind) in schema.references {
            let Some(value) = spec.attr(attr) else {
                continue;
            };
            let Some(target) = value.as_str() else {
                issues.push(ResourceIssue {
                    field: format!("{prefix}.{attr}"),
                    message: format!("{spec}: '{attr}' must be a resource id"),
                });
                continue;
            };
            match known.get(target) {
                None => issues.push(ResourceIssue {
                    field: format!("{prefix}.{attr}"),
                    message: format!("{spec}: '{attr}' references unknown resource '{target}'"),
                }),
                Some(kind) if kind != expected_kind => issues.push(ResourceIssue {
                    field: format!("{prefix}.{attr}"),
                    message: format!(
                        "{spec}: '{attr}' must reference a {expected_kind}, but '{target}' is a {kind}"
                    ),
                }),
                Some(_) if !spec.depends_on.contains(target) => issues.push(ResourceIssue {
                    field: format!("{prefix}.depends_on"),
                    message: format!("{spec} references '{target}' but does not depend on it"),
                }),
                Some(_) => {}
            }
        }

        if spec.kind == ResourceKind::SecurityRule {
            Self::check_security_rule(spec, &prefix, issues);
        }
    }

    fn check_security_rule(spec: &ResourceSpec, prefix: &str, issues: &mut Vec<ResourceIssue>) {
        match spec.attr_str("rule_type") {
            Some("ingress") => {
                if spec.attr("port").is_none() {
                    issues.push(ResourceIssue {
                        field: format!("{prefix}.port"),
                        message: format!("{spec}: ingress rules require a 'port'"),
                    });
                }
            }
            Some("iam_policy") => {
                let has_actions = spec
                    .attr("actions")
                    .and_then(serde_json::Value::as_array)
                    .is_some_and(|a| !a.is_empty());
                if !has_actions {
                    issues.push(ResourceIssue {
                        field: format!("{prefix}.actions"),
                        message: format!("{spec}: IAM policy rules require a non-empty 'actions' list"),
                    });
                }
            }
            Some(other) => issues.push(ResourceIssue {
                field: format!("{prefix}.rule_type"),
                message: format!("{spec}: unknown rule_type '{other}'. Expected: ingress or iam_policy"),
            }),
            // Missing rule_type is already reported as a missing required attribute.
            None => {}
        }
    }
}

impl std::fmt::Display for ResourceIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
