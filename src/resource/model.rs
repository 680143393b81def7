//! Resource specification types.
//!
//! A [`ResourceSpec`] is the unit the planner, diff engine and executor work
//! on: a stable id, a kind, a flat attribute map and the ids it depends on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Attribute map of a resource. Sorted so hashing and display are stable.
pub type Attributes = BTreeMap<String, Value>;

/// Kinds of infrastructure objects in the managed topology.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Compute cluster with capacity providers.
    Cluster,
    /// Task definition (runtime platform, cpu, memory).
    TaskDefinition,
    /// Container definition attached to a task definition.
    Container,
    /// Long-running service on a cluster.
    Service,
    /// Application load balancer.
    LoadBalancer,
    /// Load balancer listener and target group.
    Listener,
    /// Target-tracking scaling policy for a service.
    ScalingPolicy,
    /// Security group ingress rule or IAM policy statement.
    SecurityRule,
}

/// Declared description of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Unique, stable identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Attribute values.
    #[serde(default)]
    pub attributes: Attributes,
    /// Ids of resources that must exist before this one.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl ResourceSpec {
    /// Creates a spec with no attributes and no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Sets an attribute in place.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Gets an attribute.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Gets a string attribute.
    #[must_use]
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Names of attributes whose values differ between `self` and `other`,
    /// including attributes present on only one side.
    #[must_use]
    pub fn changed_attributes(&self, other: &Attributes) -> Vec<String> {
        let mut changed: BTreeSet<&str> = BTreeSet::new();
        for (name, value) in &self.attributes {
            if other.get(name) != Some(value) {
                changed.insert(name);
            }
        }
        for name in other.keys() {
            if !self.attributes.contains_key(name) {
                changed.insert(name);
            }
        }
        changed.into_iter().map(String::from).collect()
    }
}

impl ResourceKind {
    /// All kinds, in the order they are usually declared.
    pub const ALL: [Self; 8] = [
        Self::Cluster,
        Self::TaskDefinition,
        Self::Container,
        Self::SecurityRule,
        Self::Service,
        Self::LoadBalancer,
        Self::Listener,
        Self::ScalingPolicy,
    ];

    /// Snake-case name used in config and state files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::TaskDefinition => "task_definition",
            Self::Container => "container",
            Self::Service => "service",
            Self::LoadBalancer => "load_balancer",
            Self::Listener => "listener",
            Self::ScalingPolicy => "scaling_policy",
            Self::SecurityRule => "security_rule",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changed_attributes() {
        let spec = ResourceSpec::new("svc", ResourceKind::Service)
            .with_attr("desired_count", 5)
            .with_attr("cluster", "cluster");

        let mut old = Attributes::new();
        old.insert(String::from("desired_count"), json!(3));
        old.insert(String::from("cluster"), json!("cluster"));
        old.insert(String::from("assign_public_ip"), json!(true));

        assert_eq!(
            spec.changed_attributes(&old),
            vec![String::from("assign_public_ip"), String::from("desired_count")]
        );
    }

    #[test]
    fn test_kind_serde_names() {
        let yaml = "id: task\nkind: task_definition\nattributes:\n  cpu: 256\n";
        let spec: ResourceSpec = serde_yaml::from_str(yaml).expect("Spec should parse");
        assert_eq!(spec.kind, ResourceKind::TaskDefinition);
        assert_eq!(spec.attr("cpu"), Some(&json!(256)));
        assert!(spec.depends_on.is_empty());
        assert_eq!(spec.kind.to_string(), "task_definition");
    }
}
