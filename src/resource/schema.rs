//! Per-kind attribute schema.
//!
//! Each kind declares which attributes are required, which attributes
//! reference other resources, and which may change without replacing the
//! resource. Anything not listed as mutable is immutable.

use super::model::ResourceKind;

/// Attribute rules for one resource kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSchema {
    /// Attributes that must be present.
    pub required: &'static [&'static str],
    /// Attributes holding the id of another resource, with the kind it must have.
    pub references: &'static [(&'static str, ResourceKind)],
    /// Attributes that can be changed in place.
    pub mutable: &'static [&'static str],
}

const CLUSTER: KindSchema = KindSchema {
    required: &["name"],
    references: &[],
    mutable: &["container_insights", "capacity_providers", "tags"],
};

const TASK_DEFINITION: KindSchema = KindSchema {
    required: &["cpu", "memory", "architecture"],
    references: &[],
    mutable: &["tags"],
};

const CONTAINER: KindSchema = KindSchema {
    required: &["image", "task_definition"],
    references: &[("task_definition", ResourceKind::TaskDefinition)],
    mutable: &["tags"],
};

const SERVICE: KindSchema = KindSchema {
    required: &["cluster", "task_definition", "desired_count"],
    references: &[
        ("cluster", ResourceKind::Cluster),
        ("task_definition", ResourceKind::TaskDefinition),
    ],
    mutable: &[
        "desired_count",
        "capacity_provider_strategy",
        "circuit_breaker",
        "assign_public_ip",
        "enable_execute_command",
        "security_groups",
        "health_check_grace_period_secs",
        "tags",
    ],
};

const LOAD_BALANCER: KindSchema = KindSchema {
    required: &["internet_facing"],
    references: &[],
    mutable: &["idle_timeout_secs", "security_groups", "tags"],
};

const LISTENER: KindSchema = KindSchema {
    required: &["load_balancer", "port"],
    references: &[("load_balancer", ResourceKind::LoadBalancer)],
    mutable: &["port", "protocol", "target_port", "targets", "tags"],
};

const SCALING_POLICY: KindSchema = KindSchema {
    required: &["service", "min_capacity", "max_capacity"],
    references: &[("service", ResourceKind::Service)],
    mutable: &[
        "min_capacity",
        "max_capacity",
        "metric",
        "target_value",
        "scale_in_cooldown_secs",
        "scale_out_cooldown_secs",
    ],
};

const SECURITY_RULE: KindSchema = KindSchema {
    required: &["rule_type"],
    references: &[],
    mutable: &["description"],
};

impl ResourceKind {
    /// Returns the attribute schema for this kind.
    #[must_use]
    pub const fn schema(self) -> &'static KindSchema {
        match self {
            Self::Cluster => &CLUSTER,
            Self::TaskDefinition => &TASK_DEFINITION,
            Self::Container => &CONTAINER,
            Self::Service => &SERVICE,
            Self::LoadBalancer => &LOAD_BALANCER,
            Self::Listener => &LISTENER,
            Self::ScalingPolicy => &SCALING_POLICY,
            Self::SecurityRule => &SECURITY_RULE,
        }
    }

    /// Returns true if `attribute` can be changed without replacement.
    #[must_use]
    pub fn is_mutable(self, attribute: &str) -> bool {
        self.schema().mutable.contains(&attribute)
    }
}
