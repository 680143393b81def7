//! Configuration module.
//!
//! This module handles the declared configuration:
//! - Parsing `stackform.yaml` with `.env` and environment overrides
//! - Validation of configuration values
//! - Expanding the topology template into resource specs

mod parser;
mod spec;
mod template;
mod validator;

pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR};
pub use spec::{
    ApplyConfig, Architecture, AutoscalingOptions, CapacityProviderWeight, CircuitBreaker,
    ClusterOptions, ContainerOptions, ImageSource, IngressRule, LoadBalancerOptions,
    PolicyStatement, ProjectConfig, ProviderConfig, ProviderKind, RollbackConfig, ScalingMetric,
    ServiceOptions, StackConfig, StateBackend, StateConfig, TaskOptions, TopologyConfig,
};
pub use template::TopologyTemplate;
pub use validator::{is_valid_fargate_size, ConfigValidator, ValidationError, ValidationResult};
