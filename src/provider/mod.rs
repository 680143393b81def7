//! Provider collaborator.
//!
//! The reconciler only needs create/read/update/delete per resource plus a
//! health query for services. Everything behind this trait is the control
//! plane's business.

mod health;
mod http;
mod memory;
mod retry;

pub use health::{HealthMonitor, HealthVerdict};
pub use http::HttpProvider;
pub use memory::{InMemoryProvider, ProviderCall, ProviderOperation};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::resource::{Attributes, ResourceKind, ResourceSpec};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Provider ids of a resource's dependencies, keyed by logical id.
///
/// Built from the applied state at call time, so a dependency replaced
/// earlier in the same run resolves to its new incarnation.
pub type References = BTreeMap<String, String>;

/// A resource as the provider sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderRecord {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Attributes the provider holds for the resource.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Health reported by the provider for a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResourceHealth {
    /// Running and passing health checks.
    Healthy,
    /// Failing health checks.
    Unhealthy {
        /// Provider's explanation.
        reason: String,
    },
    /// Not settled yet.
    Pending,
}

impl ResourceHealth {
    /// Returns true if the resource is failing health checks.
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy { .. })
    }
}

impl std::fmt::Display for ResourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy { reason } => write!(f, "unhealthy ({reason})"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// External control plane exposing CRUD per resource kind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource and returns the provider's record of it.
    async fn create(&self, spec: &ResourceSpec, references: &References) -> ProviderResult<ProviderRecord>;

    /// Updates an existing resource in place.
    async fn update(
        &self,
        provider_id: &str,
        spec: &ResourceSpec,
        references: &References,
    ) -> ProviderResult<ProviderRecord>;

    /// Deletes a resource.
    async fn delete(&self, provider_id: &str, kind: ResourceKind) -> ProviderResult<()>;

    /// Reads a resource.
    async fn read(&self, provider_id: &str) -> ProviderResult<ProviderRecord>;

    /// Queries the health of a resource.
    async fn health(&self, provider_id: &str) -> ProviderResult<ResourceHealth>;

    /// Returns the provider name for logging.
    fn name(&self) -> &'static str;
}
