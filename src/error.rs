//! Error types for the stackform reconciler.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation run: configuration, resource validation, planning,
//! provider calls, state management, and apply.

use std::path::PathBuf;
use thiserror::Error;

use crate::planner::{ChangeAction, CompletedAction};

/// The main error type for the stackform reconciler.
#[derive(Debug, Error)]
pub enum StackformError {
    /// Configuration and validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors raised outside of an apply run.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Reconciliation (rollback supervision) errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed. Raised before any provider call is made.
    #[error("Validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle {
        /// Resource ids forming the cycle; the first id is repeated at the end.
        cycle: Vec<String>,
    },
}

/// Errors returned by the provider control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider throttled the request.
    #[error("Provider throttled the request")]
    Throttled {
        /// Seconds the provider asked us to wait, if it said.
        retry_after_secs: Option<u64>,
    },

    /// The provider is temporarily unavailable.
    #[error("Provider temporarily unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// The call timed out.
    #[error("Provider call timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Network error talking to the provider.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The provider rejected the resource definition.
    #[error("Provider rejected the request: {message}")]
    Validation {
        /// Provider's validation message.
        message: String,
    },

    /// The request conflicts with live provider state.
    #[error("Provider conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The resource does not exist on the provider.
    #[error("Resource not found on provider: {provider_id}")]
    NotFound {
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// Any other API failure.
    #[error("Provider API request failed: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The provider returned something we could not understand.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Another reconciliation run holds the state lock.
    #[error("Another run holds the state lock (holder: {holder}, since: {since})")]
    ConcurrentRun {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The run's lock expired and was taken over, or was force-removed.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Local filesystem error.
    #[error("State file error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A provider call failed and the remaining entries were abandoned.
    #[error(
        "Apply aborted at {action} '{resource_id}': {source} ({} prior action(s) completed)",
        .completed.len()
    )]
    Aborted {
        /// Resource whose provider call failed.
        resource_id: String,
        /// Action that failed.
        action: ChangeAction,
        /// The provider error.
        #[source]
        source: ProviderError,
        /// Actions that completed before the failure, in execution order.
        completed: Vec<CompletedAction>,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Rolling back to the last-known-good state failed.
    #[error("Rollback to previous state failed: {reason}")]
    RollbackFailed {
        /// Reason for failure.
        reason: String,
    },
}

/// Result type alias for stackform operations.
pub type Result<T> = std::result::Result<T, StackformError>;

impl StackformError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Throttled { retry_after_secs: Some(secs) }) => {
                Some(*secs)
            }
            Self::Provider(e) if e.is_transient() => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true for validation failures (malformed specs or config).
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(ConfigError::ValidationError { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Transient errors are retried with backoff; everything else fails fast.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. }
                | Self::Unavailable { .. }
                | Self::Timeout { .. }
                | Self::Network { .. }
        )
    }

    /// Creates an API error.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local file error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ApplyError {
    /// Returns the id of the resource whose action failed.
    #[must_use]
    pub fn failed_resource(&self) -> &str {
        match self {
            Self::Aborted { resource_id, .. } => resource_id,
        }
    }
}
