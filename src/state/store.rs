//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the document encoding they share.

use async_trait::async_trait;

use crate::error::{Result, StackformError, StateError};

use super::lock::LockInfo;
use super::types::{AppliedState, STATE_VERSION};

/// Trait for state storage backends.
///
/// One reconciliation run holds the lock from before its first `load` until
/// after its last `save`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state.
    ///
    /// Returns an empty state (no project, no resources) if none exists yet.
    async fn load(&self) -> Result<AppliedState>;

    /// Saves the applied state atomically.
    async fn save(&self, state: &AppliedState) -> Result<()>;

    /// Deletes the applied state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the single-writer lock.
    ///
    /// Fails with [`StateError::ConcurrentRun`] while another holder has an
    /// unexpired lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Pushes back the expiry of a lock `lock_id` still owns.
    ///
    /// Fails with [`StateError::LockLost`] if the lock was taken over or
    /// removed since it was acquired.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes the lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Human-readable location of the state document.
    fn location(&self) -> String;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<AppliedState> {
        (**self).load().await
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Parses a state document, rejecting unknown format versions.
pub(super) fn decode_state(json: &str) -> Result<AppliedState> {
    let state: AppliedState = serde_json::from_str(json).map_err(|e| {
        StackformError::State(StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })
    })?;

    if state.version != STATE_VERSION {
        return Err(StackformError::State(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: state.version,
        }));
    }

    Ok(state)
}

/// Serializes a state document.
pub(super) fn encode_state(state: &AppliedState) -> Result<String> {
    serde_json::to_string_pretty(state).map_err(|e| {
        StackformError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })
}

/// Parses a lock document.
pub(super) fn decode_lock(json: &str) -> Result<LockInfo> {
    serde_json::from_str(json).map_err(|e| {
        StackformError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

/// Serializes a lock document.
pub(super) fn encode_lock(lock: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock).map_err(|e| {
        StackformError::State(StateError::serialization(format!(
            "Failed to serialize lock: {e}"
        )))
    })
}

/// Error returned when `existing` is still held.
pub(super) fn concurrent_run(existing: &LockInfo) -> StackformError {
    StackformError::State(StateError::ConcurrentRun {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
    })
}

/// Error returned when `lock_id` no longer owns the lock.
pub(super) fn lock_lost(lock_id: &str) -> StackformError {
    StackformError::State(StateError::LockLost {
        lock_id: lock_id.to_string(),
    })
}
