//! Local file-based state storage backend.
//!
//! Keeps the state document and its lock next to each other in a directory,
//! `.stackform/` under the working directory by default.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StackformError, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::{
    concurrent_run, decode_lock, decode_state, encode_lock, encode_state, lock_lost, StateStore,
};
use super::types::AppliedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackform";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Attempts to create the lock file before giving up.
const LOCK_ATTEMPTS: usize = 3;

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store in `.stackform/` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn default_location() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackformError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a new local state store from a custom state file path.
    ///
    /// The lock file lives next to the state file.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackformError::State(StateError::io(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through `staged` and a rename, so readers
    /// never observe a partially written document.
    async fn write_atomic(&self, path: &Path, staged: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        write_synced(staged, content).await?;

        fs::rename(staged, path).await.map_err(|e| {
            StackformError::State(StateError::io(format!(
                "Failed to rename temp file onto {}: {e}",
                path.display()
            )))
        })
    }

    /// Creates the lock file only if none exists.
    ///
    /// The lock is fully written to a staging file first and hard-linked
    /// into place; the link fails if the lock file already exists, so of
    /// two racing runs exactly one gets `true`.
    async fn try_create_lock(&self, lock: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let staged = sibling(&self.lock_path, &format!("{}.tmp", lock.lock_id));
        write_synced(&staged, &encode_lock(lock)?).await?;

        let linked = fs::hard_link(&staged, &self.lock_path).await;
        if let Err(e) = fs::remove_file(&staged).await {
            debug!("Failed to remove staged lock {}: {e}", staged.display());
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(lock_failed(format!("Failed to create lock file: {e}"))),
        }
    }

    /// Moves an expired lock out of the way on behalf of `claimant`.
    ///
    /// If another run replaced `expired` with a fresh lock in the meantime,
    /// the fresh lock is put back.
    async fn evict_expired(&self, expired: &LockInfo, claimant: &LockInfo) -> Result<()> {
        let aside = sibling(&self.lock_path, &format!("{}.expired", claimant.lock_id));

        match fs::rename(&self.lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(lock_failed(format!("Failed to evict expired lock: {e}"))),
        }

        let moved = read_lock_at(&aside).await?;
        if moved.is_some_and(|m| m.lock_id != expired.lock_id) {
            debug!("Lock was replaced while evicting, restoring it");
            match fs::hard_link(&aside, &self.lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(lock_failed(format!("Failed to restore lock file: {e}"))),
            }
        }

        if let Err(e) = fs::remove_file(&aside).await {
            debug!("Failed to remove evicted lock {}: {e}", aside.display());
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        read_lock_at(&self.lock_path).await
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lock_failed(format!("Failed to delete lock file: {e}"))),
        }
    }
}

/// Path next to `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

async fn write_synced(path: &Path, content: &str) -> Result<()> {
    let io_err = |what: &str, e: std::io::Error| {
        StackformError::State(StateError::io(format!("Failed to {what} {}: {e}", path.display())))
    };

    let mut file = fs::File::create(path).await.map_err(|e| io_err("create", e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| io_err("write", e))?;
    file.sync_all().await.map_err(|e| io_err("sync", e))
}

async fn read_lock_at(path: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(path).await {
        Ok(content) => decode_lock(&content).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(lock_failed(format!("Failed to read lock file: {e}"))),
    }
}

fn lock_failed(message: String) -> StackformError {
    StackformError::State(StateError::LockFailed { message })
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<AppliedState> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(AppliedState::new("", ""));
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StackformError::State(StateError::io(format!("Failed to read state file: {e}")))
        })?;

        decode_state(&content)
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        let content = encode_state(state)?;
        let staged = sibling(&self.state_path, "tmp");
        self.write_atomic(&self.state_path, &staged, &content).await?;
        debug!("State saved to {}", self.state_path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                StackformError::State(StateError::io(format!("Failed to delete state file: {e}")))
            })?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::for_holder(holder);

        for _ in 0..LOCK_ATTEMPTS {
            if self.try_create_lock(&lock_info).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => return Err(concurrent_run(&existing)),
                Some(existing) => {
                    debug!("Expired lock held by {} found, taking over", existing.holder);
                    self.evict_expired(&existing, &lock_info).await?;
                }
                None => debug!("Lock released while acquiring, retrying"),
            }
        }

        Err(lock_failed(String::from("Lock file kept changing during acquisition")))
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        // Take the lock file aside first so a lock created by another run is
        // never overwritten.
        let aside = sibling(&self.lock_path, &format!("{lock_id}.refresh"));
        match fs::rename(&self.lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(lock_lost(lock_id)),
            Err(e) => return Err(lock_failed(format!("Failed to refresh lock file: {e}"))),
        }

        let taken = read_lock_at(&aside).await;
        let refreshed = match taken {
            Ok(Some(mut existing)) if existing.lock_id == lock_id => {
                existing.refresh();
                self.try_create_lock(&existing).await.map(|created| created.then_some(existing))
            }
            _ => {
                debug!("Lock {lock_id} was replaced, restoring the current holder's lock");
                match fs::hard_link(&aside, &self.lock_path).await {
                    Ok(()) => Ok(None),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
                    Err(e) => Err(lock_failed(format!("Failed to restore lock file: {e}"))),
                }
            }
        };

        if let Err(e) = fs::remove_file(&aside).await {
            debug!("Failed to remove {}: {e}", aside.display());
        }

        match refreshed? {
            Some(lock) => {
                debug!("Refreshed state lock {lock_id}");
                Ok(lock)
            }
            None => Err(lock_lost(lock_id)),
        }
    }

    async fn force_unlock(&self) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            info!("Force-removing lock held by {}", existing.holder);
        }
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}
