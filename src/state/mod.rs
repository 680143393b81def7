//! Applied-state persistence.
//!
//! The applied state records what the last run actually created: provider
//! ids, attribute hashes, and the dependency edges needed to tear resources
//! down in order. Backends keep it behind a single-writer lock.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    AppliedResource, AppliedState, HistoryEntry, StateOperation, MAX_HISTORY, STATE_VERSION,
};
