//! S3-based state storage backend.
//!
//! Remote state for teams sharing one stack. The lock is a sibling object;
//! a fresh lock is created with a conditional put so two runs racing for
//! an unlocked stack cannot both win.

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StackformError, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::{
    concurrent_run, decode_lock, decode_state, encode_lock, encode_state, lock_lost, StateStore,
};
use super::types::AppliedState;

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// Error code S3 returns when a conditional put loses.
const PRECONDITION_FAILED: &str = "PreconditionFailed";

/// S3-based state store.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// Normalizes a key prefix to `""` or `"a/b/"`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        if bucket.is_empty() {
            return Err(StackformError::State(StateError::s3("Bucket name is empty")));
        }

        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackformError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackformError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackformError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object. With `only_if_absent`, the put fails if the key exists
    /// and `Ok(false)` is returned.
    async fn put_object(&self, key: &str, content: &str, only_if_absent: bool) -> Result<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");
        if only_if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if only_if_absent && service_err.code() == Some(PRECONDITION_FAILED) {
                    Ok(false)
                } else {
                    Err(StackformError::State(StateError::s3(format!(
                        "S3 put error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StackformError::State(StateError::s3(format!(
                    "S3 delete error: {}",
                    e.into_service_error()
                )))
            })?;

        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StackformError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<AppliedState> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = decode_state(&json)?;
                debug!(
                    "Loaded state for {}/{} ({} resources)",
                    state.project,
                    state.environment,
                    state.resources.len()
                );
                Ok(state)
            }
            None => {
                debug!("No state found in S3");
                Ok(AppliedState::new("", ""))
            }
        }
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        let key = self.key(STATE_KEY);
        let content = encode_state(state)?;

        self.put_object(&key, &content, false).await?;

        debug!("State saved to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let existing = self.get_lock_info().await?;
        if let Some(existing) = &existing {
            if !existing.is_expired() {
                return Err(concurrent_run(existing));
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        let lock_info = LockInfo::for_holder(holder);
        let content = encode_lock(&lock_info)?;

        if !self.put_object(&key, &content, existing.is_none()).await? {
            // Another run created the lock between our read and our put.
            return match self.get_lock_info().await? {
                Some(winner) => Err(concurrent_run(&winner)),
                None => Err(StackformError::State(StateError::LockFailed {
                    message: String::from("Lock object changed during acquisition"),
                })),
            };
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        match self.get_lock_info().await? {
            Some(mut existing) if existing.lock_id == lock_id => {
                existing.refresh();
                self.put_object(&self.key(LOCK_KEY), &encode_lock(&existing)?, false)
                    .await?;
                debug!("Refreshed state lock {lock_id}");
                Ok(existing)
            }
            _ => Err(lock_lost(lock_id)),
        }
    }

    async fn force_unlock(&self) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            info!("Force-removing lock held by {}", existing.holder);
            self.delete_object(&self.key(LOCK_KEY)).await?;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(LOCK_KEY)).await? {
            Some(content) => decode_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}
