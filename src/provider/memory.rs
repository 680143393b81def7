//! In-memory simulated control plane.
//!
//! Behaves like a strict provider: creating a resource whose dependencies do
//! not exist fails, and deleting a resource that a live resource still
//! depends on fails with a conflict. Every call is recorded, and failures
//! and health results can be scripted.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProviderError;
use crate::resource::{Attributes, ResourceKind, ResourceSpec};
use crate::state::AppliedState;

use super::{Provider, ProviderRecord, ProviderResult, References, ResourceHealth};

/// Provider operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `read`
    Read,
    /// `health`
    Health,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation invoked.
    pub operation: ProviderOperation,
    /// Resource id the call concerned, when known.
    pub resource_id: String,
}

#[derive(Debug, Clone)]
struct LiveResource {
    resource_id: String,
    kind: ResourceKind,
    attributes: Attributes,
    depends_on: BTreeSet<String>,
}

#[derive(Debug)]
struct Fault {
    operation: ProviderOperation,
    resource_id: String,
    error: ProviderError,
    remaining: u32,
}

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<ResourceKind, u64>,
    /// Live resources keyed by provider id.
    live: BTreeMap<String, LiveResource>,
    calls: Vec<ProviderCall>,
    faults: Vec<Fault>,
    /// Scripted health results keyed by resource id; the last one sticks.
    health: HashMap<String, VecDeque<ResourceHealth>>,
}

/// Simulated provider holding resources in memory.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider whose live resources match an applied state, so a
    /// fresh process sees what earlier runs created.
    #[must_use]
    pub fn from_applied(state: &AppliedState) -> Self {
        let mut inner = Inner::default();
        for resource in state.in_sequence() {
            let n = resource
                .provider_id
                .rsplit_once('-')
                .and_then(|(_, n)| n.parse::<u64>().ok())
                .unwrap_or(0);
            let counter = inner.counters.entry(resource.kind).or_insert(0);
            *counter = (*counter).max(n);
            inner.live.insert(
                resource.provider_id.clone(),
                LiveResource {
                    resource_id: resource.id.clone(),
                    kind: resource.kind,
                    attributes: resource.attributes.clone(),
                    depends_on: resource.depends_on.clone(),
                },
            );
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Makes the next `times` calls of `operation` on `resource_id` fail
    /// with `error`.
    pub async fn fail_times(
        &self,
        operation: ProviderOperation,
        resource_id: &str,
        error: ProviderError,
        times: u32,
    ) {
        self.inner.lock().await.faults.push(Fault {
            operation,
            resource_id: resource_id.to_string(),
            error,
            remaining: times,
        });
    }

    /// Makes every call of `operation` on `resource_id` fail with `error`.
    pub async fn fail_always(&self, operation: ProviderOperation, resource_id: &str, error: ProviderError) {
        self.fail_times(operation, resource_id, error, u32::MAX).await;
    }

    /// Scripts the health results reported for `resource_id`, in order.
    /// The last result repeats once the script runs out.
    pub async fn script_health(&self, resource_id: &str, results: Vec<ResourceHealth>) {
        self.inner
            .lock()
            .await
            .health
            .insert(resource_id.to_string(), results.into());
    }

    /// Returns every recorded call.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns the recorded calls that mutate resources.
    pub async fn mutations(&self) -> Vec<ProviderCall> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| {
                matches!(
                    c.operation,
                    ProviderOperation::Create | ProviderOperation::Update | ProviderOperation::Delete
                )
            })
            .cloned()
            .collect()
    }

    /// Returns the resource ids currently live, sorted.
    pub async fn live_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.live.values().map(|r| r.resource_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Returns the live attributes of `resource_id`.
    pub async fn live_attributes(&self, resource_id: &str) -> Option<Attributes> {
        let inner = self.inner.lock().await;
        inner
            .live
            .values()
            .find(|r| r.resource_id == resource_id)
            .map(|r| r.attributes.clone())
    }
}

impl Inner {
    fn record(&mut self, operation: ProviderOperation, resource_id: &str) {
        self.calls.push(ProviderCall {
            operation,
            resource_id: resource_id.to_string(),
        });
    }

    fn take_fault(&mut self, operation: ProviderOperation, resource_id: &str) -> Option<ProviderError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.operation == operation && f.resource_id == resource_id && f.remaining > 0)?;
        fault.remaining -= 1;
        Some(fault.error.clone())
    }

    fn resource_id_of(&self, provider_id: &str) -> String {
        self.live
            .get(provider_id)
            .map_or_else(|| provider_id.to_string(), |r| r.resource_id.clone())
    }

    fn is_live(&self, resource_id: &str) -> bool {
        self.live.values().any(|r| r.resource_id == resource_id)
    }

    /// A referenced provider id must be live; unreferenced dependencies are
    /// looked up by logical id.
    fn check_dependencies(&self, spec: &ResourceSpec, references: &References) -> ProviderResult<()> {
        let missing = spec.depends_on.iter().find_map(|dep| match references.get(dep) {
            Some(provider_id) if !self.live.contains_key(provider_id) => Some(format!("{dep}' ({provider_id})")),
            None if !self.is_live(dep) => Some(format!("{dep}'")),
            _ => None,
        });
        match missing {
            Some(missing) => Err(ProviderError::Validation {
                message: format!("{spec} depends on '{missing}, which does not exist"),
            }),
            None => Ok(()),
        }
    }

    fn record_of(provider_id: &str, live: &LiveResource) -> ProviderRecord {
        ProviderRecord {
            provider_id: provider_id.to_string(),
            kind: live.kind,
            attributes: live.attributes.clone(),
        }
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn create(&self, spec: &ResourceSpec, references: &References) -> ProviderResult<ProviderRecord> {
        let mut inner = self.inner.lock().await;
        inner.record(ProviderOperation::Create, &spec.id);
        if let Some(error) = inner.take_fault(ProviderOperation::Create, &spec.id) {
            return Err(error);
        }
        if inner.is_live(&spec.id) {
            return Err(ProviderError::Conflict {
                message: format!("{spec} already exists"),
            });
        }
        inner.check_dependencies(spec, references)?;

        let counter = inner.counters.entry(spec.kind).or_insert(0);
        *counter += 1;
        let provider_id = format!("{}-{counter}", spec.kind.as_str());

        let live = LiveResource {
            resource_id: spec.id.clone(),
            kind: spec.kind,
            attributes: spec.attributes.clone(),
            depends_on: spec.depends_on.clone(),
        };
        let record = Inner::record_of(&provider_id, &live);
        inner.live.insert(provider_id.clone(), live);
        debug!("Simulated provider created {spec} as {provider_id}");
        Ok(record)
    }

    async fn update(
        &self,
        provider_id: &str,
        spec: &ResourceSpec,
        references: &References,
    ) -> ProviderResult<ProviderRecord> {
        let mut inner = self.inner.lock().await;
        inner.record(ProviderOperation::Update, &spec.id);
        if let Some(error) = inner.take_fault(ProviderOperation::Update, &spec.id) {
            return Err(error);
        }
        inner.check_dependencies(spec, references)?;

        let live = inner
            .live
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })?;
        live.attributes = spec.attributes.clone();
        live.depends_on = spec.depends_on.clone();
        let record = Inner::record_of(provider_id, live);
        debug!("Simulated provider updated {spec} ({provider_id})");
        Ok(record)
    }

    async fn delete(&self, provider_id: &str, kind: ResourceKind) -> ProviderResult<()> {
        let mut inner = self.inner.lock().await;
        let resource_id = inner.resource_id_of(provider_id);
        inner.record(ProviderOperation::Delete, &resource_id);
        if let Some(error) = inner.take_fault(ProviderOperation::Delete, &resource_id) {
            return Err(error);
        }

        let Some(live) = inner.live.get(provider_id) else {
            return Err(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            });
        };
        if live.kind != kind {
            return Err(ProviderError::Validation {
                message: format!("{provider_id} is a {}, not a {kind}", live.kind),
            });
        }

        let holder = inner
            .live
            .values()
            .find(|other| other.depends_on.contains(&resource_id));
        if let Some(holder) = holder {
            return Err(ProviderError::Conflict {
                message: format!(
                    "{resource_id} is still in use by {} '{}'",
                    holder.kind, holder.resource_id
                ),
            });
        }

        inner.live.remove(provider_id);
        debug!("Simulated provider deleted {resource_id} ({provider_id})");
        Ok(())
    }

    async fn read(&self, provider_id: &str) -> ProviderResult<ProviderRecord> {
        let mut inner = self.inner.lock().await;
        let resource_id = inner.resource_id_of(provider_id);
        inner.record(ProviderOperation::Read, &resource_id);
        if let Some(error) = inner.take_fault(ProviderOperation::Read, &resource_id) {
            return Err(error);
        }
        inner
            .live
            .get(provider_id)
            .map(|live| Inner::record_of(provider_id, live))
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
    }

    async fn health(&self, provider_id: &str) -> ProviderResult<ResourceHealth> {
        let mut inner = self.inner.lock().await;
        let resource_id = inner.resource_id_of(provider_id);
        inner.record(ProviderOperation::Health, &resource_id);
        if let Some(error) = inner.take_fault(ProviderOperation::Health, &resource_id) {
            return Err(error);
        }
        if !inner.live.contains_key(provider_id) {
            return Err(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            });
        }

        let Some(script) = inner.health.get_mut(&resource_id) else {
            return Ok(ResourceHealth::Healthy);
        };
        let result = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(result.unwrap_or(ResourceHealth::Healthy))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ResourceSpec {
        ResourceSpec::new("cluster", ResourceKind::Cluster).with_attr("name", "main")
    }

    fn service() -> ResourceSpec {
        ResourceSpec::new("service", ResourceKind::Service)
            .with_attr("cluster", "cluster")
            .depends_on("cluster")
    }

    #[tokio::test]
    async fn test_create_assigns_kind_ids() {
        let provider = InMemoryProvider::new();
        let record = provider.create(&cluster(), &References::new()).await.expect("Create should succeed");
        assert_eq!(record.provider_id, "cluster-1");
        assert_eq!(record.kind, ResourceKind::Cluster);
        assert_eq!(provider.live_ids().await, vec!["cluster"]);
    }

    #[tokio::test]
    async fn test_create_requires_dependencies() {
        let provider = InMemoryProvider::new();
        let err = provider
            .create(&service(), &References::new())
            .await
            .expect_err("Missing dependency should be rejected");
        assert!(matches!(err, ProviderError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_delete_in_use_conflicts() {
        let provider = InMemoryProvider::new();
        let c = provider
            .create(&cluster(), &References::new())
            .await
            .expect("Create cluster should succeed");
        let s = provider
            .create(&service(), &References::new())
            .await
            .expect("Create service should succeed");

        let err = provider
            .delete(&c.provider_id, ResourceKind::Cluster)
            .await
            .expect_err("In-use cluster should not be deleted");
        assert!(matches!(err, ProviderError::Conflict { .. }));

        provider
            .delete(&s.provider_id, ResourceKind::Service)
            .await
            .expect("Delete service should succeed");
        provider
            .delete(&c.provider_id, ResourceKind::Cluster)
            .await
            .expect("Delete cluster should succeed");
        assert!(provider.live_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let provider = InMemoryProvider::new();
        let err = provider
            .delete("cluster-9", ResourceKind::Cluster)
            .await
            .expect_err("Unknown id should not be deleted");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let provider = InMemoryProvider::new();
        provider
            .fail_times(
                ProviderOperation::Create,
                "cluster",
                ProviderError::Unavailable { message: String::from("503") },
                1,
            )
            .await;

        assert!(provider.create(&cluster(), &References::new()).await.is_err());
        assert!(provider.create(&cluster(), &References::new()).await.is_ok());
        assert_eq!(provider.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_health_last_result_sticks() {
        let provider = InMemoryProvider::new();
        let c = provider
            .create(&cluster(), &References::new())
            .await
            .expect("Create cluster should succeed");
        provider
            .script_health(
                "cluster",
                vec![
                    ResourceHealth::Pending,
                    ResourceHealth::Unhealthy { reason: String::from("tasks failing") },
                ],
            )
            .await;

        assert_eq!(
            provider.health(&c.provider_id).await.expect("Health should be reported"),
            ResourceHealth::Pending
        );
        for _ in 0..3 {
            assert!(provider
                .health(&c.provider_id)
                .await
                .expect("Health should be reported")
                .is_unhealthy());
        }
    }

    #[tokio::test]
    async fn test_update_replaces_attributes() {
        let provider = InMemoryProvider::new();
        let c = provider
            .create(&cluster(), &References::new())
            .await
            .expect("Create cluster should succeed");
        let changed = cluster().with_attr("container_insights", true);
        provider
            .update(&c.provider_id, &changed, &References::new())
            .await
            .expect("Update should succeed");

        let attrs = provider.live_attributes("cluster").await.expect("Cluster should be live");
        assert_eq!(attrs.get("container_insights"), Some(&serde_json::json!(true)));
        let record = provider.read(&c.provider_id).await.expect("Read should succeed");
        assert_eq!(record.attributes, attrs);
    }

    #[tokio::test]
    async fn test_from_applied_continues_numbering() {
        let mut state = AppliedState::new("demo", "dev");
        state.record_applied(&cluster(), "cluster-4", "h1");
        state.record_applied(&service(), "service-1", "h2");

        let provider = InMemoryProvider::from_applied(&state);
        assert_eq!(provider.live_ids().await, vec!["cluster", "service"]);

        let err = provider
            .delete("cluster-4", ResourceKind::Cluster)
            .await
            .expect_err("In-use cluster should not be deleted");
        assert!(matches!(err, ProviderError::Conflict { .. }));

        let other = ResourceSpec::new("other", ResourceKind::Cluster).with_attr("name", "b");
        let record = provider
            .create(&other, &References::new())
            .await
            .expect("Create should succeed");
        assert_eq!(record.provider_id, "cluster-5");
    }

    #[tokio::test]
    async fn test_stale_reference_is_rejected() {
        let provider = InMemoryProvider::new();
        let c = provider
            .create(&cluster(), &References::new())
            .await
            .expect("Create cluster should succeed");

        let stale = References::from([(String::from("cluster"), String::from("cluster-9"))]);
        let err = provider
            .create(&service(), &stale)
            .await
            .expect_err("Reference to a deleted incarnation should be rejected");
        assert!(err.to_string().contains("cluster-9"));

        let current = References::from([(String::from("cluster"), c.provider_id)]);
        provider
            .create(&service(), &current)
            .await
            .expect("Reference to the live cluster should succeed");
    }
}
