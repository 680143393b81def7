//! Apply executor.
//!
//! Issues one provider call per plan step, in plan order. Each success is
//! written to the applied state and persisted before the next step starts,
//! so an aborted run leaves the state matching exactly what changed. The
//! first failure aborts the run; nothing already applied is undone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ProviderError, Result, StackformError};
use crate::provider::{Provider, References, RetryPolicy};
use crate::resource::{ResourceHasher, ResourceKind, ResourceSpec};
use crate::state::{AppliedState, HistoryEntry, StateOperation, StateStore};

use super::plan::{ChangeAction, ChangeSet, CompletedAction, PlanStep};

/// Options for an apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Compute the plan without calling the provider.
    pub dry_run: bool,
    /// Maximum concurrent provider calls; 1 runs strictly in sequence.
    pub concurrency: usize,
    /// Retry policy for transient provider failures.
    pub retry: RetryPolicy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a completed apply run.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Steps that completed, in completion order.
    pub completed: Vec<CompletedAction>,
    /// True if no provider calls were made.
    pub dry_run: bool,
}

/// What a step needs to talk to the provider.
#[derive(Debug, Clone)]
enum StepCall {
    Create {
        spec: ResourceSpec,
        references: References,
    },
    Update {
        provider_id: String,
        spec: ResourceSpec,
        references: References,
    },
    Delete {
        provider_id: String,
        kind: ResourceKind,
    },
}

/// What a successful step did.
#[derive(Debug)]
enum StepOutcome {
    Applied { spec: ResourceSpec, provider_id: String },
    Deleted,
}

/// Executor for change sets.
pub struct ApplyExecutor<'a> {
    /// Provider collaborator.
    provider: Arc<dyn Provider>,
    /// Store the state is persisted to after every step.
    store: &'a dyn StateStore,
    /// Run options.
    options: ApplyOptions,
    /// Operation recorded in history.
    operation: StateOperation,
    /// Lock refreshed before every save, if the run holds one.
    lock_id: Option<String>,
    /// Attribute hasher.
    hasher: ResourceHasher,
}

impl std::fmt::Debug for ApplyExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("options", &self.options)
            .field("operation", &self.operation)
            .field("lock_id", &self.lock_id)
            .finish()
    }
}

impl<'a> ApplyExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: &'a dyn StateStore, options: ApplyOptions) -> Self {
        Self {
            provider,
            store,
            options,
            operation: StateOperation::Apply,
            lock_id: None,
            hasher: ResourceHasher::new(),
        }
    }

    /// Sets the operation recorded in history.
    #[must_use]
    pub const fn with_operation(mut self, operation: StateOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Keeps `lock_id` alive for the duration of the run.
    ///
    /// The lock is refreshed before every save; if it was lost, the run
    /// stops without writing.
    #[must_use]
    pub fn with_lock(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }

    /// Executes a change set against the provider.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Aborted`] naming the failed step and every step
    /// that completed before it, or a state error if persisting fails.
    pub async fn execute(
        &self,
        change_set: &ChangeSet,
        declared: &[ResourceSpec],
        state: &mut AppliedState,
    ) -> Result<ApplyReport> {
        if self.options.dry_run {
            info!("Dry run: {} step(s) planned, no provider calls made", change_set.step_count());
            return Ok(ApplyReport {
                completed: vec![],
                dry_run: true,
            });
        }

        info!(
            "Executing {} step(s) against {} provider",
            change_set.step_count(),
            self.provider.name()
        );

        let specs: HashMap<&str, &ResourceSpec> =
            declared.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut completed = Vec::new();

        // Noop entries get no step, so their declared edges are taken up front.
        let unchanged: Vec<ResourceSpec> = change_set
            .entries
            .iter()
            .filter(|e| e.action == ChangeAction::Noop)
            .filter_map(|e| specs.get(e.resource_id.as_str()).map(|s| (*s).clone()))
            .collect();
        state.refresh_edges(&unchanged);

        let outcome = if self.options.concurrency <= 1 {
            self.run_sequential(&change_set.steps, &specs, state, &mut completed).await
        } else {
            self.run_concurrent(&change_set.steps, &specs, state, &mut completed).await
        };

        match outcome {
            Ok(()) => {
                if self.operation != StateOperation::Destroy {
                    state.refresh_edges(declared);
                }
                state.fingerprint.clone_from(&change_set.fingerprint);
                state.add_history(HistoryEntry::new(
                    self.operation,
                    &change_set.fingerprint,
                    completed.clone(),
                ));
                self.persist(state).await?;
                info!("Apply complete: {} step(s) executed", completed.len());
                Ok(ApplyReport {
                    completed,
                    dry_run: false,
                })
            }
            Err(Failure::Provider { step, source }) => {
                error!("{} failed: {source}", step.description());
                let err = ApplyError::Aborted {
                    resource_id: step.resource_id.clone(),
                    action: step.action,
                    source,
                    completed: completed.clone(),
                };
                state.add_history(HistoryEntry::failed(
                    self.operation,
                    &change_set.fingerprint,
                    completed,
                    &err.to_string(),
                ));
                self.persist(state).await?;
                Err(StackformError::Apply(err))
            }
            Err(Failure::Other(e)) => Err(e),
        }
    }

    async fn run_sequential(
        &self,
        steps: &[PlanStep],
        specs: &HashMap<&str, &ResourceSpec>,
        state: &mut AppliedState,
        completed: &mut Vec<CompletedAction>,
    ) -> std::result::Result<(), Failure> {
        for step in steps {
            let Some(call) = Self::prepare(step, specs, state)? else {
                continue;
            };
            info!("{}", step.description());
            match run_step(Arc::clone(&self.provider), self.options.retry, step.clone(), call).await {
                Ok(outcome) => self.record(step, outcome, state, completed).await?,
                Err(source) => {
                    return Err(Failure::Provider {
                        step: step.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs steps level by level; steps on one level share no dependency
    /// edge, so they may run together. Deletes finish before creates start.
    async fn run_concurrent(
        &self,
        steps: &[PlanStep],
        specs: &HashMap<&str, &ResourceSpec>,
        state: &mut AppliedState,
        completed: &mut Vec<CompletedAction>,
    ) -> std::result::Result<(), Failure> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));

        let mut batches: BTreeMap<(bool, usize), Vec<&PlanStep>> = BTreeMap::new();
        for step in steps {
            // Deletes sort first.
            batches
                .entry((!step.is_delete(), step.level))
                .or_default()
                .push(step);
        }

        for ((_, level), batch) in batches {
            debug!("Running level {level} with {} step(s)", batch.len());
            let mut tasks = JoinSet::new();
            for step in batch {
                let Some(call) = Self::prepare(step, specs, state)? else {
                    continue;
                };
                info!("{}", step.description());
                let provider = Arc::clone(&self.provider);
                let retry = self.options.retry;
                let permits = Arc::clone(&semaphore);
                let step = step.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let result = run_step(provider, retry, step.clone(), call).await;
                    (step, result)
                });
            }

            // Drain the whole level so every in-flight success is recorded.
            let mut first_failure = None;
            while let Some(joined) = tasks.join_next().await {
                let (step, result) = joined.map_err(|e| {
                    Failure::Other(StackformError::internal(format!("Apply worker failed: {e}")))
                })?;
                match result {
                    Ok(outcome) => self.record(&step, outcome, state, completed).await?,
                    Err(source) => {
                        if first_failure.is_none() {
                            first_failure = Some(Failure::Provider { step, source });
                        }
                    }
                }
            }
            if let Some(failure) = first_failure {
                return Err(failure);
            }
        }
        Ok(())
    }

    /// Resolves what a step sends to the provider. Returns `None` for a
    /// delete of something the state no longer tracks.
    fn prepare(
        step: &PlanStep,
        specs: &HashMap<&str, &ResourceSpec>,
        state: &AppliedState,
    ) -> std::result::Result<Option<StepCall>, Failure> {
        let applied = state.get(&step.resource_id);
        let call = match step.action {
            ChangeAction::Delete => match applied {
                Some(resource) => StepCall::Delete {
                    provider_id: resource.provider_id.clone(),
                    kind: resource.kind,
                },
                None => {
                    debug!("{} is not tracked, nothing to delete", step.resource_id);
                    return Ok(None);
                }
            },
            ChangeAction::Create => {
                let spec = Self::declared(step, specs)?;
                StepCall::Create {
                    references: resolve_references(&spec, state),
                    spec,
                }
            }
            ChangeAction::Update => {
                let provider_id = applied
                    .map(|r| r.provider_id.clone())
                    .ok_or_else(|| internal(format!("{} is not tracked, cannot update", step.resource_id)))?;
                let spec = Self::declared(step, specs)?;
                StepCall::Update {
                    provider_id,
                    references: resolve_references(&spec, state),
                    spec,
                }
            }
            ChangeAction::Replace | ChangeAction::Noop => {
                return Err(internal(format!("{step} is not an executable step")));
            }
        };
        Ok(Some(call))
    }

    fn declared(
        step: &PlanStep,
        specs: &HashMap<&str, &ResourceSpec>,
    ) -> std::result::Result<ResourceSpec, Failure> {
        specs
            .get(step.resource_id.as_str())
            .map(|s| (*s).clone())
            .ok_or_else(|| internal(format!("{} is not declared", step.resource_id)))
    }

    /// Applies a successful step to the state and persists it.
    async fn record(
        &self,
        step: &PlanStep,
        outcome: StepOutcome,
        state: &mut AppliedState,
        completed: &mut Vec<CompletedAction>,
    ) -> std::result::Result<(), Failure> {
        match outcome {
            StepOutcome::Applied { spec, provider_id } => {
                let hash = self.hasher.attributes_hash(&spec);
                state.record_applied(&spec, &provider_id, &hash);
            }
            StepOutcome::Deleted => {
                state.remove(&step.resource_id);
            }
        }
        self.persist(state).await.map_err(Failure::Other)?;
        completed.push(CompletedAction::new(step.resource_id.clone(), step.action));
        debug!("Recorded {step}");
        Ok(())
    }

    /// Saves the state, first confirming the run still holds its lock.
    async fn persist(&self, state: &AppliedState) -> Result<()> {
        if let Some(lock_id) = &self.lock_id {
            self.store.refresh_lock(lock_id).await?;
        }
        self.store.save(state).await
    }
}

/// Provider ids of the live resources `spec` depends on, as currently
/// recorded. Dependencies replaced earlier in the run resolve to their new
/// incarnation.
fn resolve_references(spec: &ResourceSpec, state: &AppliedState) -> References {
    spec.depends_on
        .iter()
        .filter_map(|dep| state.get(dep).map(|r| (dep.clone(), r.provider_id.clone())))
        .collect()
}

/// Why a run stopped early.
#[derive(Debug)]
enum Failure {
    /// A provider call failed; the run is aborted.
    Provider { step: PlanStep, source: ProviderError },
    /// Anything else: state persistence or an internal inconsistency.
    Other(StackformError),
}

impl From<StackformError> for Failure {
    fn from(e: StackformError) -> Self {
        Self::Other(e)
    }
}

fn internal(message: String) -> Failure {
    Failure::Other(StackformError::internal(message))
}

/// Performs one provider call with retries.
async fn run_step(
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    step: PlanStep,
    call: StepCall,
) -> std::result::Result<StepOutcome, ProviderError> {
    let label = step.to_string();
    match call {
        StepCall::Create { spec, references } => {
            let record = retry.run(&label, || provider.create(&spec, &references)).await?;
            info!("Created {} as {}", spec, record.provider_id);
            Ok(StepOutcome::Applied {
                spec,
                provider_id: record.provider_id,
            })
        }
        StepCall::Update {
            provider_id,
            spec,
            references,
        } => {
            let record = retry
                .run(&label, || provider.update(&provider_id, &spec, &references))
                .await?;
            info!("Updated {} ({})", spec, record.provider_id);
            Ok(StepOutcome::Applied {
                spec,
                provider_id: record.provider_id,
            })
        }
        StepCall::Delete { provider_id, kind } => {
            match retry.run(&label, || provider.delete(&provider_id, kind)).await {
                Ok(()) => info!("Deleted {kind} '{}' ({provider_id})", step.resource_id),
                Err(ProviderError::NotFound { .. }) => {
                    warn!("{kind} '{}' was already gone", step.resource_id);
                }
                Err(e) => return Err(e),
            }
            Ok(StepOutcome::Deleted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DiffEngine;
    use crate::provider::{InMemoryProvider, MockProvider, ProviderOperation, ProviderRecord};
    use crate::state::LocalStateStore;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn cluster() -> ResourceSpec {
        ResourceSpec::new("C1", ResourceKind::Cluster).with_attr("name", "main")
    }

    fn task(arch: &str) -> ResourceSpec {
        ResourceSpec::new("T1", ResourceKind::TaskDefinition)
            .with_attr("cpu", 256)
            .with_attr("memory", 512)
            .with_attr("architecture", arch)
            .depends_on("C1")
    }

    fn service(count: u32) -> ResourceSpec {
        ResourceSpec::new("S1", ResourceKind::Service)
            .with_attr("cluster", "C1")
            .with_attr("task_definition", "T1")
            .with_attr("desired_count", count)
            .depends_on("T1")
            .depends_on("C1")
    }

    fn lb() -> ResourceSpec {
        ResourceSpec::new("LB", ResourceKind::LoadBalancer).with_attr("internet_facing", true)
    }

    fn no_wait() -> ApplyOptions {
        ApplyOptions {
            retry: RetryPolicy::new(3, 1, 2),
            ..ApplyOptions::default()
        }
    }

    fn rejected(message: &str) -> ProviderError {
        ProviderError::Validation {
            message: message.to_string(),
        }
    }

    fn test_store() -> (LocalStateStore, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        (store, dir)
    }

    async fn apply(
        provider: &Arc<InMemoryProvider>,
        store: &LocalStateStore,
        options: ApplyOptions,
        declared: &[ResourceSpec],
        state: &mut AppliedState,
    ) -> Result<ApplyReport> {
        let change_set = DiffEngine::new().compute(declared, state)?;
        let dyn_provider: Arc<dyn Provider> = provider.clone();
        ApplyExecutor::new(dyn_provider, store, options)
            .execute(&change_set, declared, state)
            .await
    }

    #[tokio::test]
    async fn test_apply_then_diff_is_noop() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let declared = vec![cluster(), task("X86_64"), service(3), lb()];

        let report = apply(&provider, &store, no_wait(), &declared, &mut state)
            .await
            .expect("Apply should succeed");
        assert_eq!(report.completed.len(), 4);

        let again = DiffEngine::new().compute(&declared, &state).expect("Diff should succeed");
        assert!(again.is_converged());

        let persisted = store.load().await.expect("Failed to load state");
        assert_eq!(persisted.resources, state.resources);
        assert_eq!(persisted.history.len(), 1);
        assert!(persisted.history[0].success);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_calls() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let options = ApplyOptions { dry_run: true, ..no_wait() };

        let report = apply(&provider, &store, options, &[cluster()], &mut state)
            .await
            .expect("Dry run should succeed");
        assert!(report.dry_run);
        assert!(provider.calls().await.is_empty());
        assert!(state.is_empty());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_partial_failure_is_recoverable() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let declared = vec![cluster(), task("X86_64"), service(3), lb()];

        let planned = DiffEngine::new()
            .compute(&declared, &state)
            .expect("Diff should succeed")
            .step_pairs();
        assert_eq!(planned.len(), 4);

        // Third step fails permanently.
        provider
            .fail_times(ProviderOperation::Create, "S1", rejected("bad subnet"), 1)
            .await;

        let err = apply(&provider, &store, no_wait(), &declared, &mut state)
            .await
            .expect_err("Apply should abort");
        let StackformError::Apply(ApplyError::Aborted { resource_id, action, completed, .. }) = err else {
            panic!("expected abort, got {err}");
        };
        assert_eq!(resource_id, "S1");
        assert_eq!(action, ChangeAction::Create);
        assert_eq!(completed.len(), 2);

        let persisted = store.load().await.expect("Failed to load state");
        assert_eq!(persisted.resource_ids(), vec!["C1", "T1"]);
        assert!(!persisted.history.last().expect("History entry").success);

        let remaining = DiffEngine::new()
            .compute(&declared, &persisted)
            .expect("Diff should succeed")
            .step_pairs();
        assert_eq!(remaining, planned[2..].to_vec());
    }

    #[tokio::test]
    async fn test_reversed_edge_survives_abort() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let a = || ResourceSpec::new("A", ResourceKind::Cluster).with_attr("name", "a");
        let b = || ResourceSpec::new("B", ResourceKind::Cluster).with_attr("name", "b");

        apply(&provider, &store, no_wait(), &[a(), b().depends_on("A")], &mut state)
            .await
            .expect("Initial apply should succeed");

        // A now depends on B, B no longer depends on A, and a new C fails.
        let declared = vec![
            a().with_attr("container_insights", true).depends_on("B"),
            b(),
            ResourceSpec::new("C", ResourceKind::Cluster)
                .with_attr("name", "c")
                .depends_on("A"),
        ];
        provider
            .fail_always(ProviderOperation::Create, "C", rejected("quota exceeded"))
            .await;

        let err = apply(&provider, &store, no_wait(), &declared, &mut state)
            .await
            .expect_err("Apply should abort at C");
        assert!(matches!(err, StackformError::Apply(_)));

        let persisted = store.load().await.expect("Failed to load state");
        let deps = |id: &str| persisted.get(id).map(|r| r.depends_on.clone()).unwrap_or_default();
        assert!(deps("A").contains("B"));
        assert!(deps("B").is_empty());

        let next = DiffEngine::new()
            .compute(&declared, &persisted)
            .expect("State must remain plannable");
        assert_eq!(next.step_pairs(), vec![(String::from("C"), ChangeAction::Create)]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        provider
            .fail_times(
                ProviderOperation::Create,
                "C1",
                ProviderError::Throttled { retry_after_secs: None },
                2,
            )
            .await;

        apply(&provider, &store, no_wait(), &[cluster()], &mut state)
            .await
            .expect("Retried apply should succeed");
        assert_eq!(provider.calls().await.len(), 3);
        assert!(state.get("C1").is_some());
    }

    #[tokio::test]
    async fn test_replace_deletes_dependents_first() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");

        apply(&provider, &store, no_wait(), &[cluster(), task("X86_64"), service(3)], &mut state)
            .await
            .expect("Initial apply should succeed");
        let old_task = state.get("T1").map(|r| r.provider_id.clone());

        let declared = vec![cluster(), task("ARM64"), service(3)];
        let report = apply(&provider, &store, no_wait(), &declared, &mut state)
            .await
            .expect("Replace should succeed");
        let done: Vec<String> = report.completed.iter().map(ToString::to_string).collect();
        assert_eq!(done, vec!["delete S1", "delete T1", "create T1", "create S1"]);

        let new_task = state.get("T1").expect("Task should be tracked");
        assert_ne!(Some(new_task.provider_id.clone()), old_task);
        assert_eq!(
            new_task.attributes.get("architecture"),
            Some(&serde_json::json!("ARM64"))
        );
    }

    #[tokio::test]
    async fn test_references_resolve_to_new_incarnation() {
        let (store, _dir) = test_store();
        let mut state = AppliedState::new("demo", "dev");
        let hasher = ResourceHasher::new();
        state.record_applied(&cluster(), "cluster-1", &hasher.attributes_hash(&cluster()));
        state.record_applied(&task("X86_64"), "task-old", &hasher.attributes_hash(&task("X86_64")));
        state.record_applied(&service(3), "service-old", &hasher.attributes_hash(&service(3)));

        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_delete().times(2).returning(|_, _| Ok(()));
        mock.expect_create()
            .withf(|spec, refs| spec.id == "T1" && refs.get("C1").map(String::as_str) == Some("cluster-1"))
            .times(1)
            .returning(|spec, _| {
                Ok(ProviderRecord {
                    provider_id: String::from("task-new"),
                    kind: spec.kind,
                    attributes: spec.attributes.clone(),
                })
            });
        mock.expect_create()
            .withf(|spec, refs| {
                spec.id == "S1"
                    && refs.get("T1").map(String::as_str) == Some("task-new")
                    && refs.get("C1").map(String::as_str) == Some("cluster-1")
            })
            .times(1)
            .returning(|spec, _| {
                Ok(ProviderRecord {
                    provider_id: String::from("service-new"),
                    kind: spec.kind,
                    attributes: spec.attributes.clone(),
                })
            });

        let declared = vec![cluster(), task("ARM64"), service(3)];
        let change_set = DiffEngine::new().compute(&declared, &state).expect("Diff should succeed");
        let provider: Arc<dyn Provider> = Arc::new(mock);
        ApplyExecutor::new(provider, &store, no_wait())
            .execute(&change_set, &declared, &mut state)
            .await
            .expect("Replace should succeed");

        assert_eq!(state.get("S1").map(|r| r.provider_id.as_str()), Some("service-new"));
    }

    #[tokio::test]
    async fn test_delete_not_found_counts_as_done() {
        let (store, _dir) = test_store();
        let mut state = AppliedState::new("demo", "dev");
        state.record_applied(&cluster(), "cluster-9", "h");

        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_delete()
            .times(1)
            .returning(|id, _| Err(ProviderError::NotFound { provider_id: id.to_string() }));

        let change_set = DiffEngine::new().compute(&[], &state).expect("Diff should succeed");
        let provider: Arc<dyn Provider> = Arc::new(mock);
        ApplyExecutor::new(provider, &store, no_wait())
            .execute(&change_set, &[], &mut state)
            .await
            .expect("Missing resource should count as deleted");
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_called_once() {
        let (store, _dir) = test_store();
        let mut state = AppliedState::new("demo", "dev");

        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_create()
            .times(1)
            .returning(|_, _| Err(ProviderError::Conflict { message: String::from("name taken") }));

        let change_set = DiffEngine::new().compute(&[cluster()], &state).expect("Diff should succeed");
        let provider: Arc<dyn Provider> = Arc::new(mock);
        let err = ApplyExecutor::new(provider, &store, no_wait())
            .execute(&change_set, &[cluster()], &mut state)
            .await
            .expect_err("Conflict should abort");
        assert!(err.to_string().contains("'C1'"));
    }

    #[tokio::test]
    async fn test_concurrent_apply_respects_dependencies() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let declared = vec![cluster(), task("X86_64"), lb(), service(3)];
        let options = ApplyOptions { concurrency: 4, ..no_wait() };

        let report = apply(&provider, &store, options, &declared, &mut state)
            .await
            .expect("Concurrent apply should succeed");
        assert_eq!(report.completed.len(), 4);
        assert_eq!(report.completed.last().map(|c| c.resource_id.as_str()), Some("S1"));
        assert_eq!(provider.live_ids().await, vec!["C1", "LB", "S1", "T1"]);

        let teardown = apply(&provider, &store, options, &[], &mut state)
            .await
            .expect("Concurrent teardown should succeed");
        assert_eq!(teardown.completed.len(), 4);
        assert!(provider.live_ids().await.is_empty());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_failure_drains_level_and_stops() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let second_cluster = ResourceSpec::new("C2", ResourceKind::Cluster).with_attr("name", "spare");
        // Level 0: C1, LB, C2. Level 1: T1.
        let declared = vec![cluster(), lb(), second_cluster, task("X86_64")];
        provider
            .fail_always(ProviderOperation::Create, "LB", rejected("subnet full"))
            .await;
        let options = ApplyOptions { concurrency: 4, ..no_wait() };

        let err = apply(&provider, &store, options, &declared, &mut state)
            .await
            .expect_err("Apply should abort at LB");

        let StackformError::Apply(ApplyError::Aborted { resource_id, completed, .. }) = err else {
            panic!("expected abort, got {err}");
        };
        assert_eq!(resource_id, "LB");
        let done: HashSet<String> = completed.iter().map(ToString::to_string).collect();
        assert_eq!(
            done,
            HashSet::from([String::from("create C1"), String::from("create C2")])
        );

        let persisted = store.load().await.expect("Failed to load state");
        assert_eq!(persisted.resource_ids(), vec!["C1", "C2"]);
        assert!(provider.calls().await.iter().all(|c| c.resource_id != "T1"));
        assert_eq!(provider.live_ids().await, vec!["C1", "C2"]);
    }

    #[tokio::test]
    async fn test_lost_lock_stops_before_save() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let lock = store.acquire_lock("slow-run").await.expect("Failed to acquire lock");
        store.force_unlock().await.expect("Failed to force unlock");
        store.acquire_lock("next-run").await.expect("Failed to acquire lock");

        let change_set = DiffEngine::new().compute(&[cluster()], &state).expect("Diff should succeed");
        let dyn_provider: Arc<dyn Provider> = provider.clone();
        let err = ApplyExecutor::new(dyn_provider, &store, no_wait())
            .with_lock(lock.lock_id)
            .execute(&change_set, &[cluster()], &mut state)
            .await
            .expect_err("Run without its lock must stop");

        assert!(matches!(
            err,
            StackformError::State(crate::error::StateError::LockLost { .. })
        ));
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_held_lock_is_refreshed() {
        let (store, _dir) = test_store();
        let provider = Arc::new(InMemoryProvider::new());
        let mut state = AppliedState::new("demo", "dev");
        let lock = store.acquire_lock("me").await.expect("Failed to acquire lock");

        let change_set = DiffEngine::new().compute(&[cluster()], &state).expect("Diff should succeed");
        let dyn_provider: Arc<dyn Provider> = provider.clone();
        ApplyExecutor::new(dyn_provider, &store, no_wait())
            .with_lock(lock.lock_id.clone())
            .execute(&change_set, &[cluster()], &mut state)
            .await
            .expect("Apply under lock should succeed");

        let held = store
            .get_lock_info()
            .await
            .expect("Failed to read lock")
            .expect("Lock should still be held");
        assert_eq!(held.lock_id, lock.lock_id);
        assert!(held.expires_at >= lock.expires_at);
    }

    #[tokio::test]
    async fn test_update_uses_existing_provider_id() {
        let (store, _dir) = test_store();
        let mut state = AppliedState::new("demo", "dev");
        state.record_applied(&cluster(), "cluster-7", &ResourceHasher::new().attributes_hash(&cluster()));

        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_update()
            .withf(|pid, spec, _| pid == "cluster-7" && spec.id == "C1")
            .times(1)
            .returning(|pid, spec, _| {
                Ok(ProviderRecord {
                    provider_id: pid.to_string(),
                    kind: spec.kind,
                    attributes: spec.attributes.clone(),
                })
            });

        let declared = vec![cluster().with_attr("container_insights", true)];
        let change_set = DiffEngine::new().compute(&declared, &state).expect("Diff should succeed");
        let provider: Arc<dyn Provider> = Arc::new(mock);
        ApplyExecutor::new(provider, &store, no_wait())
            .execute(&change_set, &declared, &mut state)
            .await
            .expect("Update should succeed");
        assert_eq!(state.get("C1").map(|r| r.provider_id.as_str()), Some("cluster-7"));
    }
}
