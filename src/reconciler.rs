//! Reconciler for converging applied state toward the declared set.
//!
//! `plan` diffs the declared resources against the stored state and never
//! touches anything. `apply` and `destroy` run under the state lock for
//! their whole duration. With a rollback policy enabled, services are
//! watched after a successful apply and the previous applied state is
//! re-applied if they keep failing health checks.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ProjectConfig, RollbackConfig};
use crate::error::{ConfigError, ProviderError, ReconcileError, Result, StackformError};
use crate::planner::{ApplyExecutor, ApplyOptions, ChangeAction, ChangeSet, CompletedAction, DiffEngine};
use crate::provider::{HealthMonitor, HealthVerdict, Provider, ResourceHealth};
use crate::resource::{ResourceHasher, ResourceKind, ResourceSpec, ResourceValidator};
use crate::state::{generate_holder_id, AppliedState, StateOperation, StateStore};

/// Opt-in post-apply rollback policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackPolicy {
    /// Whether services are watched after apply.
    pub enabled: bool,
    /// Consecutive failed checks that trigger a rollback.
    pub failure_threshold: u32,
    /// Delay between checks.
    pub interval: Duration,
    /// Checks before the deployment counts as stable.
    pub max_checks: u32,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 3,
            interval: Duration::from_secs(10),
            max_checks: 30,
        }
    }
}

impl RollbackPolicy {
    /// Builds the policy from the `rollback` config section.
    #[must_use]
    pub const fn from_config(config: &RollbackConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold,
            interval: Duration::from_secs(config.interval_secs),
            max_checks: config.max_checks,
        }
    }
}

/// What a rollback did.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    /// Service whose health checks kept failing.
    pub resource_id: String,
    /// Last failure reason reported.
    pub reason: String,
    /// Actions taken to restore the previous state.
    pub reverted: Vec<CompletedAction>,
}

/// Result of an apply or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    /// Operation that ran.
    pub operation: StateOperation,
    /// Change set that was executed (or would have been, on a dry run).
    pub change_set: ChangeSet,
    /// Actions that completed, in completion order.
    pub completed: Vec<CompletedAction>,
    /// True if no provider calls were made.
    pub dry_run: bool,
    /// Set when the deployment was rolled back after failing health checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackOutcome>,
}

impl ReconciliationResult {
    fn new(operation: StateOperation, change_set: ChangeSet, completed: Vec<CompletedAction>, dry_run: bool) -> Self {
        Self {
            operation,
            change_set,
            completed,
            dry_run,
            rollback: None,
        }
    }

    /// Returns true if the deployment was rolled back.
    #[must_use]
    pub const fn rolled_back(&self) -> bool {
        self.rollback.is_some()
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let operation = match self.operation {
            StateOperation::Apply => "Apply",
            StateOperation::Destroy => "Destroy",
            StateOperation::Rollback => "Rollback",
        };

        if self.dry_run {
            writeln!(
                f,
                "{operation} (dry run): {} step(s) planned, nothing changed",
                self.change_set.step_count()
            )?;
        } else if self.change_set.is_converged() {
            writeln!(f, "{operation} complete: no changes required")?;
        } else {
            writeln!(f, "{operation} complete: {} action(s) executed", self.completed.len())?;
        }

        writeln!(f, "  Created: {}", self.change_set.count(ChangeAction::Create))?;
        writeln!(f, "  Updated: {}", self.change_set.count(ChangeAction::Update))?;
        writeln!(f, "  Replaced: {}", self.change_set.count(ChangeAction::Replace))?;
        writeln!(f, "  Deleted: {}", self.change_set.count(ChangeAction::Delete))?;
        writeln!(f, "  Unchanged: {}", self.change_set.count(ChangeAction::Noop))?;

        if let Some(rollback) = &self.rollback {
            writeln!(
                f,
                "  Rolled back: '{}' kept failing health checks ({})",
                rollback.resource_id, rollback.reason
            )?;
            writeln!(f, "  Reverted: {} action(s)", rollback.reverted.len())?;
        }

        Ok(())
    }
}

/// Live status of one applied resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// Resource id.
    pub resource_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Whether the provider still knows the resource.
    pub exists: bool,
    /// Whether the provider's attributes differ from what was applied.
    pub drifted: bool,
    /// Health, queried for services only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ResourceHealth>,
    /// Error from the provider, if a query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceStatus {
    /// Returns true if the resource exists, matches and is not failing.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.exists
            && !self.drifted
            && self.error.is_none()
            && !self.health.as_ref().is_some_and(ResourceHealth::is_unhealthy)
    }
}

/// Reconciler for one deployment target.
pub struct Reconciler<'a> {
    /// Provider collaborator.
    provider: Arc<dyn Provider>,
    /// State store.
    store: &'a dyn StateStore,
    /// Project name recorded in new state documents.
    project: String,
    /// Environment name recorded in new state documents.
    environment: String,
    /// Apply options.
    options: ApplyOptions,
    /// Post-apply rollback policy.
    rollback: RollbackPolicy,
    /// Lock holder id.
    holder: String,
    validator: ResourceValidator,
    diff_engine: DiffEngine,
    hasher: ResourceHasher,
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provider", &self.provider.name())
            .field("store", &self.store.location())
            .field("project", &self.project)
            .field("environment", &self.environment)
            .field("options", &self.options)
            .field("rollback", &self.rollback)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: &'a dyn StateStore, project: &ProjectConfig) -> Self {
        Self {
            provider,
            store,
            project: project.name.clone(),
            environment: project.environment.clone(),
            options: ApplyOptions::default(),
            rollback: RollbackPolicy::default(),
            holder: generate_holder_id(),
            validator: ResourceValidator::new(),
            diff_engine: DiffEngine::new(),
            hasher: ResourceHasher::new(),
        }
    }

    /// Sets the apply options.
    #[must_use]
    pub const fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the rollback policy.
    #[must_use]
    pub const fn with_rollback(mut self, rollback: RollbackPolicy) -> Self {
        self.rollback = rollback;
        self
    }

    /// Sets the lock holder id.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Loads the applied state, stamping project and environment on an
    /// empty document.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or belongs to a
    /// different deployment target.
    pub async fn load_state(&self) -> Result<AppliedState> {
        let mut state = self.store.load().await?;

        if state.project.is_empty() && state.environment.is_empty() {
            state.project.clone_from(&self.project);
            state.environment.clone_from(&self.environment);
        } else if state.project != self.project || state.environment != self.environment {
            return Err(StackformError::Config(ConfigError::validation(
                format!(
                    "State at {} belongs to {}/{}, not {}/{}",
                    self.store.location(),
                    state.project,
                    state.environment,
                    self.project,
                    self.environment
                ),
                "project",
            )));
        }

        debug!(
            "Loaded state for {}/{} with {} resource(s)",
            state.project,
            state.environment,
            state.resources.len()
        );
        Ok(state)
    }

    /// Computes the change set for `declared` without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed specs, a cycle error for a
    /// cyclic graph, or a state error if the state cannot be loaded.
    pub async fn plan(&self, declared: &[ResourceSpec]) -> Result<ChangeSet> {
        info!("Planning {}/{}", self.project, self.environment);
        self.validator.validate(declared)?;
        let state = self.load_state().await?;
        self.diff_engine.compute(declared, &state)
    }

    /// Converges the provider to `declared`.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or planning fails, another run holds
    /// the state lock, the apply aborts, or a rollback fails.
    pub async fn apply(&self, declared: &[ResourceSpec]) -> Result<ReconciliationResult> {
        self.validator.validate(declared)?;
        self.run(StateOperation::Apply, declared).await
    }

    /// Deletes every tracked resource in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Returns an error if another run holds the state lock or a delete
    /// fails.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        self.run(StateOperation::Destroy, &[]).await
    }

    /// Reads every applied resource back from the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn status(&self) -> Result<Vec<ResourceStatus>> {
        let state = self.load_state().await?;
        let mut statuses = Vec::with_capacity(state.resources.len());

        for resource in state.in_sequence() {
            let mut status = ResourceStatus {
                resource_id: resource.id.clone(),
                kind: resource.kind,
                provider_id: resource.provider_id.clone(),
                exists: false,
                drifted: false,
                health: None,
                error: None,
            };

            match self.provider.read(&resource.provider_id).await {
                Ok(record) => {
                    status.exists = true;
                    status.drifted =
                        self.hasher.hash_attributes(&record.attributes) != resource.attributes_hash;
                }
                Err(ProviderError::NotFound { .. }) => {
                    warn!("{} ({}) no longer exists", resource.id, resource.provider_id);
                }
                Err(e) => status.error = Some(e.to_string()),
            }

            if status.exists && resource.kind == ResourceKind::Service {
                match self.provider.health(&resource.provider_id).await {
                    Ok(health) => status.health = Some(health),
                    Err(e) => status.error = Some(e.to_string()),
                }
            }

            statuses.push(status);
        }

        Ok(statuses)
    }

    async fn run(&self, operation: StateOperation, declared: &[ResourceSpec]) -> Result<ReconciliationResult> {
        if self.options.dry_run {
            let state = self.load_state().await?;
            let change_set = self.diff_engine.compute(declared, &state)?;
            return Ok(ReconciliationResult::new(operation, change_set, vec![], true));
        }

        let lock = self.store.acquire_lock(&self.holder).await?;
        info!("Acquired state lock {} on {}", lock.lock_id, self.store.location());

        let result = self.run_locked(operation, declared, &lock.lock_id).await;

        match self.store.release_lock(&lock.lock_id).await {
            Ok(()) => debug!("Released state lock {}", lock.lock_id),
            Err(e) => warn!("Failed to release state lock {}: {e}", lock.lock_id),
        }

        result
    }

    async fn run_locked(
        &self,
        operation: StateOperation,
        declared: &[ResourceSpec],
        lock_id: &str,
    ) -> Result<ReconciliationResult> {
        let mut state = self.load_state().await?;
        let previous = state.clone();

        let change_set = self.diff_engine.compute(declared, &state)?;
        let report = ApplyExecutor::new(Arc::clone(&self.provider), self.store, self.options)
            .with_operation(operation)
            .with_lock(lock_id)
            .execute(&change_set, declared, &mut state)
            .await?;

        let mut result = ReconciliationResult::new(operation, change_set, report.completed, false);

        if operation == StateOperation::Apply && self.rollback.enabled && !result.completed.is_empty() {
            if let HealthVerdict::Failing {
                resource_id,
                reason,
                consecutive,
            } = self.supervise(&state, lock_id).await?
            {
                warn!("'{resource_id}' failed {consecutive} consecutive health checks, rolling back");
                let reverted = self.roll_back(&previous, &mut state, lock_id).await?;
                result.rollback = Some(RollbackOutcome {
                    resource_id,
                    reason,
                    reverted,
                });
            }
        }

        Ok(result)
    }

    /// Watches the applied services, refreshing the state lock every polling
    /// interval until a verdict is reached.
    async fn supervise(&self, state: &AppliedState, lock_id: &str) -> Result<HealthVerdict> {
        let targets: Vec<(String, String)> = state
            .in_sequence()
            .into_iter()
            .filter(|r| r.kind == ResourceKind::Service)
            .map(|r| (r.id.clone(), r.provider_id.clone()))
            .collect();

        let monitor = HealthMonitor::new(
            self.provider.as_ref(),
            self.rollback.failure_threshold,
            self.rollback.interval,
            self.rollback.max_checks,
        );

        let every = self.rollback.interval.max(Duration::from_millis(1));
        let keepalive = async {
            loop {
                tokio::time::sleep(every).await;
                if let Err(e) = self.store.refresh_lock(lock_id).await {
                    return e;
                }
            }
        };

        tokio::select! {
            verdict = monitor.watch(&targets) => Ok(verdict),
            lost = keepalive => {
                warn!("Stopped watching health: {lost}");
                Err(lost)
            }
        }
    }

    /// Re-applies `previous` as the declared set.
    async fn roll_back(
        &self,
        previous: &AppliedState,
        state: &mut AppliedState,
        lock_id: &str,
    ) -> Result<Vec<CompletedAction>> {
        let specs = previous.to_specs();
        let change_set = self
            .diff_engine
            .compute(&specs, state)
            .map_err(|e| rollback_failed(&e))?;

        info!("Rolling back {} step(s) to the previous applied state", change_set.step_count());

        let report = ApplyExecutor::new(Arc::clone(&self.provider), self.store, self.options)
            .with_operation(StateOperation::Rollback)
            .with_lock(lock_id)
            .execute(&change_set, &specs, state)
            .await
            .map_err(|e| rollback_failed(&e))?;

        info!("Rollback complete: {} action(s) reverted", report.completed.len());
        Ok(report.completed)
    }
}

fn rollback_failed(err: &StackformError) -> StackformError {
    StackformError::Reconcile(ReconcileError::RollbackFailed {
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApplyError, PlanError, StateError};
    use crate::provider::{InMemoryProvider, ProviderOperation, RetryPolicy};
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    fn project() -> ProjectConfig {
        ProjectConfig {
            name: String::from("shop"),
            environment: String::from("dev"),
        }
    }

    fn stack(count: u32) -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("C1", ResourceKind::Cluster).with_attr("name", "main"),
            ResourceSpec::new("T1", ResourceKind::TaskDefinition)
                .with_attr("cpu", 256)
                .with_attr("memory", 512)
                .with_attr("architecture", "X86_64")
                .depends_on("C1"),
            ResourceSpec::new("S1", ResourceKind::Service)
                .with_attr("cluster", "C1")
                .with_attr("task_definition", "T1")
                .with_attr("desired_count", count)
                .depends_on("T1")
                .depends_on("C1"),
        ]
    }

    fn options() -> ApplyOptions {
        ApplyOptions {
            retry: RetryPolicy::new(2, 1, 2),
            ..ApplyOptions::default()
        }
    }

    fn watch() -> RollbackPolicy {
        RollbackPolicy {
            enabled: true,
            failure_threshold: 2,
            interval: Duration::from_millis(1),
            max_checks: 5,
        }
    }

    fn reconciler<'a>(provider: &Arc<InMemoryProvider>, store: &'a LocalStateStore) -> Reconciler<'a> {
        let provider: Arc<dyn Provider> = provider.clone();
        Reconciler::new(provider, store, &project())
            .with_options(options())
            .with_holder("test-runner")
    }

    #[tokio::test]
    async fn test_plan_does_not_mutate() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());

        let change_set = reconciler(&provider, &store)
            .plan(&stack(3))
            .await
            .expect("Plan should succeed");

        assert_eq!(
            change_set.step_pairs(),
            vec![
                (String::from("C1"), ChangeAction::Create),
                (String::from("T1"), ChangeAction::Create),
                (String::from("S1"), ChangeAction::Create),
            ]
        );
        assert!(provider.calls().await.is_empty());
        assert!(!store.exists().await.expect("exists check failed"));
        assert!(store.get_lock_info().await.expect("Failed to read lock").is_none());
    }

    #[tokio::test]
    async fn test_plan_rejects_cycle() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        let rule = |id: &str, dep: &str| {
            ResourceSpec::new(id, ResourceKind::SecurityRule)
                .with_attr("rule_type", "ingress")
                .with_attr("port", 80)
                .depends_on(dep)
        };

        let err = reconciler(&provider, &store)
            .plan(&[rule("a", "b"), rule("b", "a")])
            .await
            .expect_err("Cycle should be rejected");

        assert!(matches!(err, StackformError::Plan(PlanError::Cycle { .. })));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_then_plan_converged() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        let reconciler = reconciler(&provider, &store);

        let result = tokio_test::assert_ok!(reconciler.apply(&stack(3)).await);
        assert_eq!(result.completed.len(), 3);
        assert!(!result.rolled_back());

        let state = store.load().await.expect("Failed to load state");
        assert_eq!(state.project, "shop");
        assert_eq!(state.environment, "dev");
        assert!(store.get_lock_info().await.expect("Failed to read lock").is_none());

        let again = reconciler.plan(&stack(3)).await.expect("Plan should succeed");
        assert!(again.is_converged());

        let update = reconciler.plan(&stack(5)).await.expect("Plan should succeed");
        assert_eq!(update.step_pairs(), vec![(String::from("S1"), ChangeAction::Update)]);
    }

    #[tokio::test]
    async fn test_apply_rejected_while_locked() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        store.acquire_lock("other-runner").await.expect("Failed to acquire lock");

        let err = reconciler(&provider, &store)
            .apply(&stack(3))
            .await
            .expect_err("Apply should fail");

        let StackformError::State(StateError::ConcurrentRun { holder, .. }) = err else {
            panic!("expected a concurrent run error, got {err}");
        };
        assert_eq!(holder, "other-runner");
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_abort() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        provider
            .fail_always(
                ProviderOperation::Create,
                "S1",
                ProviderError::Validation {
                    message: String::from("bad count"),
                },
            )
            .await;

        let err = reconciler(&provider, &store)
            .apply(&stack(3))
            .await
            .expect_err("Apply should fail");

        let StackformError::Apply(abort) = &err else {
            panic!("expected an apply abort, got {err}");
        };
        assert_eq!(abort.failed_resource(), "S1");
        let ApplyError::Aborted { completed, .. } = abort;
        assert_eq!(completed.len(), 2);
        assert!(store.get_lock_info().await.expect("Failed to read lock").is_none());
        let persisted = store.load().await.expect("Failed to load state");
        assert_eq!(persisted.resource_ids(), vec!["C1", "T1"]);
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_state() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());

        reconciler(&provider, &store)
            .apply(&stack(3))
            .await
            .expect("Initial apply should succeed");
        provider
            .script_health(
                "S1",
                vec![ResourceHealth::Unhealthy {
                    reason: String::from("targets failing"),
                }],
            )
            .await;

        let result = reconciler(&provider, &store)
            .with_rollback(watch())
            .apply(&stack(5))
            .await
            .expect("Apply should succeed and roll back");

        let rollback = result.rollback.as_ref().expect("Deployment should be rolled back");
        assert_eq!(rollback.resource_id, "S1");
        assert_eq!(rollback.reason, "targets failing");
        assert_eq!(
            rollback.reverted,
            vec![CompletedAction::new("S1", ChangeAction::Update)]
        );

        let live = provider.live_attributes("S1").await.expect("S1 should be live");
        assert_eq!(live.get("desired_count"), Some(&serde_json::json!(3)));

        let state = store.load().await.expect("Failed to load state");
        let service = state.get("S1").expect("S1 should be tracked");
        assert_eq!(service.attributes.get("desired_count"), Some(&serde_json::json!(3)));
        assert_eq!(state.history.last().map(|h| h.operation), Some(StateOperation::Rollback));
        assert!(store.get_lock_info().await.expect("Failed to read lock").is_none());
    }

    #[tokio::test]
    async fn test_healthy_apply_keeps_changes() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());

        let result = reconciler(&provider, &store)
            .with_rollback(watch())
            .apply(&stack(3))
            .await
            .expect("Apply should succeed");

        assert!(!result.rolled_back());
        let state = store.load().await.expect("Failed to load state");
        assert_eq!(state.resources.len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        let reconciler = reconciler(&provider, &store);
        reconciler.apply(&stack(3)).await.expect("Apply should succeed");

        let result = reconciler.destroy().await.expect("Destroy should succeed");

        assert_eq!(
            result.change_set.step_pairs(),
            vec![
                (String::from("S1"), ChangeAction::Delete),
                (String::from("T1"), ChangeAction::Delete),
                (String::from("C1"), ChangeAction::Delete),
            ]
        );
        assert!(provider.live_ids().await.is_empty());
        let state = store.load().await.expect("Failed to load state");
        assert!(state.is_empty());
        assert_eq!(state.history.last().map(|h| h.operation), Some(StateOperation::Destroy));
    }

    #[tokio::test]
    async fn test_dry_run_apply_makes_no_calls() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());

        let result = reconciler(&provider, &store)
            .with_options(ApplyOptions {
                dry_run: true,
                ..options()
            })
            .apply(&stack(3))
            .await
            .expect("Dry run should succeed");

        assert!(result.dry_run);
        assert_eq!(result.change_set.step_count(), 3);
        assert!(provider.calls().await.is_empty());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_status_reports_health_and_drift() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        let reconciler = reconciler(&provider, &store);
        reconciler.apply(&stack(3)).await.expect("Apply should succeed");
        provider
            .script_health(
                "S1",
                vec![ResourceHealth::Unhealthy {
                    reason: String::from("no healthy targets"),
                }],
            )
            .await;

        let statuses = reconciler.status().await.expect("Status should succeed");

        assert_eq!(provider.mutations().await.len(), 3);
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.exists && !s.drifted));
        assert!(statuses[0].health.is_none());
        assert!(statuses[2].health.as_ref().is_some_and(ResourceHealth::is_unhealthy));
        assert!(!statuses[2].is_ok());
    }

    #[tokio::test]
    async fn test_state_of_other_target_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        store
            .save(&AppliedState::new("billing", "prod"))
            .await
            .expect("Failed to save state");
        let provider = Arc::new(InMemoryProvider::new());

        let err = reconciler(&provider, &store)
            .plan(&stack(3))
            .await
            .expect_err("Foreign state should be rejected");

        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_lock_taken_during_health_watch_stops_run() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = Arc::new(InMemoryProvider::new());
        let slow_watch = RollbackPolicy {
            enabled: true,
            failure_threshold: 3,
            interval: Duration::from_millis(20),
            max_checks: 250,
        };
        let reconciler = reconciler(&provider, &store).with_rollback(slow_watch);

        let intruder = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            store.force_unlock().await.expect("Failed to force unlock");
            store.acquire_lock("intruder").await.expect("Failed to acquire lock")
        };
        let declared = stack(3);
        let (result, intruder_lock) = tokio::join!(reconciler.apply(&declared), intruder);

        let err = result.expect_err("Run should stop once its lock is gone");
        assert!(matches!(err, StackformError::State(StateError::LockLost { .. })));

        let held = store
            .get_lock_info()
            .await
            .expect("Failed to read lock")
            .expect("Intruder lock should survive");
        assert_eq!(held.lock_id, intruder_lock.lock_id);
        assert_eq!(store.load().await.expect("Failed to load state").resources.len(), 3);
    }
}
