//! Change set types and construction.
//!
//! A change set holds one diff entry per resource id plus the executable
//! sequence derived from it. Execution runs in two phases: every delete
//! (including the delete half of a replace) in reverse creation order of the
//! applied graph, then every create and update in creation order of the
//! declared graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::Result;
use crate::resource::{ResourceKind, ResourceSpec};
use crate::state::AppliedState;

use super::graph::DependencyGraph;

/// Action computed for one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Resource is declared but not applied.
    Create,
    /// Resource changed only in attributes that can be modified in place.
    Update,
    /// Resource must be deleted and created again.
    Replace,
    /// Resource is applied but no longer declared.
    Delete,
    /// Resource is unchanged.
    Noop,
}

/// Diff result for a single resource.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChangeSetEntry {
    /// Resource id.
    pub resource_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Action to take.
    pub action: ChangeAction,
    /// Why this action was chosen.
    pub reason: String,
    /// Attributes that differ from the applied state.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_attributes: Vec<String>,
}

/// One executable step of a change set.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanStep {
    /// Resource id.
    pub resource_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// `Create`, `Update` or `Delete`.
    pub action: ChangeAction,
    /// Dependency level within the step's phase.
    pub level: usize,
    /// True if this step is one half of a replace.
    pub replacement: bool,
    /// Why this step exists.
    pub reason: String,
}

/// A step that completed during an apply run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedAction {
    /// Resource id.
    pub resource_id: String,
    /// Action that completed.
    pub action: ChangeAction,
}

/// Complete change set.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSet {
    /// When the change set was computed.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the declared set.
    pub fingerprint: String,
    /// One entry per resource id: declared ids first, then removed ones.
    pub entries: Vec<ChangeSetEntry>,
    /// Executable steps in order. `Noop` entries do not appear here.
    pub steps: Vec<PlanStep>,
}

impl ChangeSet {
    /// Builds the change set, deriving the executable sequence from the diff
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns a cycle error if the declared graph is cyclic. A cyclic
    /// applied graph is torn down in reverse creation order instead.
    pub fn build(
        fingerprint: &str,
        entries: Vec<ChangeSetEntry>,
        declared: &[ResourceSpec],
        applied: &AppliedState,
    ) -> Result<Self> {
        let by_id: HashMap<&str, &ChangeSetEntry> = entries
            .iter()
            .map(|e| (e.resource_id.as_str(), e))
            .collect();

        let mut steps = Vec::new();

        // Phase 1: deletes, dependents first.
        let (teardown, teardown_levels) = Self::teardown_order(applied);
        for id in teardown {
            let Some(entry) = by_id.get(id.as_str()) else {
                continue;
            };
            if matches!(entry.action, ChangeAction::Delete | ChangeAction::Replace) {
                steps.push(PlanStep {
                    level: teardown_levels.get(&id).copied().unwrap_or(0),
                    resource_id: id,
                    kind: applied.get(&entry.resource_id).map_or(entry.kind, |r| r.kind),
                    action: ChangeAction::Delete,
                    replacement: entry.action == ChangeAction::Replace,
                    reason: entry.reason.clone(),
                });
            }
        }

        // Phase 2: creates and updates, dependencies first.
        let declared_graph = DependencyGraph::new(declared);
        let levels = declared_graph.level_of(false)?;
        for id in declared_graph.topological_order()? {
            let Some(entry) = by_id.get(id.as_str()) else {
                continue;
            };
            let action = match entry.action {
                ChangeAction::Create | ChangeAction::Replace => ChangeAction::Create,
                ChangeAction::Update => ChangeAction::Update,
                ChangeAction::Delete | ChangeAction::Noop => continue,
            };
            steps.push(PlanStep {
                level: levels.get(&id).copied().unwrap_or(0),
                resource_id: id,
                kind: entry.kind,
                action,
                replacement: entry.action == ChangeAction::Replace,
                reason: entry.reason.clone(),
            });
        }

        Ok(Self {
            created_at: Utc::now(),
            fingerprint: fingerprint.to_string(),
            entries,
            steps,
        })
    }

    /// Deletion order of the applied resources and the level of each.
    ///
    /// Falls back to reverse creation order, one resource per level, if the
    /// recorded edges form a cycle.
    fn teardown_order(applied: &AppliedState) -> (Vec<String>, HashMap<String, usize>) {
        let applied_specs = applied.to_specs();
        let applied_graph = DependencyGraph::new(&applied_specs);

        match (applied_graph.topological_order(), applied_graph.level_of(true)) {
            (Ok(mut order), Ok(levels)) => {
                order.reverse();
                (order, levels)
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Applied dependency graph is unusable ({e}), tearing down in reverse creation order");
                let order: Vec<String> = applied_specs.into_iter().rev().map(|s| s.id).collect();
                let levels = order.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();
                (order, levels)
            }
        }
    }

    /// Returns true if there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of executable steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Counts diff entries with the given action.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Gets the diff entry for a resource.
    #[must_use]
    pub fn entry(&self, resource_id: &str) -> Option<&ChangeSetEntry> {
        self.entries.iter().find(|e| e.resource_id == resource_id)
    }

    /// Returns the steps as `(resource_id, action)` pairs.
    #[must_use]
    pub fn step_pairs(&self) -> Vec<(String, ChangeAction)> {
        self.steps
            .iter()
            .map(|s| (s.resource_id.clone(), s.action))
            .collect()
    }

    /// Returns true if every entry is `Noop`.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.iter().all(|e| e.action == ChangeAction::Noop)
    }
}

impl PlanStep {
    /// Returns true for steps that run in the delete phase.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.action == ChangeAction::Delete
    }

    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        let verb = match self.action {
            ChangeAction::Create => "Create",
            ChangeAction::Update => "Update",
            ChangeAction::Delete => "Delete",
            ChangeAction::Replace => "Replace",
            ChangeAction::Noop => "Keep",
        };
        format!("{verb} {} '{}'", self.kind, self.resource_id)
    }
}

impl CompletedAction {
    /// Creates a completed action record.
    #[must_use]
    pub fn new(resource_id: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            resource_id: resource_id.into(),
            action,
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.resource_id)?;
        if self.replacement {
            write!(f, " (replace)")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for CompletedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.resource_id)
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Change set ({} steps):", self.steps.len())?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}. {step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, kind: ResourceKind, action: ChangeAction) -> ChangeSetEntry {
        ChangeSetEntry {
            resource_id: id.to_string(),
            kind,
            action,
            reason: String::new(),
            changed_attributes: vec![],
        }
    }

    fn stack() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("C1", ResourceKind::Cluster),
            ResourceSpec::new("T1", ResourceKind::TaskDefinition).depends_on("C1"),
            ResourceSpec::new("S1", ResourceKind::Service)
                .depends_on("T1")
                .depends_on("C1"),
        ]
    }

    fn applied(specs: &[ResourceSpec]) -> AppliedState {
        let mut state = AppliedState::new("demo", "dev");
        for spec in specs {
            state.record_applied(spec, &format!("{}-pid", spec.id), "h");
        }
        state
    }

    #[test]
    fn test_replace_splits_into_delete_then_create() {
        let specs = stack();
        let entries = vec![
            entry("C1", ResourceKind::Cluster, ChangeAction::Noop),
            entry("T1", ResourceKind::TaskDefinition, ChangeAction::Replace),
            entry("S1", ResourceKind::Service, ChangeAction::Replace),
        ];
        let set = ChangeSet::build("fp", entries, &specs, &applied(&specs)).expect("Failed to build change set");

        assert_eq!(
            set.step_pairs(),
            vec![
                (String::from("S1"), ChangeAction::Delete),
                (String::from("T1"), ChangeAction::Delete),
                (String::from("T1"), ChangeAction::Create),
                (String::from("S1"), ChangeAction::Create),
            ]
        );
        assert!(set.steps.iter().all(|s| s.replacement));
    }

    #[test]
    fn test_noop_not_executable() {
        let specs = stack();
        let entries = specs
            .iter()
            .map(|s| entry(&s.id, s.kind, ChangeAction::Noop))
            .collect();
        let set = ChangeSet::build("fp", entries, &specs, &applied(&specs)).expect("Failed to build change set");
        assert!(set.is_empty());
        assert!(set.is_converged());
        assert_eq!(set.count(ChangeAction::Noop), 3);
    }

    #[test]
    fn test_delete_uses_applied_graph() {
        let old = stack();
        let entries = vec![
            entry("C1", ResourceKind::Cluster, ChangeAction::Delete),
            entry("T1", ResourceKind::TaskDefinition, ChangeAction::Delete),
            entry("S1", ResourceKind::Service, ChangeAction::Delete),
        ];
        let set = ChangeSet::build("fp", entries, &[], &applied(&old)).expect("Failed to build change set");
        let ids: Vec<&str> = set.steps.iter().map(|s| s.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "T1", "C1"]);
        let levels: Vec<usize> = set.steps.iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![0, 1, 2]);
    }

    #[test]
    fn test_cyclic_applied_graph_tears_down_in_reverse_sequence() {
        let mut state = applied(&[
            ResourceSpec::new("A", ResourceKind::Cluster),
            ResourceSpec::new("B", ResourceKind::Cluster).depends_on("A"),
        ]);
        if let Some(a) = state.resources.get_mut("A") {
            a.depends_on.insert(String::from("B"));
        }
        let entries = vec![
            entry("A", ResourceKind::Cluster, ChangeAction::Delete),
            entry("B", ResourceKind::Cluster, ChangeAction::Delete),
        ];

        let set = ChangeSet::build("fp", entries, &[], &state).expect("Cyclic state should still plan");

        let ids: Vec<&str> = set.steps.iter().map(|s| s.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        let levels: Vec<usize> = set.steps.iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![0, 1]);
    }

    #[test]
    fn test_display() {
        let specs = stack();
        let entries = specs
            .iter()
            .map(|s| entry(&s.id, s.kind, ChangeAction::Create))
            .collect();
        let set = ChangeSet::build("fp", entries, &specs, &AppliedState::new("d", "e"))
            .expect("Failed to build change set");
        let text = set.to_string();
        assert!(text.contains("0. create C1"));
        assert!(text.contains("2. create S1"));
    }
}
