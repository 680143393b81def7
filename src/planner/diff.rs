//! Diff engine for comparing declared specs against applied state.
//!
//! Classification per resource id:
//! - declared only: `Create`
//! - applied only: `Delete`
//! - same attribute hash: `Noop`
//! - only in-place mutable attributes changed: `Update`
//! - anything else: `Replace`
//!
//! A replaced resource takes every dependent that still declares the edge
//! with it: those dependents are replaced too, since they would otherwise
//! point at a resource that no longer exists. A dependent that dropped the
//! edge keeps its own classification; the delete phase already tears down
//! in applied-graph order.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::error::Result;
use crate::resource::{ResourceHasher, ResourceSpec};
use crate::state::{AppliedResource, AppliedState};

use super::plan::{ChangeAction, ChangeSet, ChangeSetEntry};

/// Engine for computing change sets.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Attribute hasher.
    hasher: ResourceHasher,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ResourceHasher::new(),
        }
    }

    /// Computes the change set between the declared specs and the applied
    /// state. Never mutates anything.
    ///
    /// # Errors
    ///
    /// Returns a cycle error if the declared graph is cyclic.
    pub fn compute(&self, declared: &[ResourceSpec], applied: &AppliedState) -> Result<ChangeSet> {
        let mut entries: Vec<ChangeSetEntry> = declared
            .iter()
            .map(|spec| self.diff_resource(spec, applied.get(&spec.id)))
            .collect();

        let declared_ids: HashSet<&str> = declared.iter().map(|s| s.id.as_str()).collect();
        for resource in applied.in_sequence() {
            if !declared_ids.contains(resource.id.as_str()) {
                debug!("Resource {} is no longer declared", resource.id);
                entries.push(ChangeSetEntry {
                    resource_id: resource.id.clone(),
                    kind: resource.kind,
                    action: ChangeAction::Delete,
                    reason: String::from("Removed from configuration"),
                    changed_attributes: vec![],
                });
            }
        }

        Self::cascade_replacements(&mut entries, declared);

        let fingerprint = self.hasher.fingerprint(declared);
        let change_set = ChangeSet::build(&fingerprint, entries, declared, applied)?;

        debug!(
            "Diff: {} create, {} update, {} replace, {} delete, {} unchanged",
            change_set.count(ChangeAction::Create),
            change_set.count(ChangeAction::Update),
            change_set.count(ChangeAction::Replace),
            change_set.count(ChangeAction::Delete),
            change_set.count(ChangeAction::Noop),
        );

        Ok(change_set)
    }

    /// Classifies a single declared resource.
    fn diff_resource(&self, spec: &ResourceSpec, applied: Option<&AppliedResource>) -> ChangeSetEntry {
        let entry = |action, reason: String, changed_attributes| ChangeSetEntry {
            resource_id: spec.id.clone(),
            kind: spec.kind,
            action,
            reason,
            changed_attributes,
        };

        let Some(applied) = applied else {
            debug!("{spec} needs to be created");
            return entry(ChangeAction::Create, String::from("Not yet applied"), vec![]);
        };

        if applied.kind != spec.kind {
            return entry(
                ChangeAction::Replace,
                format!("Kind changed from {} to {}", applied.kind, spec.kind),
                vec![],
            );
        }

        let new_hash = self.hasher.attributes_hash(spec);
        if ResourceHasher::hashes_match(&new_hash, &applied.attributes_hash) {
            return entry(ChangeAction::Noop, String::from("Up to date"), vec![]);
        }

        let changed = spec.changed_attributes(&applied.attributes);
        if changed.is_empty() {
            // The hash moved but no attribute differs: the recorded attributes
            // cannot be trusted, so do not guess that an update is enough.
            return entry(
                ChangeAction::Replace,
                String::from("Attribute hash changed"),
                vec![],
            );
        }

        let immutable: Vec<&str> = changed
            .iter()
            .map(String::as_str)
            .filter(|attr| !spec.kind.is_mutable(attr))
            .collect();

        if immutable.is_empty() {
            debug!("{spec} can be updated in place: {}", changed.join(", "));
            let reason = format!("Changed: {}", changed.join(", "));
            entry(ChangeAction::Update, reason, changed)
        } else {
            debug!("{spec} must be replaced: {}", immutable.join(", "));
            let reason = format!("Immutable attribute changed: {}", immutable.join(", "));
            entry(ChangeAction::Replace, reason, changed)
        }
    }

    /// Replaces every `Noop` or `Update` resource whose declared spec
    /// depends, directly or transitively, on a resource being deleted or
    /// replaced.
    fn cascade_replacements(entries: &mut [ChangeSetEntry], declared: &[ResourceSpec]) {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for spec in declared {
            for dep in &spec.depends_on {
                dependents.entry(dep.as_str()).or_default().push(spec.id.as_str());
            }
        }

        let index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.resource_id.clone(), i))
            .collect();

        let mut queue: VecDeque<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.action, ChangeAction::Replace | ChangeAction::Delete))
            .map(|(i, _)| i)
            .collect();

        while let Some(i) = queue.pop_front() {
            let cause = entries[i].resource_id.clone();
            let verb = if entries[i].action == ChangeAction::Delete {
                "removed"
            } else {
                "replaced"
            };
            let Some(children) = dependents.get(cause.as_str()) else {
                continue;
            };
            for child in children {
                let Some(&j) = index.get(*child) else {
                    continue;
                };
                if matches!(entries[j].action, ChangeAction::Noop | ChangeAction::Update) {
                    debug!("{} replaced because dependency {cause} is {verb}", entries[j].resource_id);
                    entries[j].action = ChangeAction::Replace;
                    entries[j].reason = format!("Dependency {cause} {verb}");
                    queue.push_back(j);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

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

    fn applied(specs: &[ResourceSpec]) -> AppliedState {
        let hasher = ResourceHasher::new();
        let mut state = AppliedState::new("demo", "dev");
        for spec in specs {
            state.record_applied(spec, &format!("{}-pid", spec.id), &hasher.attributes_hash(spec));
        }
        state
    }

    fn pairs(set: &ChangeSet) -> Vec<(String, ChangeAction)> {
        set.step_pairs()
    }

    fn pair(id: &str, action: ChangeAction) -> (String, ChangeAction) {
        (id.to_string(), action)
    }

    #[test]
    fn test_empty_state_creates_in_order() {
        let declared = vec![cluster(), task("X86_64"), service(3)];
        let set = DiffEngine::new()
            .compute(&declared, &AppliedState::new("demo", "dev"))
            .expect("Diff should succeed");

        assert_eq!(
            pairs(&set),
            vec![
                pair("C1", ChangeAction::Create),
                pair("T1", ChangeAction::Create),
                pair("S1", ChangeAction::Create),
            ]
        );
    }

    #[test]
    fn test_desired_count_is_update_only() {
        let state = applied(&[cluster(), task("X86_64"), service(3)]);
        let declared = vec![cluster(), task("X86_64"), service(5)];
        let set = DiffEngine::new().compute(&declared, &state).expect("Diff should succeed");

        assert_eq!(pairs(&set), vec![pair("S1", ChangeAction::Update)]);
        let entry = set.entry("S1").expect("Service entry");
        assert_eq!(entry.changed_attributes, vec!["desired_count"]);
    }

    #[test]
    fn test_architecture_change_replaces_task_and_dependents() {
        let state = applied(&[cluster(), task("X86_64"), service(3)]);
        let declared = vec![cluster(), task("ARM64"), service(3)];
        let set = DiffEngine::new().compute(&declared, &state).expect("Diff should succeed");

        assert_eq!(set.entry("T1").map(|e| e.action), Some(ChangeAction::Replace));
        assert_eq!(set.entry("S1").map(|e| e.action), Some(ChangeAction::Replace));
        assert_eq!(set.entry("C1").map(|e| e.action), Some(ChangeAction::Noop));
        assert_eq!(
            pairs(&set),
            vec![
                pair("S1", ChangeAction::Delete),
                pair("T1", ChangeAction::Delete),
                pair("T1", ChangeAction::Create),
                pair("S1", ChangeAction::Create),
            ]
        );
    }

    #[test]
    fn test_immutable_change_never_update() {
        let state = applied(&[cluster(), task("X86_64"), service(3)]);
        let mut svc = service(5);
        svc.set_attr("launch_type", "FARGATE");
        let set = DiffEngine::new()
            .compute(&[cluster(), task("X86_64"), svc], &state)
            .expect("Diff should succeed");

        let entry = set.entry("S1").expect("Service entry");
        assert_eq!(entry.action, ChangeAction::Replace);
        assert!(entry.reason.contains("launch_type"));
    }

    #[test]
    fn test_removed_resource_deleted() {
        let state = applied(&[cluster(), task("X86_64"), service(3)]);
        let set = DiffEngine::new()
            .compute(&[cluster(), task("X86_64")], &state)
            .expect("Diff should succeed");

        assert_eq!(pairs(&set), vec![pair("S1", ChangeAction::Delete)]);
    }

    #[test]
    fn test_dropped_dependency_keeps_dependent() {
        let lb = ResourceSpec::new("LB", ResourceKind::LoadBalancer).with_attr("internet_facing", true);
        let svc = service(3).depends_on("LB");
        let state = applied(&[cluster(), task("X86_64"), lb, svc]);

        let set = DiffEngine::new()
            .compute(&[cluster(), task("X86_64"), service(3)], &state)
            .expect("Diff should succeed");

        assert_eq!(set.entry("LB").map(|e| e.action), Some(ChangeAction::Delete));
        assert_eq!(set.entry("S1").map(|e| e.action), Some(ChangeAction::Noop));
        assert_eq!(pairs(&set), vec![pair("LB", ChangeAction::Delete)]);
    }

    #[test]
    fn test_dropped_dependency_with_update_is_not_replaced() {
        let rule = ResourceSpec::new("R1", ResourceKind::SecurityRule)
            .with_attr("rule_type", "ingress")
            .with_attr("port", 80);
        let state = applied(&[cluster(), task("X86_64"), rule, service(3).depends_on("R1")]);

        let set = DiffEngine::new()
            .compute(&[cluster(), task("X86_64"), service(4)], &state)
            .expect("Diff should succeed");

        assert_eq!(
            pairs(&set),
            vec![pair("R1", ChangeAction::Delete), pair("S1", ChangeAction::Update)]
        );
    }

    #[test]
    fn test_replace_cascades_through_declared_dependents() {
        let listener = ResourceSpec::new("L1", ResourceKind::Listener)
            .with_attr("port", 80)
            .depends_on("S1");
        let state = applied(&[cluster(), task("X86_64"), service(3), listener.clone()]);

        let set = DiffEngine::new()
            .compute(&[cluster(), task("ARM64"), service(3), listener], &state)
            .expect("Diff should succeed");

        assert_eq!(set.entry("S1").map(|e| e.action), Some(ChangeAction::Replace));
        let listener = set.entry("L1").expect("Listener entry");
        assert_eq!(listener.action, ChangeAction::Replace);
        assert_eq!(listener.reason, "Dependency S1 replaced");
    }

    #[test]
    fn test_diff_is_idempotent() {
        let state = applied(&[cluster(), task("X86_64"), service(3)]);
        let declared = vec![cluster(), task("ARM64"), service(4)];
        let engine = DiffEngine::new();

        let first = engine.compute(&declared, &state).expect("First diff");
        let second = engine.compute(&declared, &state).expect("Second diff");

        assert_eq!(first.entries, second.entries);
        assert_eq!(first.steps, second.steps);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_unchanged_is_noop() {
        let declared = vec![cluster(), task("X86_64"), service(3)];
        let state = applied(&declared);
        let set = DiffEngine::new().compute(&declared, &state).expect("Diff should succeed");
        assert!(set.is_converged());
        assert!(set.is_empty());
    }

    #[test]
    fn test_kind_change_replaces() {
        let state = applied(&[cluster()]);
        let renamed = ResourceSpec::new("C1", ResourceKind::LoadBalancer).with_attr("internet_facing", true);
        let set = DiffEngine::new().compute(&[renamed], &state).expect("Diff should succeed");
        assert_eq!(set.entry("C1").map(|e| e.action), Some(ChangeAction::Replace));
    }

    #[test]
    fn test_hash_drift_without_attribute_diff_replaces() {
        let mut state = applied(&[cluster()]);
        if let Some(resource) = state.resources.get_mut("C1") {
            resource.attributes_hash = String::from("stale");
        }
        let set = DiffEngine::new().compute(&[cluster()], &state).expect("Diff should succeed");
        assert_eq!(set.entry("C1").map(|e| e.action), Some(ChangeAction::Replace));
    }

    #[test]
    fn test_cycle_rejected() {
        let a = ResourceSpec::new("a", ResourceKind::Cluster).depends_on("b");
        let b = ResourceSpec::new("b", ResourceKind::Cluster).depends_on("a");
        let err = DiffEngine::new()
            .compute(&[a, b], &AppliedState::new("demo", "dev"))
            .expect_err("Cyclic declared set should be rejected");
        assert!(err.to_string().contains("cycle"));
    }
}
