//! Applied state types.
//!
//! `AppliedState` is the last configuration successfully realised against
//! the provider. Only the apply executor mutates it, one provider call at a
//! time, so it always matches what actually exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::planner::CompletedAction;
use crate::resource::{Attributes, ResourceKind, ResourceSpec};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept in the state document.
pub const MAX_HISTORY: usize = 100;

/// The complete applied state of one deployment target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Fingerprint of the declared set last applied in full.
    #[serde(default)]
    pub fingerprint: String,
    /// Applied resources keyed by id.
    #[serde(default)]
    pub resources: BTreeMap<String, AppliedResource>,
    /// Sequence number handed to the next newly created resource.
    #[serde(default)]
    pub next_sequence: u64,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// A single applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedResource {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Hash of the attributes when applied.
    pub attributes_hash: String,
    /// Attributes as applied.
    #[serde(default)]
    pub attributes: Attributes,
    /// Dependencies as applied.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Creation sequence; preserved across updates.
    pub sequence: u64,
    /// When the resource was last created or updated.
    pub applied_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: StateOperation,
    /// Fingerprint of the declared set.
    pub fingerprint: String,
    /// Actions that completed.
    pub completed: Vec<CompletedAction>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateOperation {
    /// Converge to the declared set.
    Apply,
    /// Delete everything tracked.
    Destroy,
    /// Revert to the previous applied state.
    Rollback,
}

impl AppliedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            fingerprint: String::new(),
            resources: BTreeMap::new(),
            next_sequence: 0,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns true if no resources are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Gets a resource by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&AppliedResource> {
        self.resources.get(id)
    }

    /// Records a successful create or update of `spec`.
    ///
    /// An update keeps the original sequence number so the resource keeps
    /// its place in the applied creation order.
    pub fn record_applied(&mut self, spec: &ResourceSpec, provider_id: &str, attributes_hash: &str) {
        let sequence = match self.resources.get(&spec.id) {
            Some(existing) => existing.sequence,
            None => {
                let seq = self.next_sequence;
                self.next_sequence += 1;
                seq
            }
        };

        self.resources.insert(
            spec.id.clone(),
            AppliedResource {
                id: spec.id.clone(),
                kind: spec.kind,
                provider_id: provider_id.to_string(),
                attributes_hash: attributes_hash.to_string(),
                attributes: spec.attributes.clone(),
                depends_on: spec.depends_on.clone(),
                sequence,
                applied_at: Utc::now(),
            },
        );
        self.last_updated = Utc::now();
    }

    /// Removes a resource by id.
    pub fn remove(&mut self, id: &str) -> Option<AppliedResource> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Applied resources in creation order.
    #[must_use]
    pub fn in_sequence(&self) -> Vec<&AppliedResource> {
        let mut resources: Vec<&AppliedResource> = self.resources.values().collect();
        resources.sort_by_key(|r| r.sequence);
        resources
    }

    /// Converts the applied resources back into specs, in creation order.
    #[must_use]
    pub fn to_specs(&self) -> Vec<ResourceSpec> {
        self.in_sequence()
            .into_iter()
            .map(AppliedResource::to_spec)
            .collect()
    }

    /// Copies `depends_on` from the declared specs onto tracked resources.
    ///
    /// Dependency edges do not participate in the attribute hash, so a
    /// resource whose only change is its edges stays `Noop`; this keeps the
    /// recorded graph current for the next deletion order.
    pub fn refresh_edges(&mut self, declared: &[ResourceSpec]) {
        let mut changed = false;
        for spec in declared {
            if let Some(resource) = self.resources.get_mut(&spec.id)
                && resource.depends_on != spec.depends_on
            {
                resource.depends_on = spec.depends_on.clone();
                changed = true;
            }
        }
        if changed {
            self.last_updated = Utc::now();
        }
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl AppliedResource {
    /// Rebuilds the spec this resource was applied from.
    #[must_use]
    pub fn to_spec(&self) -> ResourceSpec {
        ResourceSpec {
            id: self.id.clone(),
            kind: self.kind,
            attributes: self.attributes.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: StateOperation, fingerprint: &str, completed: Vec<CompletedAction>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            fingerprint: fingerprint.to_string(),
            completed,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: StateOperation,
        fingerprint: &str,
        completed: Vec<CompletedAction>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            fingerprint: fingerprint.to_string(),
            completed,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for StateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Rollback => "rollback",
        };
        write!(f, "{op}")
    }
}
