//! Change planning and execution.
//!
//! Compares the declared resources with the applied state, orders the
//! resulting actions by dependency, and drives them through a provider.

mod diff;
mod executor;
mod graph;
mod plan;

pub use diff::DiffEngine;
pub use executor::{ApplyExecutor, ApplyOptions, ApplyReport};
pub use graph::{DependencyGraph, DependencyPlanner};
pub use plan::{ChangeAction, ChangeSet, ChangeSetEntry, CompletedAction, PlanStep};
