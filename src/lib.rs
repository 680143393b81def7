// ============================================================================
// Linting
// ============================================================================

#![warn(missing_docs)]                // All public items must be documented
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackform
//!
//! A desired-state reconciler for a container service stack: cluster, task
//! definition, container, service, load balancer, listener, autoscaling
//! policy and security rules.
//!
//! ## Overview
//!
//! - Declare the stack once in `stackform.yaml`, parameterized by
//!   architecture, image source and feature toggles
//! - Compute a change set against the last applied state
//! - Apply it in dependency order, persisting state after every provider call
//! - Optionally watch services after apply and roll back on sustained failure
//!
//! ## Architecture
//!
//! 1. **Desired state**: resource specs built from the configuration
//! 2. **Applied state**: what the last successful provider calls produced
//! 3. **Reconciler**: diffs the two and drives the provider to converge
//!
//! ## Modules
//!
//! - [`resource`]: Resource kinds, per-kind schema, validation and hashing
//! - [`config`]: Configuration parsing, validation and the topology template
//! - [`planner`]: Dependency ordering, diffing and the apply executor
//! - [`provider`]: Control plane collaborator, retries and health supervision
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`reconciler`]: Plan, apply, destroy and rollback under the state lock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: prod
//!
//! topology:
//!   architecture: arm64
//!   image:
//!     source: repository
//!     name: shop-api
//!     tag: "2024.06"
//!   enable_autoscaling: true
//!   service:
//!     desired_count: 3
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, StackConfig, TopologyTemplate};
pub use error::{Result, StackformError};
pub use planner::{ApplyExecutor, ChangeSet, DependencyPlanner, DiffEngine};
pub use provider::{HttpProvider, InMemoryProvider, Provider};
pub use reconciler::{ReconciliationResult, Reconciler, RollbackPolicy};
pub use resource::{ResourceKind, ResourceSpec, ResourceValidator};
pub use state::{AppliedState, LocalStateStore, S3StateStore, StateStore};
