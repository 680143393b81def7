//! Resource model.
//!
//! Typed descriptions of every infrastructure object in the managed
//! topology, their per-kind attribute rules, structural validation and
//! attribute hashing.

mod hash;
mod model;
mod schema;
mod validate;

pub use hash::ResourceHasher;
pub use model::{Attributes, ResourceKind, ResourceSpec};
pub use schema::KindSchema;
pub use validate::{ResourceIssue, ResourceValidator};
