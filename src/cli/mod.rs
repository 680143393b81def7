//! CLI module for the stackform reconciler.
//!
//! This module provides the command-line interface for planning, applying
//! and destroying the declared stack.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
