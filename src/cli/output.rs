//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::error::ApplyError;
use crate::planner::{ChangeAction, ChangeSet, CompletedAction};
use crate::reconciler::{ReconciliationResult, ResourceStatus};
use crate::resource::ResourceHasher;
use crate::state::{AppliedState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Diff entry row for the detailed plan.
#[derive(Tabled)]
struct DiffEntryRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Diff")]
    action: String,
    #[tabled(rename = "Changed")]
    changed: String,
}

/// Applied resource row for state display.
#[derive(Tabled)]
struct AppliedRow {
    #[tabled(rename = "#")]
    sequence: u64,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
}

/// Resource status row.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Serialize)]
struct GraphJson<'a> {
    levels: &'a [Vec<String>],
}

#[derive(Serialize)]
struct AbortJson<'a> {
    status: &'static str,
    resource_id: &'a str,
    action: ChangeAction,
    error: String,
    completed: &'a [CompletedAction],
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a change set for display.
    #[must_use]
    pub fn format_plan(&self, change_set: &ChangeSet, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(change_set),
            OutputFormat::Text => Self::format_plan_text(change_set, detailed),
        }
    }

    fn format_plan_text(change_set: &ChangeSet, detailed: bool) -> String {
        if change_set.is_converged() {
            return format!(
                "{} No changes required - {} resource(s) up to date.\n",
                "✓".green(),
                change_set.count(ChangeAction::Noop)
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nChange set");
        let _ = write!(
            output,
            "   Fingerprint: {}\n\n",
            ResourceHasher::short_hash(&change_set.fingerprint)
        );

        let rows: Vec<PlanStepRow> = change_set
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| PlanStepRow {
                index: i + 1,
                action: if step.replacement {
                    format!("{} {}", Self::format_action(step.action), "(replace)".dimmed())
                } else {
                    Self::format_action(step.action)
                },
                resource: step.resource_id.clone(),
                kind: step.kind.to_string(),
                level: step.level,
                reason: truncate(&step.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            let rows: Vec<DiffEntryRow> = change_set
                .entries
                .iter()
                .map(|entry| DiffEntryRow {
                    resource: entry.resource_id.clone(),
                    action: Self::format_action(entry.action),
                    changed: entry.changed_attributes.join(", "),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            change_set.count(ChangeAction::Create).to_string().green(),
            change_set.count(ChangeAction::Update).to_string().yellow(),
            change_set.count(ChangeAction::Replace).to_string().magenta(),
            change_set.count(ChangeAction::Delete).to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_result(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let marker = if result.rolled_back() {
                    "⚠".yellow()
                } else {
                    "✓".green()
                };
                let mut output = format!("{marker} {result}");
                if !result.completed.is_empty() {
                    output.push_str("\n   Completed:\n");
                    for action in &result.completed {
                        let _ = writeln!(output, "     {} {}", Self::format_action(action.action), action.resource_id);
                    }
                }
                output
            }
        }
    }

    /// Formats an aborted run: the failing action and every action that
    /// completed before it.
    #[must_use]
    pub fn format_abort(&self, err: &ApplyError) -> String {
        let ApplyError::Aborted {
            resource_id,
            action,
            source,
            completed,
        } = err;

        match self.format {
            OutputFormat::Json => to_json(&AbortJson {
                status: "aborted",
                resource_id,
                action: *action,
                error: source.to_string(),
                completed,
            }),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Aborted at {} {}: {source}",
                    "✗".red(),
                    Self::format_action(*action),
                    resource_id
                );
                if completed.is_empty() {
                    output.push_str("\n   Nothing was changed before the failure.");
                } else {
                    let _ = write!(output, "\n   Completed before the failure ({}):", completed.len());
                    for done in completed {
                        let _ = write!(output, "\n     {} {}", Self::format_action(done.action), done.resource_id);
                    }
                }
                output
            }
        }
    }

    /// Formats applied state.
    #[must_use]
    pub fn format_state(&self, state: &AppliedState, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Fingerprint: {}", ResourceHasher::short_hash(&state.fingerprint));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = writeln!(
                            output,
                            "   Lock: {} held by {} ({}s left)",
                            lock.lock_id,
                            lock.holder,
                            lock.remaining_secs()
                        );
                    }
                    Some(lock) => {
                        let _ = writeln!(output, "   Lock: {} (expired)", lock.lock_id);
                    }
                    None => {}
                }

                if !state.is_empty() {
                    let rows: Vec<AppliedRow> = state
                        .in_sequence()
                        .into_iter()
                        .map(|r| AppliedRow {
                            sequence: r.sequence,
                            resource: r.id.clone(),
                            kind: r.kind.to_string(),
                            provider_id: r.provider_id.clone(),
                            hash: ResourceHasher::short_hash(&r.attributes_hash),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {:?} ({} action(s))",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.completed.len()
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "       {}", truncate(error, 80));
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats the live status of applied resources.
    #[must_use]
    pub fn format_status(&self, target: &str, statuses: &[ResourceStatus]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&statuses),
            OutputFormat::Text => {
                let mut output = format!("\nStack: {target}\n\n");

                if statuses.is_empty() {
                    output.push_str("   No resources applied.\n");
                    return output;
                }

                let rows: Vec<StatusRow> = statuses
                    .iter()
                    .map(|s| StatusRow {
                        resource: s.resource_id.clone(),
                        kind: s.kind.to_string(),
                        provider_id: truncate(&s.provider_id, 24),
                        status: Self::format_resource_status(s),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let failing = statuses.iter().filter(|s| !s.is_ok()).count();
                let summary = if failing == 0 {
                    "healthy".green().to_string()
                } else {
                    format!("{failing} resource(s) need attention").red().to_string()
                };
                let _ = write!(output, "\nStatus: {summary}\n");
                output
            }
        }
    }

    /// Formats dependency levels.
    #[must_use]
    pub fn format_graph(&self, levels: &[Vec<String>]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&GraphJson { levels }),
            OutputFormat::Text => {
                let mut output = String::from("\nDependency levels (creation order)\n\n");
                for (i, ids) in levels.iter().enumerate() {
                    let _ = writeln!(output, "   {i}: {}", ids.join(", "));
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                to_json(&json)
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid\n", "✓".green())
                } else {
                    let mut text = format!("{} Configuration has {} error(s):\n", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(text, "   - {error}");
                    }
                    text
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output
            }
        }
    }

    /// Formats a change action with color.
    fn format_action(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+create".green().to_string(),
            ChangeAction::Update => "~update".yellow().to_string(),
            ChangeAction::Replace => "±replace".magenta().to_string(),
            ChangeAction::Delete => "-delete".red().to_string(),
            ChangeAction::Noop => "noop".dimmed().to_string(),
        }
    }

    fn format_resource_status(status: &ResourceStatus) -> String {
        if let Some(error) = &status.error {
            return format!("error: {}", truncate(error, 40)).red().to_string();
        }
        if !status.exists {
            return "missing".red().to_string();
        }
        let mut text = match &status.health {
            Some(health) if health.is_unhealthy() => health.to_string().red().to_string(),
            Some(health) => health.to_string().green().to_string(),
            None => "present".green().to_string(),
        };
        if status.drifted {
            let _ = write!(text, " {}", "(drifted)".yellow());
        }
        text
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
