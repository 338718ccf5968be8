//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::graph::{Graph, Value};
use crate::planner::{ChangeAction, Plan, ResourceStatus};
use crate::reconciler::{DriftReport, ReconciliationResult, RefreshReport};
use crate::state::{LockInfo, Snapshot};

use super::commands::OutputFormat;

const HASHER: ConfigHasher = ConfigHasher::new();

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Waits for")]
    waits_for: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
}

/// Snapshot entry row for table display.
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Modified")]
    modified: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - {} resources up to date.\n",
                "✓".green(),
                plan.noop_count()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan {}\n\n", HASHER.short_hash(&plan.stack_hash).dimmed());

        let rows: Vec<PlanChangeRow> = plan
            .changes
            .iter()
            .enumerate()
            .filter(|(_, change)| change.action != ChangeAction::NoOp)
            .map(|(i, change)| PlanChangeRow {
                index: i,
                action: Self::format_action(change.action, change.replacement.is_some()),
                resource: change.resource.to_string(),
                waits_for: change
                    .depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: truncate(&change.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push('\n');
            for change in plan.actionable() {
                if change.diff.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "{}", change.description().bold());
                for detail in &change.diff {
                    let _ = writeln!(output, "    {detail}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.create_count().saturating_sub(plan.replace_count()).to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().magenta(),
            plan.delete_count().saturating_sub(plan.replace_count()).to_string().red()
        );
        output
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_result(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let header = if result.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if result.apply.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply incomplete", "✗".red())
                };

                let rows: Vec<StatusRow> = result
                    .apply
                    .statuses
                    .iter()
                    .filter(|(_, status)| **status != ResourceStatus::Unchanged)
                    .map(|(id, status)| StatusRow {
                        resource: id.to_string(),
                        status: Self::format_status(*status),
                    })
                    .collect();

                let mut output = format!("{header}\n\n");
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                for failure in result.apply.failures() {
                    if let Some(error) = &failure.error {
                        let _ = writeln!(output, "   {} {error}", "✗".red());
                    }
                }
                let _ = writeln!(
                    output,
                    "\n{} unchanged, serial {}",
                    result.apply.count(ResourceStatus::Unchanged),
                    result.apply.snapshot.serial
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text if report.is_converged() => {
                format!("{} {report}\n", "✓".green())
            }
            OutputFormat::Text => format!("{} {report}", "⚠".yellow()),
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Refreshed: {} updated, {} removed, {} unchanged\n",
                    "✓".green(),
                    report.updated.len(),
                    report.removed.len(),
                    report.unchanged
                );
                for id in &report.updated {
                    let _ = writeln!(output, "   ~ {id}");
                }
                for id in &report.removed {
                    let _ = writeln!(output, "   - {id}");
                }
                output
            }
        }
    }

    /// Formats a validation result together with the graph it produced.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, graph: &Graph, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "resources": graph.len(),
                    "order": graph.topological_order(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Stack is valid ({} resources)\n",
                    "✓".green(),
                    graph.len()
                );
                let order: Vec<String> = graph.topological_order().iter().map(ToString::to_string).collect();
                if !order.is_empty() {
                    let _ = writeln!(output, "   Order: {}", order.join(" -> "));
                }
                if show_warnings {
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   {} {warning}", "⚠".yellow());
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(output, "   {} warnings (use --warnings)", result.warning_count());
                }
                output
            }
        }
    }

    /// Formats the snapshot.
    #[must_use]
    pub fn format_snapshot(&self, snapshot: &Snapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(snapshot).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(
                    output,
                    "\nSnapshot: {}/{}\n\n",
                    snapshot.project, snapshot.environment
                );
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(output, "   Lineage: {}", snapshot.lineage);
                let _ = writeln!(output, "   Stack hash: {}", HASHER.short_hash(&snapshot.stack_hash));
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(
                    output,
                    "   Resources: {} live, {} tombstoned\n",
                    snapshot.live_count(),
                    snapshot.entries.len().saturating_sub(snapshot.live_count())
                );

                let rows: Vec<EntryRow> = snapshot
                    .live_entries()
                    .map(|entry| EntryRow {
                        resource: entry.id.to_string(),
                        id: match entry.outputs.get("id") {
                            Some(Value::String(id)) => id.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        },
                        dependencies: entry
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                        modified: entry.last_modified.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                for deposed in &snapshot.deposed {
                    let id = deposed.outputs.get("id").map(ToString::to_string).unwrap_or_default();
                    let _ = writeln!(
                        output,
                        "   {} {} {id} awaits deletion (deposed {})",
                        "!".yellow(),
                        deposed.id,
                        deposed.deposed_at.format("%Y-%m-%d %H:%M")
                    );
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} #{} {} - {} ({} resources)",
                            entry.serial,
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "Locked by {} for {} ({}), expires in {}s\n   Lock ID: {}\n",
                lock.holder,
                lock.operation,
                lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                lock.remaining_secs(),
                lock.lock_id
            ),
        }
    }

    fn format_action(action: ChangeAction, replacement: bool) -> String {
        match (action, replacement) {
            (ChangeAction::Create, true) => "+replace".magenta().to_string(),
            (ChangeAction::Delete, true) => "-replace".magenta().to_string(),
            (ChangeAction::Create, false) => "+create".green().to_string(),
            (ChangeAction::Update, _) => "~update".yellow().to_string(),
            (ChangeAction::Delete, false) => "-delete".red().to_string(),
            (ChangeAction::NoOp, _) => "noop".dimmed().to_string(),
        }
    }

    fn format_status(status: ResourceStatus) -> String {
        let text = status.to_string();
        match status {
            ResourceStatus::Created | ResourceStatus::Updated | ResourceStatus::Replaced => {
                text.green().to_string()
            }
            ResourceStatus::Deleted => text.red().to_string(),
            ResourceStatus::Unchanged => text.dimmed().to_string(),
            ResourceStatus::Failed => text.red().bold().to_string(),
            ResourceStatus::Skipped | ResourceStatus::Cancelled => text.yellow().to_string(),
        }
    }
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
