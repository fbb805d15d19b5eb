use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::history::{CompletionHistoryEntry, Termination};
use crate::patterns::PatternSnapshot;

use super::styling::{heading, muted};

/// Prints the learned patterns as a table on stdout.
pub fn print_patterns(snapshot: &PatternSnapshot) {
    println!("{}", render_patterns(snapshot));
}

fn render_patterns(snapshot: &PatternSnapshot) -> String {
    if snapshot.workflows.is_empty() {
        return muted("No learned patterns yet. Watch a run to start learning.").to_string();
    }

    let mut table = create_table();
    table.set_header(create_cyan_header(&[
        "Workflow",
        "Runs",
        "Avg Build",
        "Avg Poll",
        "Success",
        "Recent Failures",
    ]));

    for (name, pattern) in &snapshot.workflows {
        #[allow(clippy::cast_precision_loss)]
        let build_secs = pattern.average_build_duration_ms as f64 / 1000.0;
        #[allow(clippy::cast_precision_loss)]
        let poll_secs = pattern.average_interval_ms as f64 / 1000.0;

        table.add_row(vec![
            Cell::new(name),
            Cell::new(pattern.samples),
            color_coded_duration_cell(build_secs),
            Cell::new(format!("{poll_secs:.1}s")),
            color_coded_success_cell(pattern.success_rate * 100.0),
            Cell::new(pattern.recent_failures.len()),
        ]);
    }

    #[allow(clippy::cast_precision_loss)]
    let default_build_mins = snapshot.defaults.avg_build_time_ms as f64 / 60_000.0;
    format!(
        "{}\n{table}\n{}",
        heading("📚 Learned patterns"),
        muted(format!(
            "Defaults: avg build {default_build_mins:.1}min, success rate {:.1}%",
            snapshot.defaults.success_rate * 100.0
        ))
    )
}

/// Prints recorded watches, oldest first.
pub fn print_history(entries: &[CompletionHistoryEntry]) {
    println!("{}", render_history(entries));
}

fn render_history(entries: &[CompletionHistoryEntry]) -> String {
    if entries.is_empty() {
        return muted("No watches recorded yet.").to_string();
    }

    let mut table = create_table();
    table.set_header(create_cyan_header(&[
        "Recorded", "Run", "Workflow", "Branch", "Outcome", "Score", "Action",
    ]));

    for entry in entries {
        let (run_id, workflow, branch) = match &entry.run {
            Some(run) => (run.id.as_str(), run.workflow_name.as_str(), run.branch.as_str()),
            None => ("-", "-", "-"),
        };
        let outcome = match entry.termination {
            Termination::Completed if entry.failure => Cell::new("failed").fg(TableColor::Red),
            Termination::Completed => Cell::new("succeeded").fg(TableColor::Green),
            Termination::TimedOut => Cell::new("timed out").fg(TableColor::Yellow),
            Termination::Cancelled => Cell::new("cancelled").fg(TableColor::Yellow),
            Termination::Errored => Cell::new("errored").fg(TableColor::Red),
        };
        let score = entry
            .eligibility
            .as_ref()
            .map_or_else(|| "-".to_string(), |result| result.score.to_string());

        table.add_row(vec![
            Cell::new(entry.recorded_at.format("%Y-%m-%d %H:%M")),
            Cell::new(run_id),
            Cell::new(workflow),
            Cell::new(branch),
            outcome,
            Cell::new(score),
            Cell::new(entry.action),
        ]);
    }

    format!("{}\n{table}", heading("📜 Watch history"))
}

/// Table and cell creation helpers
fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn create_cyan_header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

fn color_coded_success_cell(rate: f64) -> Cell {
    let text = format!("{rate:.1}%");
    if rate > 80.0 {
        Cell::new(text).fg(TableColor::Green)
    } else if rate >= 50.0 {
        Cell::new(text).fg(TableColor::Yellow)
    } else {
        Cell::new(text).fg(TableColor::Red)
    }
}

fn color_coded_duration_cell(seconds: f64) -> Cell {
    let minutes = seconds / 60.0;
    let text = format!("{minutes:.1}min");
    if minutes <= 10.0 {
        Cell::new(text).fg(TableColor::Green)
    } else if minutes <= 15.0 {
        Cell::new(text).fg(TableColor::Yellow)
    } else {
        Cell::new(text).fg(TableColor::Red)
    }
}
