use crate::supervisor::WatchReport;

use super::styling::{bad, good};

/// Prints the one-line outcome of a watch to stderr, green when the
/// process will exit successfully and red otherwise.
pub fn print_summary(report: &WatchReport) {
    eprintln!("{}", render_summary(report));
}

fn render_summary(report: &WatchReport) -> String {
    if report.is_success() {
        format!("{} {}", good("✓"), report.summary())
    } else {
        format!("{} {}", bad("✗"), bad(report.summary()))
    }
}

/// Prints the red summary line for a watch that ended in an error.
pub fn print_failure(message: &str) {
    eprintln!("{}", render_failure(message));
}

fn render_failure(message: &str) -> String {
    format!("{} {}", bad("✗"), bad(format!("watch failed: {message}")))
}
