mod progress;
mod styling;
mod summary;
mod tables;

pub use progress::WatchProgress;
use styling::{brand, muted};
pub use summary::{print_failure, print_summary};
pub use tables::{print_history, print_patterns};

/// Prints the `cigate` banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        brand("🚦 cigate"),
        muted(env!("CARGO_PKG_VERSION")),
        muted("Adaptive CI watcher and merge gate")
    );
}
