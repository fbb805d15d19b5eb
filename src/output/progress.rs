use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::watch::WatchEvent;

use super::styling::{bad, heading, label, verdict, waiting};

/// How an event shows up on the terminal.
#[derive(Debug, PartialEq, Eq)]
enum Rendered {
    /// Replaces the spinner message.
    Spinner(String),
    /// Printed above the spinner.
    Line(String),
    /// Stops the spinner with a final message.
    Finish(String),
}

/// Live spinner on stderr, driven by watch events from a channel.
pub struct WatchProgress;

impl WatchProgress {
    /// Drains `events` until every sender is dropped.
    pub fn spawn(mut events: UnboundedReceiver<WatchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            eprintln!("⏱️  {}", heading("Watch"));
            let pb = create_spinner(waiting("Starting").to_string());

            while let Some(event) = events.recv().await {
                match render(&event) {
                    Some(Rendered::Spinner(message)) => pb.set_message(message),
                    Some(Rendered::Line(line)) => pb.println(format!("  {line}")),
                    Some(Rendered::Finish(message)) => pb.finish_with_message(message),
                    None => {}
                }
            }

            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        })
    }
}

fn render(event: &WatchEvent) -> Option<Rendered> {
    let rendered = match event {
        WatchEvent::Started { source, .. } => {
            Rendered::Spinner(waiting(format!("Watching {source}")).to_string())
        }
        WatchEvent::NoRun => {
            Rendered::Spinner(waiting("Waiting for a matching run").to_string())
        }
        WatchEvent::Status {
            snapshot,
            next_delay_ms: Some(ms),
        } => Rendered::Spinner(
            waiting(format!(
                "Run {} [{}] {}, next poll in {}s",
                snapshot.id,
                snapshot.workflow_name,
                snapshot.status(),
                ms.div_ceil(1000)
            ))
            .to_string(),
        ),
        WatchEvent::Status { .. } => return None,
        WatchEvent::Transition {
            run_id,
            from: Some(from),
            to,
        } => Rendered::Line(format!("{} {from} → {to}", label(format!("run {run_id}")))),
        WatchEvent::Transition { .. } => return None,
        WatchEvent::SourceError {
            message,
            consecutive,
        } => Rendered::Line(
            bad(format!("status query failed ({consecutive}x): {message}")).to_string(),
        ),
        WatchEvent::Completed { snapshot, .. } => {
            let message = format!(
                "Run {} completed: {}",
                snapshot.id,
                snapshot
                    .conclusion()
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string())
            );
            Rendered::Finish(verdict(snapshot.is_success(), message))
        }
        WatchEvent::TimedOut { elapsed_ms } => {
            Rendered::Finish(verdict(false, format!("Timed out after {}s", elapsed_ms / 1000)))
        }
        WatchEvent::Cancelled => Rendered::Finish(verdict(false, "Cancelled")),
        WatchEvent::Eligibility { result } => Rendered::Line(format!(
            "{} score {}/{}{}",
            label("eligibility"),
            result.score,
            result.threshold,
            if result.eligible { ", eligible" } else { ", not eligible" }
        )),
        WatchEvent::Merge { attempt } => {
            Rendered::Line(format!("{} {}", label(attempt.action), attempt.details))
        }
    };
    Some(rendered)
}

fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {msg} {spinner}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
