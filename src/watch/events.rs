//! Structured watch events and the sinks that receive them.
//!
//! Sinks are fire-and-forget: `notify` must return promptly and never
//! block the poll loop. Slow consumers sit behind a [`ChannelSink`].

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::eligibility::EligibilityResult;
use crate::merge::MergeAttempt;

use super::types::{RunSnapshot, RunStatus, TransitionAnalysis};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    Started {
        source: String,
        max_watch_time_ms: u64,
    },
    /// No run matches the query yet.
    NoRun,
    Status {
        snapshot: RunSnapshot,
        /// Absent once the run has completed.
        next_delay_ms: Option<u64>,
    },
    Transition {
        run_id: String,
        from: Option<RunStatus>,
        to: RunStatus,
    },
    SourceError {
        message: String,
        consecutive: u32,
    },
    Completed {
        snapshot: RunSnapshot,
        analysis: TransitionAnalysis,
    },
    TimedOut {
        elapsed_ms: u64,
    },
    Cancelled,
    Eligibility {
        result: EligibilityResult,
    },
    Merge {
        attempt: MergeAttempt,
    },
}

impl WatchEvent {
    /// Serialized tag of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Started { .. } => "started",
            WatchEvent::NoRun => "no_run",
            WatchEvent::Status { .. } => "status",
            WatchEvent::Transition { .. } => "transition",
            WatchEvent::SourceError { .. } => "source_error",
            WatchEvent::Completed { .. } => "completed",
            WatchEvent::TimedOut { .. } => "timed_out",
            WatchEvent::Cancelled => "cancelled",
            WatchEvent::Eligibility { .. } => "eligibility",
            WatchEvent::Merge { .. } => "merge",
        }
    }
}

/// Receives watch events. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &WatchEvent);
}

/// Fans each event out to every registered sink, in order.
#[derive(Default, Clone)]
pub struct Observers {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for Observers {
    fn notify(&self, event: &WatchEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

/// Pushes events onto an unbounded channel drained by a separate task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: &WatchEvent) {
        // A dropped receiver only means nobody is listening any more.
        if self.tx.send(event.clone()).is_err() {
            debug!("Event receiver closed, dropping {} event", event.kind());
        }
    }
}

/// Mirrors events into the `log` facade.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Started {
                source,
                max_watch_time_ms,
            } => info!(
                "Watching {source} (giving up after {}s)",
                max_watch_time_ms / 1000
            ),
            WatchEvent::NoRun => debug!("No matching run yet"),
            WatchEvent::Status {
                snapshot,
                next_delay_ms,
            } => match next_delay_ms {
                Some(ms) => debug!(
                    "Run {} [{}] is {}, next poll in {:.1}s",
                    snapshot.id,
                    snapshot.workflow_name,
                    snapshot.status(),
                    *ms as f64 / 1000.0
                ),
                None => debug!(
                    "Run {} [{}] is {}",
                    snapshot.id,
                    snapshot.workflow_name,
                    snapshot.status()
                ),
            },
            WatchEvent::Transition { run_id, from, to } => match from {
                Some(from) => info!("Run {run_id}: {from} -> {to}"),
                None => info!("Run {run_id}: now {to}"),
            },
            WatchEvent::SourceError {
                message,
                consecutive,
            } => warn!("Status query failed ({consecutive} in a row): {message}"),
            WatchEvent::Completed { snapshot, .. } => info!(
                "Run {} completed: {}",
                snapshot.id,
                snapshot
                    .conclusion()
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ),
            WatchEvent::TimedOut { elapsed_ms } => {
                warn!("Gave up waiting after {}s", elapsed_ms / 1000);
            }
            WatchEvent::Cancelled => info!("Watch cancelled"),
            WatchEvent::Eligibility { result } => info!(
                "Eligibility score {}/{}, eligible: {}, blockers: {:?}",
                result.score, result.threshold, result.eligible, result.blockers
            ),
            WatchEvent::Merge { attempt } if attempt.action.attempted() && !attempt.success => {
                warn!("Merge action: {} ({})", attempt.action, attempt.details);
            }
            WatchEvent::Merge { attempt } => {
                info!("Merge action: {} ({})", attempt.action, attempt.details);
            }
        }
    }
}
