use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// Final verdict of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conclusion::Success => f.write_str("success"),
            Conclusion::Failure => f.write_str("failure"),
        }
    }
}

/// Status plus conclusion, kept together so a conclusion can only exist
/// on a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed(Conclusion),
}

impl RunState {
    pub fn status(self) -> RunStatus {
        match self {
            RunState::Pending => RunStatus::Pending,
            RunState::Running => RunStatus::Running,
            RunState::Completed(_) => RunStatus::Completed,
        }
    }

    pub fn conclusion(self) -> Option<Conclusion> {
        match self {
            RunState::Completed(conclusion) => Some(conclusion),
            _ => None,
        }
    }
}

/// One observation of pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: String,
    pub workflow_name: String,
    pub branch: String,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<Conclusion>,
    /// Run attempt number as reported by the CI host (1 for the first run).
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub observed_at: DateTime<Utc>,
}

fn default_attempt() -> u32 {
    1
}

impl RunSnapshot {
    pub fn new(
        id: impl Into<String>,
        workflow_name: impl Into<String>,
        branch: impl Into<String>,
        state: RunState,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            branch: branch.into(),
            status: state.status(),
            conclusion: state.conclusion(),
            attempt: 1,
            created_at: None,
            url: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn conclusion(&self) -> Option<Conclusion> {
        self.conclusion
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_success(&self) -> bool {
        self.conclusion == Some(Conclusion::Success)
    }

    pub fn is_failure(&self) -> bool {
        self.conclusion == Some(Conclusion::Failure)
    }

    /// Wall-clock run duration, measured from the host's creation time when
    /// known, else the supplied fallback (time spent watching).
    pub fn duration_or(&self, fallback: Duration) -> Duration {
        self.created_at
            .and_then(|created| (self.observed_at - created).to_std().ok())
            .unwrap_or(fallback)
    }
}

/// Difference between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionAnalysis {
    pub status_changed: bool,
    pub conclusion_changed: bool,
    pub is_completed: bool,
    pub is_success: bool,
    pub is_failure: bool,
    #[serde(rename = "elapsed_since_watch_start_ms", serialize_with = "as_millis")]
    pub elapsed_since_watch_start: Duration,
}

impl TransitionAnalysis {
    /// Compares `current` against the previous observation.
    ///
    /// A different run id counts as a status change: a new run replaced the
    /// one seen before. The first observation of a watch is not a change.
    pub fn between(
        previous: Option<&RunSnapshot>,
        current: &RunSnapshot,
        elapsed_since_watch_start: Duration,
    ) -> Self {
        let (status_changed, conclusion_changed) = match previous {
            Some(prev) => (
                prev.id != current.id || prev.status != current.status,
                prev.conclusion != current.conclusion,
            ),
            None => (false, false),
        };

        Self {
            status_changed,
            conclusion_changed,
            is_completed: current.is_completed(),
            is_success: current.is_success(),
            is_failure: current.is_failure(),
            elapsed_since_watch_start,
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn as_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(millis(*duration))
}
