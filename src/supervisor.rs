//! Drives one watch end to end: poll, learn, evaluate, merge, record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::eligibility::{
    EligibilityEvaluator, EligibilityResult, PullRequestInfo, PullRequestSource,
};
use crate::error::{CigateError, Result};
use crate::history::{CompletionHistoryEntry, HistoryLog, Termination};
use crate::merge::{MergeAction, MergeAttempt, MergeExecutor};
use crate::patterns::PatternStore;
use crate::watch::{
    millis, NotificationSink, RunSnapshot, StatusPoller, TransitionAnalysis, WatchEvent,
    WatchOutcome,
};

/// Machine-readable result of a watch.
#[derive(Debug, Clone, Serialize)]
pub struct WatchReport {
    pub outcome: Termination,
    pub run: Option<RunSnapshot>,
    pub analysis: Option<TransitionAnalysis>,
    pub pull_request: Option<u64>,
    pub eligibility: Option<EligibilityResult>,
    pub merge: MergeAttempt,
    pub elapsed_ms: u64,
}

impl WatchReport {
    /// The run succeeded and the engine handled it without hitting a wall.
    pub fn is_success(&self) -> bool {
        let run_succeeded = self.outcome == Termination::Completed
            && self.run.as_ref().is_some_and(RunSnapshot::is_success);
        if !run_succeeded {
            return false;
        }

        match self.merge.action {
            MergeAction::MergeSucceeded | MergeAction::DirectPush | MergeAction::DryRun => true,
            MergeAction::Skipped => self
                .eligibility
                .as_ref()
                .is_some_and(|result| result.blockers.is_empty()),
            MergeAction::None | MergeAction::MergeFailed => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// One human-readable line describing how the watch ended.
    pub fn summary(&self) -> String {
        let run = match &self.run {
            Some(run) => format!("{} run {} on {}", run.workflow_name, run.id, run.branch),
            None => "no run observed".to_string(),
        };

        let outcome = match self.outcome {
            Termination::Completed => match self.run.as_ref().and_then(RunSnapshot::conclusion) {
                Some(conclusion) => conclusion.to_string(),
                None => "completed".to_string(),
            },
            Termination::TimedOut => format!("timed out after {}s", self.elapsed_ms / 1000),
            Termination::Cancelled => "cancelled".to_string(),
            Termination::Errored => "errored".to_string(),
        };

        let mut line = format!("{run}: {outcome}");

        if let Some(result) = &self.eligibility {
            line.push_str(&format!(
                "; score {}/{} {}",
                result.score,
                result.threshold,
                if result.eligible { "eligible" } else { "not eligible" }
            ));
            if !result.blockers.is_empty() {
                let blockers: Vec<&str> = result.blockers.iter().map(|b| b.as_str()).collect();
                line.push_str(&format!(" (blocked: {})", blockers.join(", ")));
            }
        }

        line.push_str(&format!("; {}: {}", self.merge.action, self.merge.details));
        line
    }
}

/// Owns the collaborators of one watch.
pub struct Supervisor {
    poller: StatusPoller,
    pull_requests: Arc<dyn PullRequestSource>,
    evaluator: EligibilityEvaluator,
    executor: MergeExecutor,
    history: HistoryLog,
    sink: Arc<dyn NotificationSink>,
    pr_number: Option<u64>,
    auto_merge: bool,
}

impl Supervisor {
    pub fn new(
        poller: StatusPoller,
        pull_requests: Arc<dyn PullRequestSource>,
        evaluator: EligibilityEvaluator,
        executor: MergeExecutor,
        history: HistoryLog,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            poller,
            pull_requests,
            evaluator,
            executor,
            history,
            sink,
            pr_number: None,
            auto_merge: false,
        }
    }

    /// Evaluate this pull request instead of the one open for the run's branch.
    pub fn with_pr_number(mut self, pr_number: Option<u64>) -> Self {
        self.pr_number = pr_number;
        self
    }

    pub fn with_auto_merge(mut self, auto_merge: bool) -> Self {
        self.auto_merge = auto_merge;
        self
    }

    /// Watches until the run finishes, then decides and acts on it.
    ///
    /// Only a status source that exhausted its error budget (or a watch
    /// already in progress) is an error; every other ending is a report.
    pub async fn run(
        &mut self,
        store: &mut PatternStore,
        max_watch_time: Duration,
        cancel: &CancellationToken,
    ) -> Result<WatchReport> {
        let started = Instant::now();
        let outcome = match self.poller.watch(store, max_watch_time, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, CigateError::SourceExhausted { .. }) {
                    self.record_error(&e);
                }
                return Err(e);
            }
        };
        debug!("Poller settled in state {:?}", self.poller.state());

        let report = match outcome {
            WatchOutcome::Completed { snapshot, analysis } => {
                self.handle_completion(snapshot, analysis, started).await
            }
            WatchOutcome::TimedOut { last, elapsed } => WatchReport {
                outcome: Termination::TimedOut,
                run: last,
                analysis: None,
                pull_request: None,
                eligibility: None,
                merge: MergeAttempt::none("run did not complete before the watch timed out"),
                elapsed_ms: millis(elapsed),
            },
            WatchOutcome::Cancelled { last } => WatchReport {
                outcome: Termination::Cancelled,
                run: last,
                analysis: None,
                pull_request: None,
                eligibility: None,
                merge: MergeAttempt::none("watch was cancelled"),
                elapsed_ms: millis(started.elapsed()),
            },
        };

        self.record(&report);
        Ok(report)
    }

    async fn handle_completion(
        &mut self,
        snapshot: RunSnapshot,
        analysis: TransitionAnalysis,
        started: Instant,
    ) -> WatchReport {
        let pr = self.lookup_pull_request(&snapshot).await;
        let result = self.evaluator.evaluate(&snapshot, &pr);
        self.sink.notify(&WatchEvent::Eligibility {
            result: result.clone(),
        });

        let merge = if !snapshot.is_success() {
            MergeAttempt::none(format!("CI run {} did not succeed", snapshot.id))
        } else if !result.eligible {
            MergeAttempt::skipped(format!(
                "not eligible (score {}/{})",
                result.score, result.threshold
            ))
        } else if pr.number().is_some() && !self.auto_merge && !self.executor.is_dry_run() {
            MergeAttempt::skipped("eligible, but auto-merge is disabled")
        } else {
            self.executor.attempt_merge(pr.number()).await
        };
        self.sink.notify(&WatchEvent::Merge {
            attempt: merge.clone(),
        });

        WatchReport {
            outcome: Termination::Completed,
            pull_request: pr.number(),
            run: Some(snapshot),
            analysis: Some(analysis),
            eligibility: Some(result),
            merge,
            elapsed_ms: millis(started.elapsed()),
        }
    }

    async fn lookup_pull_request(&self, snapshot: &RunSnapshot) -> PullRequestInfo {
        let lookup = match self.pr_number {
            Some(number) => self.pull_requests.pull_request(number).await,
            None => self.pull_requests.pull_request_for_branch(&snapshot.branch).await,
        };

        match lookup {
            Ok(Some(pr)) => {
                info!("Evaluating PR #{} ({})", pr.number, pr.title);
                PullRequestInfo::Found(pr)
            }
            // A pull request the user named must exist; only branch
            // discovery may fall back to a direct push.
            Ok(None) => match self.pr_number {
                Some(number) => {
                    warn!("PR #{number} was not found");
                    PullRequestInfo::Unavailable(format!("PR #{number} not found"))
                }
                None => PullRequestInfo::Missing,
            },
            Err(e) => {
                warn!("Pull request lookup failed: {e}");
                PullRequestInfo::Unavailable(e.to_string())
            }
        }
    }

    fn record(&self, report: &WatchReport) {
        let entry = CompletionHistoryEntry {
            recorded_at: Utc::now(),
            termination: report.outcome,
            run: report.run.clone(),
            eligibility: report.eligibility.clone(),
            action: report.merge.action,
            failure: !(report.outcome == Termination::Completed
                && report.run.as_ref().is_some_and(RunSnapshot::is_success)),
            details: report.merge.details.clone(),
        };

        self.append(&entry);
    }

    fn record_error(&self, error: &CigateError) {
        self.append(&CompletionHistoryEntry {
            recorded_at: Utc::now(),
            termination: Termination::Errored,
            run: None,
            eligibility: None,
            action: MergeAction::None,
            failure: true,
            details: error.to_string(),
        });
    }

    fn append(&self, entry: &CompletionHistoryEntry) {
        if let Err(e) = self.history.append(entry) {
            warn!("Failed to append completion history: {e}");
        }
    }
}
