use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Host-side merge outcome for an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResponse {
    pub merged: bool,
    pub message: String,
}

/// Hosting-system boundary for the squash-merge action.
#[async_trait]
pub trait MergeHost: Send + Sync {
    async fn squash_merge(&self, pr_number: u64) -> Result<MergeResponse>;
}

/// What the engine did (or declined to do) for a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    /// Nothing to merge: the run failed, timed out, or was cancelled.
    None,
    /// Not eligible, auto-merge disabled, or already attempted.
    Skipped,
    DryRun,
    /// No pull request exists; the change is already on its branch.
    DirectPush,
    MergeSucceeded,
    MergeFailed,
}

impl MergeAction {
    pub fn attempted(self) -> bool {
        matches!(self, MergeAction::MergeSucceeded | MergeAction::MergeFailed)
    }
}

impl fmt::Display for MergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MergeAction::None => "none",
            MergeAction::Skipped => "skipped",
            MergeAction::DryRun => "dry_run",
            MergeAction::DirectPush => "direct_push",
            MergeAction::MergeSucceeded => "merge_succeeded",
            MergeAction::MergeFailed => "merge_failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAttempt {
    pub action: MergeAction,
    pub success: bool,
    pub details: String,
}

impl MergeAttempt {
    pub fn none(details: impl Into<String>) -> Self {
        Self {
            action: MergeAction::None,
            success: false,
            details: details.into(),
        }
    }

    pub fn skipped(details: impl Into<String>) -> Self {
        Self {
            action: MergeAction::Skipped,
            success: false,
            details: details.into(),
        }
    }
}

/// Requests squash merges from the host, at most once per pull request.
///
/// Failures are reported, never retried: a PR whose state changed under us
/// must be re-evaluated from scratch before another attempt.
pub struct MergeExecutor {
    host: Arc<dyn MergeHost>,
    dry_run: bool,
    attempted: HashSet<u64>,
}

impl MergeExecutor {
    pub fn new(host: Arc<dyn MergeHost>, dry_run: bool) -> Self {
        Self {
            host,
            dry_run,
            attempted: HashSet::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn attempt_merge(&mut self, pr_number: Option<u64>) -> MergeAttempt {
        let Some(number) = pr_number else {
            return MergeAttempt {
                action: MergeAction::DirectPush,
                success: true,
                details: "no pull request; change was pushed directly".to_string(),
            };
        };

        if self.dry_run {
            info!("Dry run: would squash-merge PR #{number}");
            return MergeAttempt {
                action: MergeAction::DryRun,
                success: true,
                details: format!("dry run: would squash-merge PR #{number}"),
            };
        }

        if !self.attempted.insert(number) {
            warn!("PR #{number} was already attempted, not merging again");
            return MergeAttempt::skipped(format!("PR #{number} already attempted"));
        }

        info!("Requesting squash merge of PR #{number}");
        match self.host.squash_merge(number).await {
            Ok(response) if response.merged => MergeAttempt {
                action: MergeAction::MergeSucceeded,
                success: true,
                details: format!("PR #{number} merged: {}", response.message),
            },
            Ok(response) => MergeAttempt {
                action: MergeAction::MergeFailed,
                success: false,
                details: format!("PR #{number} not merged: {}", response.message),
            },
            Err(e) => {
                warn!("Merge of PR #{number} failed: {e}");
                MergeAttempt {
                    action: MergeAction::MergeFailed,
                    success: false,
                    details: format!("PR #{number} merge failed: {e}"),
                }
            }
        }
    }
}
