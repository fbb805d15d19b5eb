use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eligibility::{
    CheckState, Mergeability, PrMetadata, PrState, ReviewDecision, StatusCheck,
};
use crate::error::{CigateError, Result};
use crate::watch::{Conclusion, RunSnapshot, RunState};

/// GitHub Actions workflow run, as returned by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubWorkflowRun {
    /// Unique identifier for the workflow run
    pub id: u64,
    /// Name of the workflow
    pub name: Option<String>,
    /// Head branch or tag name
    pub head_branch: Option<String>,
    /// `queued`, `in_progress`, `completed`, ...
    pub status: String,
    /// Conclusion of the run (success, failure, etc.)
    pub conclusion: Option<String>,
    /// Attempt number of this run
    #[serde(default)]
    pub run_attempt: Option<u32>,
    /// When the run was created
    pub created_at: DateTime<Utc>,
    /// Web URL of the run
    #[serde(default)]
    pub html_url: Option<String>,
}

impl GitHubWorkflowRun {
    /// Maps the host's status vocabulary onto [`RunState`].
    ///
    /// Only `success` counts as a successful conclusion. A `completed` run
    /// without a conclusion is treated as malformed so the poller retries.
    pub fn state(&self) -> Result<RunState> {
        match self.status.as_str() {
            "completed" => match self.conclusion.as_deref() {
                Some("success") => Ok(RunState::Completed(Conclusion::Success)),
                Some(_) => Ok(RunState::Completed(Conclusion::Failure)),
                None => Err(CigateError::Malformed(format!(
                    "run {} is completed but has no conclusion",
                    self.id
                ))),
            },
            "in_progress" => Ok(RunState::Running),
            _ => Ok(RunState::Pending),
        }
    }

    pub fn into_snapshot(self) -> Result<RunSnapshot> {
        let state = self.state()?;
        let mut snapshot = RunSnapshot::new(
            self.id.to_string(),
            self.name.unwrap_or_default(),
            self.head_branch.unwrap_or_default(),
            state,
        )
        .with_attempt(self.run_attempt.unwrap_or(1))
        .with_created_at(self.created_at);

        if let Some(url) = self.html_url {
            snapshot = snapshot.with_url(url);
        }
        Ok(snapshot)
    }
}

/// Response from GitHub API for workflow runs.
#[derive(Deserialize)]
pub(super) struct WorkflowRunsResponse {
    pub workflow_runs: Vec<GitHubWorkflowRun>,
}

/// Body returned by the merge endpoint, on success and on refusal.
#[derive(Deserialize)]
pub(super) struct MergeResult {
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub(super) struct ApiMessage {
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PullRequestData {
    pub repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RepositoryNode {
    #[serde(default)]
    pub pull_request: Option<PullRequestNode>,
    #[serde(default)]
    pub pull_requests: Option<Connection<PullRequestNode>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Connection<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PullRequestNode {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub mergeable: String,
    pub review_decision: Option<String>,
    pub head_ref_name: String,
    pub base_ref_name: String,
    pub commits: Connection<CommitNode>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CommitNode {
    pub commit: Commit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Commit {
    pub status_check_rollup: Option<StatusCheckRollup>,
}

#[derive(Debug, Deserialize)]
pub(super) struct StatusCheckRollup {
    pub contexts: Connection<RollupContext>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
pub(super) enum RollupContext {
    CheckRun {
        name: String,
        status: String,
        conclusion: Option<String>,
    },
    StatusContext {
        context: String,
        state: String,
    },
    #[serde(other)]
    Other,
}

impl RollupContext {
    fn into_check(self) -> Option<StatusCheck> {
        match self {
            RollupContext::CheckRun {
                name,
                status,
                conclusion,
            } => {
                let state = if status != "COMPLETED" {
                    CheckState::Pending
                } else {
                    match conclusion.as_deref() {
                        Some("SUCCESS" | "NEUTRAL" | "SKIPPED") => CheckState::Passed,
                        _ => CheckState::Failed,
                    }
                };
                Some(StatusCheck { name, state })
            }
            RollupContext::StatusContext { context, state } => {
                let state = match state.as_str() {
                    "SUCCESS" => CheckState::Passed,
                    "PENDING" | "EXPECTED" => CheckState::Pending,
                    _ => CheckState::Failed,
                };
                Some(StatusCheck {
                    name: context,
                    state,
                })
            }
            RollupContext::Other => None,
        }
    }
}

impl PullRequestNode {
    pub fn into_metadata(self) -> PrMetadata {
        let state = match self.state.as_str() {
            "OPEN" => PrState::Open,
            "MERGED" => PrState::Merged,
            _ => PrState::Closed,
        };
        let mergeable = match self.mergeable.as_str() {
            "MERGEABLE" => Mergeability::Mergeable,
            "CONFLICTING" => Mergeability::Conflicting,
            _ => Mergeability::Unknown,
        };
        let review_decision = self.review_decision.as_deref().and_then(|d| match d {
            "APPROVED" => Some(ReviewDecision::Approved),
            "CHANGES_REQUESTED" => Some(ReviewDecision::ChangesRequested),
            "REVIEW_REQUIRED" => Some(ReviewDecision::ReviewRequired),
            _ => None,
        });
        let status_checks = self
            .commits
            .nodes
            .into_iter()
            .last()
            .and_then(|node| node.commit.status_check_rollup)
            .map(|rollup| {
                rollup
                    .contexts
                    .nodes
                    .into_iter()
                    .filter_map(RollupContext::into_check)
                    .collect()
            })
            .unwrap_or_default();

        PrMetadata {
            number: self.number,
            title: self.title,
            state,
            mergeable,
            status_checks,
            review_decision,
            head_ref: self.head_ref_name,
            base_ref: self.base_ref_name,
        }
    }
}

/// Links for GitHub resources.
pub mod links {
    /// Generate URL for a workflow run.
    pub fn workflow_run_url(owner: &str, repo: &str, run_id: &str) -> String {
        format!("https://github.com/{}/{}/actions/runs/{}", owner, repo, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::RunStatus;

    fn run(status: &str, conclusion: Option<&str>) -> GitHubWorkflowRun {
        GitHubWorkflowRun {
            id: 11,
            name: Some("CI".to_string()),
            head_branch: Some("main".to_string()),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
            run_attempt: Some(2),
            created_at: Utc::now(),
            html_url: None,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(run("queued", None).state().unwrap(), RunState::Pending);
        assert_eq!(run("waiting", None).state().unwrap(), RunState::Pending);
        assert_eq!(run("in_progress", None).state().unwrap(), RunState::Running);
        assert_eq!(
            run("completed", Some("success")).state().unwrap(),
            RunState::Completed(Conclusion::Success)
        );
        assert_eq!(
            run("completed", Some("cancelled")).state().unwrap(),
            RunState::Completed(Conclusion::Failure)
        );
    }

    #[test]
    fn test_completed_without_conclusion_is_malformed() {
        assert!(matches!(
            run("completed", None).state(),
            Err(CigateError::Malformed(_))
        ));
    }

    #[test]
    fn test_into_snapshot_carries_identity() {
        let snapshot = run("in_progress", None).into_snapshot().unwrap();
        assert_eq!(snapshot.id, "11");
        assert_eq!(snapshot.workflow_name, "CI");
        assert_eq!(snapshot.branch, "main");
        assert_eq!(snapshot.attempt, 2);
        assert_eq!(snapshot.status(), RunStatus::Running);
        assert!(snapshot.created_at.is_some());
    }

    #[test]
    fn test_pull_request_node_mapping() {
        let raw = serde_json::json!({
            "number": 7,
            "title": "Add widget",
            "state": "OPEN",
            "mergeable": "MERGEABLE",
            "reviewDecision": "APPROVED",
            "headRefName": "feature/widget",
            "baseRefName": "main",
            "commits": { "nodes": [ { "commit": { "statusCheckRollup": { "contexts": { "nodes": [
                { "__typename": "CheckRun", "name": "build", "status": "COMPLETED", "conclusion": "SUCCESS" },
                { "__typename": "CheckRun", "name": "e2e", "status": "IN_PROGRESS", "conclusion": null },
                { "__typename": "StatusContext", "context": "ci/legacy", "state": "FAILURE" }
            ] } } } } ] }
        });
        let node: PullRequestNode = serde_json::from_value(raw).unwrap();
        let pr = node.into_metadata();

        assert_eq!(pr.number, 7);
        assert_eq!(pr.state, PrState::Open);
        assert_eq!(pr.mergeable, Mergeability::Mergeable);
        assert_eq!(pr.review_decision, Some(ReviewDecision::Approved));
        let states: Vec<CheckState> = pr.status_checks.iter().map(|c| c.state).collect();
        assert_eq!(
            states,
            vec![CheckState::Passed, CheckState::Pending, CheckState::Failed]
        );
        assert_eq!(pr.status_checks[2].name, "ci/legacy");
    }

    #[test]
    fn test_pull_request_without_rollup_has_no_checks() {
        let raw = serde_json::json!({
            "number": 3,
            "title": "Docs",
            "state": "OPEN",
            "mergeable": "UNKNOWN",
            "reviewDecision": null,
            "headRefName": "docs",
            "baseRefName": "main",
            "commits": { "nodes": [ { "commit": { "statusCheckRollup": null } } ] }
        });
        let pr = serde_json::from_value::<PullRequestNode>(raw)
            .unwrap()
            .into_metadata();

        assert!(pr.status_checks.is_empty());
        assert_eq!(pr.mergeable, Mergeability::Unknown);
        assert_eq!(pr.review_decision, None);
    }

    #[test]
    fn test_workflow_run_url() {
        assert_eq!(
            links::workflow_run_url("o", "r", "5"),
            "https://github.com/o/r/actions/runs/5"
        );
    }
}
