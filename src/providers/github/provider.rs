use async_trait::async_trait;

use crate::auth::Token;
use crate::eligibility::{PrMetadata, PullRequestSource};
use crate::error::{CigateError, Result};
use crate::merge::{MergeHost, MergeResponse};
use crate::watch::{RunSnapshot, RunStatusSource};

use super::client::GitHubClient;
use super::types::links;

/// Which run the watch follows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub branch: Option<String>,
    pub workflow: Option<String>,
    /// Pins the watch to one run; branch and workflow are then ignored.
    pub run_id: Option<u64>,
}

/// GitHub Actions as run-status source, pull-request source and merge host.
pub struct GitHubProvider {
    client: GitHubClient,
    owner: String,
    repo: String,
    query: RunQuery,
}

impl GitHubProvider {
    /// Create a provider for `project_path` in `owner/repo` form.
    pub fn new(
        base_url: &str,
        project_path: &str,
        token: Option<Token>,
        query: RunQuery,
    ) -> Result<Self> {
        let (owner, repo) = parse_project_path(project_path)?;
        let client = GitHubClient::new(base_url, &owner, &repo, token)?;

        Ok(Self {
            client,
            owner,
            repo,
            query,
        })
    }

    pub fn project_path(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

fn parse_project_path(project_path: &str) -> Result<(String, String)> {
    match project_path.split('/').collect::<Vec<_>>().as_slice() {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(CigateError::Config(format!(
            "Repository must be in format 'owner/repo', got '{project_path}'"
        ))),
    }
}

#[async_trait]
impl RunStatusSource for GitHubProvider {
    async fn latest_run(&self) -> Result<Option<RunSnapshot>> {
        let run = match self.query.run_id {
            Some(id) => self.client.fetch_run(id).await?,
            None => {
                self.client
                    .fetch_latest_run(self.query.branch.as_deref(), self.query.workflow.as_deref())
                    .await?
            }
        };

        let Some(run) = run else {
            return Ok(None);
        };

        let snapshot = run.into_snapshot()?;
        if snapshot.url.is_some() {
            return Ok(Some(snapshot));
        }
        let url = links::workflow_run_url(&self.owner, &self.repo, &snapshot.id);
        Ok(Some(snapshot.with_url(url)))
    }

    fn describe(&self) -> String {
        let mut description = format!("github:{}", self.project_path());
        if let Some(id) = self.query.run_id {
            description.push_str(&format!(" run {id}"));
            return description;
        }
        if let Some(workflow) = &self.query.workflow {
            description.push_str(&format!(" workflow '{workflow}'"));
        }
        if let Some(branch) = &self.query.branch {
            description.push_str(&format!(" on {branch}"));
        }
        description
    }
}

#[async_trait]
impl PullRequestSource for GitHubProvider {
    async fn pull_request(&self, number: u64) -> Result<Option<PrMetadata>> {
        self.client.fetch_pull_request(number).await
    }

    async fn pull_request_for_branch(&self, branch: &str) -> Result<Option<PrMetadata>> {
        self.client.fetch_pull_request_for_branch(branch).await
    }
}

#[async_trait]
impl MergeHost for GitHubProvider {
    async fn squash_merge(&self, pr_number: u64) -> Result<MergeResponse> {
        self.client.squash_merge(pr_number).await
    }
}
