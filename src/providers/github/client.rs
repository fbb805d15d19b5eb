use graphql_client::{QueryBody, Response as GraphQLResponse};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use url::Url;

use crate::auth::Token;
use crate::eligibility::PrMetadata;
use crate::error::{CigateError, Result};
use crate::merge::MergeResponse;

use super::types::{
    ApiMessage, GitHubWorkflowRun, MergeResult, PullRequestData, WorkflowRunsResponse,
};

/// Runs per page when a workflow display name is matched client-side.
const FILTERED_PAGE_SIZE: usize = 50;
/// Pages searched for a workflow display name before reporting no run.
const MAX_FILTERED_PAGES: u32 = 5;

macro_rules! pr_fields {
    () => {
        r#"
    number
    title
    state
    mergeable
    reviewDecision
    headRefName
    baseRefName
    commits(last: 1) {
      nodes {
        commit {
          statusCheckRollup {
            contexts(first: 100) {
              nodes {
                __typename
                ... on CheckRun { name status conclusion }
                ... on StatusContext { context state }
              }
            }
          }
        }
      }
    }
"#
    };
}

const PR_BY_NUMBER: &str = concat!(
    "query PullRequestByNumber($owner: String!, $repo: String!, $number: Int!) {\n",
    "  repository(owner: $owner, name: $repo) {\n",
    "    pullRequest(number: $number) {",
    pr_fields!(),
    "}\n  }\n}"
);

const PR_BY_HEAD: &str = concat!(
    "query PullRequestByHead($owner: String!, $repo: String!, $headRefName: String!) {\n",
    "  repository(owner: $owner, name: $repo) {\n",
    "    pullRequests(headRefName: $headRefName, states: [OPEN], first: 1) { nodes {",
    pr_fields!(),
    "} }\n  }\n}"
);

#[derive(Serialize)]
struct ByNumber<'a> {
    owner: &'a str,
    repo: &'a str,
    number: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ByHeadRef<'a> {
    owner: &'a str,
    repo: &'a str,
    head_ref_name: &'a str,
}

/// GitHub REST and GraphQL client scoped to a single repository.
pub struct GitHubClient {
    client: Client,
    /// REST base, e.g. `https://api.github.com`
    base_url: String,
    graphql_url: Url,
    owner: String,
    repo: String,
    token: Option<Token>,
}

impl GitHubClient {
    pub fn new(base_url: &str, owner: &str, repo: &str, token: Option<Token>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("cigate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CigateError::Config(format!("Failed to create HTTP client: {e}")))?;

        let base = Url::parse(base_url)
            .map_err(|e| CigateError::Config(format!("Invalid base URL: {e}")))?;

        let graphql_url = base
            .join("graphql")
            .map_err(|e| CigateError::Config(format!("Invalid GraphQL URL: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            graphql_url,
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
        })
    }

    pub fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.base_url, self.owner, self.repo, path)
    }

    /// Most recent workflow run, optionally restricted to a branch and a
    /// workflow.
    ///
    /// A workflow file name (`ci.yml`) or numeric id is queried through the
    /// per-workflow endpoint. A display name is matched client-side, paging
    /// back through the repository's runs until one matches.
    pub async fn fetch_latest_run(
        &self,
        branch: Option<&str>,
        workflow: Option<&str>,
    ) -> Result<Option<GitHubWorkflowRun>> {
        let name = match workflow {
            None => {
                let runs = self.fetch_runs_page("actions/runs", branch, 1, 1).await?;
                return Ok(runs.into_iter().next());
            }
            Some(workflow) if is_workflow_file_or_id(workflow) => {
                let path = format!("actions/workflows/{workflow}/runs");
                let runs = self.fetch_runs_page(&path, branch, 1, 1).await?;
                return Ok(runs.into_iter().next());
            }
            Some(name) => name,
        };

        for page in 1..=MAX_FILTERED_PAGES {
            let runs = self
                .fetch_runs_page("actions/runs", branch, FILTERED_PAGE_SIZE, page)
                .await?;
            let last_page = runs.len() < FILTERED_PAGE_SIZE;

            if let Some(run) = runs
                .into_iter()
                .find(|run| run.name.as_deref() == Some(name))
            {
                return Ok(Some(run));
            }
            if last_page {
                break;
            }
        }

        debug!("No run of workflow '{name}' in the most recent runs");
        Ok(None)
    }

    async fn fetch_runs_page(
        &self,
        path: &str,
        branch: Option<&str>,
        per_page: usize,
        page: u32,
    ) -> Result<Vec<GitHubWorkflowRun>> {
        let mut query = vec![
            ("per_page", per_page.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(branch) = branch {
            query.push(("branch", branch.to_string()));
        }

        let request = self.client.get(self.repo_url(path)).query(&query);
        let response = self.auth_request(request).send().await?;
        let response: WorkflowRunsResponse = error_for_status(response).await?.json().await?;

        debug!(
            "Fetched {} workflow run(s) from {path} page {page} for {}/{}",
            response.workflow_runs.len(),
            self.owner,
            self.repo
        );
        Ok(response.workflow_runs)
    }

    /// A single workflow run by id. A 404 maps to `None`.
    pub async fn fetch_run(&self, run_id: u64) -> Result<Option<GitHubWorkflowRun>> {
        let request = self
            .client
            .get(self.repo_url(&format!("actions/runs/{run_id}")));
        let response = self.auth_request(request).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(error_for_status(response).await?.json().await?))
    }

    pub async fn fetch_pull_request(&self, number: u64) -> Result<Option<PrMetadata>> {
        let number = i64::try_from(number)
            .map_err(|_| CigateError::Config(format!("PR number {number} is out of range")))?;
        let variables = ByNumber {
            owner: &self.owner,
            repo: &self.repo,
            number,
        };

        let data: PullRequestData = self
            .execute_graphql(PR_BY_NUMBER, "PullRequestByNumber", variables)
            .await?;

        Ok(data
            .repository
            .and_then(|repo| repo.pull_request)
            .map(|node| node.into_metadata()))
    }

    /// The open pull request whose head is `branch`, if any.
    pub async fn fetch_pull_request_for_branch(&self, branch: &str) -> Result<Option<PrMetadata>> {
        let variables = ByHeadRef {
            owner: &self.owner,
            repo: &self.repo,
            head_ref_name: branch,
        };

        let data: PullRequestData = self
            .execute_graphql(PR_BY_HEAD, "PullRequestByHead", variables)
            .await?;

        Ok(data
            .repository
            .and_then(|repo| repo.pull_requests)
            .and_then(|conn| conn.nodes.into_iter().next())
            .map(|node| node.into_metadata()))
    }

    /// Squash-merges a pull request.
    ///
    /// Refusals the host reports about the pull request itself (not
    /// mergeable, conflict, head moved) come back as `merged: false`.
    pub async fn squash_merge(&self, number: u64) -> Result<MergeResponse> {
        let request = self
            .client
            .put(self.repo_url(&format!("pulls/{number}/merge")))
            .json(&serde_json::json!({ "merge_method": "squash" }));
        let response = self.auth_request(request).send().await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let message = response
                .json::<ApiMessage>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| status.to_string());
            return Ok(MergeResponse {
                merged: false,
                message,
            });
        }

        let result: MergeResult = error_for_status(response).await?.json().await?;
        Ok(MergeResponse {
            merged: result.merged,
            message: result.message,
        })
    }

    async fn execute_graphql<V, T>(
        &self,
        query: &'static str,
        operation_name: &'static str,
        variables: V,
    ) -> Result<T>
    where
        V: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let body = QueryBody {
            variables,
            query,
            operation_name,
        };

        let request = self.client.post(self.graphql_url.clone()).json(&body);
        let response = self.auth_request(request).send().await?;
        let response_body: GraphQLResponse<T> = error_for_status(response).await?.json().await?;

        if let Some(errors) = response_body.errors {
            return Err(CigateError::GraphQL(
                errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }

        response_body.data.ok_or(CigateError::NoResponseData)
    }
}

fn is_workflow_file_or_id(workflow: &str) -> bool {
    workflow.ends_with(".yml") || workflow.ends_with(".yaml") || workflow.parse::<u64>().is_ok()
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .ok()
        .and_then(|text| {
            serde_json::from_str::<ApiMessage>(&text)
                .map(|body| body.message)
                .ok()
                .or(Some(text))
        })
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "Unable to read error response".to_string());

    Err(CigateError::Api {
        status: status.as_u16(),
        message,
    })
}
