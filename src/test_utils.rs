//! Fakes for the external collaborators, shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::eligibility::{PrMetadata, PullRequestSource};
use crate::error::{CigateError, Result};
use crate::merge::{MergeHost, MergeResponse};
use crate::watch::{Conclusion, NotificationSink, RunSnapshot, RunState, RunStatusSource, WatchEvent};

pub fn running(id: &str) -> RunSnapshot {
    RunSnapshot::new(id, "CI", "feature/widget", RunState::Running)
}

pub fn succeeded(id: &str) -> RunSnapshot {
    RunSnapshot::new(id, "CI", "feature/widget", RunState::Completed(Conclusion::Success))
}

pub fn failed(id: &str) -> RunSnapshot {
    RunSnapshot::new(id, "CI", "feature/widget", RunState::Completed(Conclusion::Failure))
}

/// One scripted answer of a [`ScriptedSource`].
#[derive(Debug, Clone)]
pub enum Step {
    Run(RunSnapshot),
    Empty,
    Fail(String),
    /// The query never answers.
    Hang,
}

/// Replays steps in order, repeating the last one forever.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: Mutex<usize>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl RunStatusSource for ScriptedSource {
    async fn latest_run(&self) -> Result<Option<RunSnapshot>> {
        *self.calls.lock().unwrap() += 1;

        let step = match self.steps.lock().unwrap().pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = Some(step.clone());
                step
            }
            None => self.last.lock().unwrap().clone().unwrap_or(Step::Empty),
        };

        match step {
            Step::Run(mut snapshot) => {
                snapshot.observed_at = chrono::Utc::now();
                Ok(Some(snapshot))
            }
            Step::Empty => Ok(None),
            Step::Hang => std::future::pending().await,
            Step::Fail(message) => Err(CigateError::Api {
                status: 502,
                message,
            }),
        }
    }

    fn describe(&self) -> String {
        "scripted source".to_string()
    }
}

/// Records every event it receives.
pub struct CollectSink {
    events: Mutex<Vec<WatchEvent>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<WatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(WatchEvent::kind).collect()
    }
}

impl NotificationSink for CollectSink {
    fn notify(&self, event: &WatchEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Pull-request lookup and merge endpoint in one fake.
pub struct FakeHost {
    pr: Option<PrMetadata>,
    lookup_error: Option<String>,
    reject_with: Option<String>,
    merge_calls: Mutex<Vec<u64>>,
}

impl FakeHost {
    pub fn merging() -> Self {
        Self {
            pr: None,
            lookup_error: None,
            reject_with: None,
            merge_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(message: &str) -> Self {
        Self {
            reject_with: Some(message.to_string()),
            ..Self::merging()
        }
    }

    pub fn with_pr(mut self, pr: PrMetadata) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn with_lookup_error(mut self, message: &str) -> Self {
        self.lookup_error = Some(message.to_string());
        self
    }

    pub fn merge_calls(&self) -> Vec<u64> {
        self.merge_calls.lock().unwrap().clone()
    }

    fn lookup(&self) -> Result<Option<PrMetadata>> {
        match &self.lookup_error {
            Some(message) => Err(CigateError::Api {
                status: 500,
                message: message.clone(),
            }),
            None => Ok(self.pr.clone()),
        }
    }
}

#[async_trait]
impl PullRequestSource for FakeHost {
    async fn pull_request(&self, number: u64) -> Result<Option<PrMetadata>> {
        Ok(self.lookup()?.filter(|pr| pr.number == number))
    }

    async fn pull_request_for_branch(&self, branch: &str) -> Result<Option<PrMetadata>> {
        Ok(self.lookup()?.filter(|pr| pr.head_ref == branch))
    }
}

#[async_trait]
impl MergeHost for FakeHost {
    async fn squash_merge(&self, pr_number: u64) -> Result<MergeResponse> {
        self.merge_calls.lock().unwrap().push(pr_number);
        match &self.reject_with {
            Some(message) => Err(CigateError::Api {
                status: 405,
                message: message.clone(),
            }),
            None => Ok(MergeResponse {
                merged: true,
                message: "Pull Request successfully merged".to_string(),
            }),
        }
    }
}
