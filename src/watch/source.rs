use async_trait::async_trait;

use crate::error::Result;

use super::types::RunSnapshot;

/// Reports the current state of the pipeline run being watched.
///
/// `Ok(None)` means the host has no matching run yet, which is a normal
/// state: the poller keeps polling. An `Err` (network failure or
/// unparseable payload) is retried under the poller's error policy.
#[async_trait]
pub trait RunStatusSource: Send + Sync {
    async fn latest_run(&self) -> Result<Option<RunSnapshot>>;

    /// Short human-readable description used in log lines.
    fn describe(&self) -> String;
}
