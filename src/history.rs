use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::eligibility::EligibilityResult;
use crate::error::{CigateError, Result};
use crate::merge::MergeAction;
use crate::watch::RunSnapshot;

/// How a watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    TimedOut,
    Cancelled,
    /// The status source failed too often in a row; no run verdict exists.
    Errored,
}

/// One audit record per finished watch. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionHistoryEntry {
    pub recorded_at: DateTime<Utc>,
    pub termination: Termination,
    pub run: Option<RunSnapshot>,
    pub eligibility: Option<EligibilityResult>,
    pub action: MergeAction,
    /// The run did not succeed (CI failure, timeout, or cancellation).
    pub failure: bool,
    pub details: String,
}

/// Append-only JSON-lines audit log.
///
/// Entries are written for diagnostics only; nothing reads them back into
/// decisions.
pub struct HistoryLog {
    path: Option<PathBuf>,
}

impl HistoryLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A log that discards entries.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Platform data location, e.g. `~/.local/share/cigate/history.jsonl`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::data_dir()
            .ok_or_else(|| CigateError::Config("No data directory found".into()))?
            .join("cigate");
        Ok(dir.join("history.jsonl"))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, entry: &CompletionHistoryEntry) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;

        debug!("Appended history entry to: {}", path.display());
        Ok(())
    }

    /// Reads every entry back, skipping lines that fail to parse.
    pub fn entries(&self) -> Result<Vec<CompletionHistoryEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{Conclusion, RunState};
    use tempfile::TempDir;

    fn entry(action: MergeAction, failure: bool) -> CompletionHistoryEntry {
        CompletionHistoryEntry {
            recorded_at: Utc::now(),
            termination: Termination::Completed,
            run: Some(RunSnapshot::new(
                "1",
                "CI",
                "main",
                RunState::Completed(Conclusion::Success),
            )),
            eligibility: None,
            action,
            failure,
            details: String::new(),
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let log = HistoryLog::open(temp_dir.path().join("audit").join("history.jsonl"));

        log.append(&entry(MergeAction::MergeSucceeded, false)).unwrap();
        log.append(&entry(MergeAction::None, true)).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, MergeAction::MergeSucceeded);
        assert_eq!(entries[1].action, MergeAction::None);
        assert!(entries[1].failure);
    }

    #[test]
    fn test_existing_lines_are_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("history.jsonl");
        let log = HistoryLog::open(&path);

        log.append(&entry(MergeAction::Skipped, false)).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        log.append(&entry(MergeAction::DryRun, false)).unwrap();
        let both = fs::read_to_string(&path).unwrap();

        assert!(both.starts_with(&first));
        assert_eq!(both.lines().count(), 2);
    }

    #[test]
    fn test_disabled_log_discards() {
        let log = HistoryLog::disabled();
        log.append(&entry(MergeAction::None, true)).unwrap();
        assert!(log.entries().unwrap().is_empty());
        assert!(log.path().is_none());
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("history.jsonl");
        fs::write(&path, "not json\n").unwrap();

        let log = HistoryLog::open(&path);
        log.append(&entry(MergeAction::DirectPush, false)).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, MergeAction::DirectPush);
    }
}
