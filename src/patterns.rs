use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CigateError, Result};
use crate::watch::{millis, Conclusion};

const DEFAULT_BUILD_DURATION_MS: u64 = 240_000;
const DEFAULT_SUCCESS_RATE: f64 = 0.7;
const DEFAULT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_SUCCESS_WEIGHT: f64 = 0.1;
const DEFAULT_MAX_RECENT_FAILURES: usize = 50;

/// Learning-rate and retention knobs for [`PatternStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LearningConfig {
    /// Weight of the newest sample in the success-rate EMA.
    pub success_weight: f64,
    pub max_recent_failures: usize,
    /// Steady-state poll interval assumed for a workflow never seen before.
    pub default_interval_ms: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            success_weight: DEFAULT_SUCCESS_WEIGHT,
            max_recent_failures: DEFAULT_MAX_RECENT_FAILURES,
            default_interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

/// Running averages across every workflow. Its defaults are the cold-start
/// values of a workflow never seen before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalDefaults {
    #[serde(rename = "avgBuildTime")]
    pub avg_build_time_ms: u64,
    pub success_rate: f64,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            avg_build_time_ms: DEFAULT_BUILD_DURATION_MS,
            success_rate: DEFAULT_SUCCESS_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub branch: String,
    pub attempt_count: u32,
}

/// Learned timing and reliability of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedPattern {
    pub average_interval_ms: u64,
    pub average_build_duration_ms: u64,
    pub success_rate: f64,
    /// Completions folded into this pattern; zero for a cold-start pattern.
    #[serde(default)]
    pub samples: u64,
    #[serde(default)]
    pub recent_failures: Vec<FailureRecord>,
}

impl LearnedPattern {
    /// Cold-start pattern. Always built from the fixed defaults, never from
    /// the drifting global block.
    fn cold(interval_ms: u64) -> Self {
        let defaults = GlobalDefaults::default();
        Self {
            average_interval_ms: interval_ms,
            average_build_duration_ms: defaults.avg_build_time_ms,
            success_rate: defaults.success_rate,
            samples: 0,
            recent_failures: Vec::new(),
        }
    }

    pub fn average_build_duration(&self) -> Duration {
        Duration::from_millis(self.average_build_duration_ms)
    }
}

/// One finished run, as fed to [`PatternStore::record_completion`].
#[derive(Debug, Clone)]
pub struct CompletedRun<'a> {
    pub workflow_name: &'a str,
    pub branch: &'a str,
    pub duration: Duration,
    pub conclusion: Conclusion,
    pub attempt: u32,
    /// Poll delay in effect when the run completed.
    pub final_delay: Duration,
}

/// On-disk shape of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSnapshot {
    #[serde(default)]
    pub defaults: GlobalDefaults,
    #[serde(default)]
    pub workflows: IndexMap<String, LearnedPattern>,
}

/// Durable per-workflow history of run durations and outcomes.
///
/// Load once at startup with [`PatternStore::load`], call
/// [`PatternStore::save`] after each update. A missing or unreadable file
/// yields an empty store.
pub struct PatternStore {
    path: Option<PathBuf>,
    snapshot: PatternSnapshot,
    learning: LearningConfig,
}

impl PatternStore {
    /// A store that never touches disk.
    pub fn in_memory(learning: LearningConfig) -> Self {
        Self {
            path: None,
            snapshot: PatternSnapshot::default(),
            learning,
        }
    }

    /// Loads the store from `path`, starting empty if the file is missing
    /// or corrupt.
    pub fn load(path: impl Into<PathBuf>, learning: LearningConfig) -> Self {
        let path = path.into();

        let snapshot = if path.exists() {
            fs::read_to_string(&path)
                .map_err(CigateError::from)
                .and_then(|content| serde_json::from_str(&content).map_err(CigateError::from))
                .inspect(|_| debug!("Loaded learned patterns from: {}", path.display()))
                .unwrap_or_else(|e| {
                    warn!(
                        "Failed to load learned patterns from {} ({e}), starting empty",
                        path.display()
                    );
                    PatternSnapshot::default()
                })
        } else {
            debug!("No pattern file at {}, starting empty", path.display());
            PatternSnapshot::default()
        };

        Self {
            path: Some(path),
            snapshot,
            learning,
        }
    }

    /// Platform data location, e.g. `~/.local/share/cigate/patterns.json`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::data_dir()
            .ok_or_else(|| CigateError::Config("No data directory found".into()))?
            .join("cigate");
        Ok(dir.join("patterns.json"))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> &PatternSnapshot {
        &self.snapshot
    }

    pub fn has_pattern(&self, workflow_name: &str) -> bool {
        self.snapshot.workflows.contains_key(workflow_name)
    }

    /// Returns the learned pattern, or cold-start defaults when the workflow
    /// has no history.
    pub fn get_pattern(&self, workflow_name: &str) -> LearnedPattern {
        self.snapshot
            .workflows
            .get(workflow_name)
            .cloned()
            .unwrap_or_else(|| {
                LearnedPattern::cold(self.learning.default_interval_ms)
            })
    }

    /// Folds one completed run into its workflow's pattern and the global
    /// defaults.
    ///
    /// Durations and intervals move halfway toward the new sample; the
    /// success rate is an EMA weighted by `success_weight`.
    pub fn record_completion(&mut self, run: &CompletedRun<'_>) -> &LearnedPattern {
        let weight = self.learning.success_weight;
        let hit = if run.conclusion == Conclusion::Success {
            1.0
        } else {
            0.0
        };
        let duration_ms = millis(run.duration);
        let seed = LearnedPattern::cold(self.learning.default_interval_ms);

        let defaults = &mut self.snapshot.defaults;
        defaults.avg_build_time_ms = halfway(defaults.avg_build_time_ms, duration_ms);
        defaults.success_rate = ema(defaults.success_rate, hit, weight);

        let pattern = self
            .snapshot
            .workflows
            .entry(run.workflow_name.to_string())
            .or_insert(seed);

        pattern.average_build_duration_ms = halfway(pattern.average_build_duration_ms, duration_ms);
        pattern.average_interval_ms = halfway(pattern.average_interval_ms, millis(run.final_delay));
        pattern.success_rate = ema(pattern.success_rate, hit, weight);
        pattern.samples += 1;

        if run.conclusion == Conclusion::Failure {
            pattern.recent_failures.push(FailureRecord {
                timestamp: Utc::now(),
                branch: run.branch.to_string(),
                attempt_count: run.attempt,
            });
            let excess = pattern
                .recent_failures
                .len()
                .saturating_sub(self.learning.max_recent_failures);
            pattern.recent_failures.drain(..excess);
        }

        debug!(
            "Updated pattern for '{}': avg build {}ms, success rate {:.3}, {} samples",
            run.workflow_name,
            pattern.average_build_duration_ms,
            pattern.success_rate,
            pattern.samples
        );

        pattern
    }

    /// Writes the store to disk. No-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.snapshot)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;

        info!(
            "Saved {} learned patterns to: {}",
            self.snapshot.workflows.len(),
            path.display()
        );
        Ok(())
    }
}

fn halfway(old: u64, new: u64) -> u64 {
    old / 2 + new / 2 + (old % 2 + new % 2) / 2
}

fn ema(old: f64, sample: f64, weight: f64) -> f64 {
    old * (1.0 - weight) + sample * weight
}
