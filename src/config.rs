use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::eligibility::{EligibilityOptions, EligibilityWeights};
use crate::patterns::LearningConfig;
use crate::watch::SchedulerConfig;

/// Configuration file structure for cigate.
///
/// Every value can be overridden from the command line. Files are loaded
/// from the current directory or from an explicit `--config` path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub watch: WatchSection,

    #[serde(default)]
    pub eligibility: EligibilitySection,

    #[serde(default)]
    pub merge: MergeSection,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitHubConfig {
    /// GitHub personal access token
    pub token: Option<String>,

    /// GitHub API base URL
    #[serde(default = "default_github_base_url")]
    pub base_url: String,

    /// Repository path (e.g., 'owner/repo')
    pub repo: Option<String>,

    /// Branch that accepts changes without a pull request
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerSection {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: f64,

    #[serde(default = "default_min_delay_secs")]
    pub min_delay_secs: f64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_speed_up_factor")]
    pub speed_up_factor: f64,

    #[serde(default = "default_remaining_time_divisor")]
    pub remaining_time_divisor: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchSection {
    /// Upper bound on one watch
    #[serde(default = "default_max_watch_time_secs")]
    pub max_watch_time_secs: u64,

    /// Give up after this many failed fetches in a row; unset retries until timeout
    #[serde(default)]
    pub max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EligibilitySection {
    #[serde(default = "default_threshold")]
    pub threshold: u8,

    #[serde(default = "default_true")]
    pub require_reviews: bool,

    #[serde(default)]
    pub weights: EligibilityWeights,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MergeSection {
    #[serde(default)]
    pub auto_merge: bool,

    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageSection {
    /// Learned patterns file; defaults to the platform data directory
    pub patterns_file: Option<PathBuf>,

    /// Completion history (JSON lines); defaults to the platform data directory
    pub history_file: Option<PathBuf>,

    /// Skip writing completion history
    #[serde(default)]
    pub disable_history: bool,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_github_base_url(),
            repo: None,
            default_branch: default_branch(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            initial_delay_secs: defaults.initial_delay.as_secs_f64(),
            min_delay_secs: defaults.min_delay.as_secs_f64(),
            max_delay_secs: defaults.max_delay.as_secs_f64(),
            backoff_multiplier: defaults.backoff_multiplier,
            speed_up_factor: defaults.speed_up_factor,
            remaining_time_divisor: defaults.remaining_time_divisor,
        }
    }
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            max_watch_time_secs: default_max_watch_time_secs(),
            max_consecutive_errors: None,
        }
    }
}

impl Default for EligibilitySection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            require_reviews: true,
            weights: EligibilityWeights::default(),
        }
    }
}

fn default_github_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_initial_delay_secs() -> f64 {
    SchedulerConfig::default().initial_delay.as_secs_f64()
}

fn default_min_delay_secs() -> f64 {
    SchedulerConfig::default().min_delay.as_secs_f64()
}

fn default_max_delay_secs() -> f64 {
    SchedulerConfig::default().max_delay.as_secs_f64()
}

fn default_backoff_multiplier() -> f64 {
    SchedulerConfig::default().backoff_multiplier
}

fn default_speed_up_factor() -> f64 {
    SchedulerConfig::default().speed_up_factor
}

fn default_remaining_time_divisor() -> u32 {
    SchedulerConfig::default().remaining_time_divisor
}

fn default_max_watch_time_secs() -> u64 {
    30 * 60
}

fn default_threshold() -> u8 {
    EligibilityOptions::default().threshold
}

fn default_true() -> bool {
    true
}

fn secs(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("Invalid {name}: {value} seconds"))
}

impl SchedulerSection {
    /// Converts to a validated [`SchedulerConfig`].
    pub fn to_scheduler_config(&self) -> Result<SchedulerConfig> {
        let config = SchedulerConfig {
            initial_delay: secs(self.initial_delay_secs, "initial delay")?,
            min_delay: secs(self.min_delay_secs, "min delay")?,
            max_delay: secs(self.max_delay_secs, "max delay")?,
            backoff_multiplier: self.backoff_multiplier,
            speed_up_factor: self.speed_up_factor,
            remaining_time_divisor: self.remaining_time_divisor,
        };

        if let Err(message) = config.validate() {
            bail!("Invalid scheduler configuration: {message}");
        }
        Ok(config)
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./cigate.toml
    /// 3. ./cigate.json
    /// 4. ./cigate.yaml
    /// 5. ./cigate.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = ["cigate.toml", "cigate.json", "cigate.yaml", "cigate.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        let config: Self = match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };

        if config.eligibility.threshold > 100 {
            bail!(
                "Eligibility threshold must be between 0 and 100, got {}",
                config.eligibility.threshold
            );
        }
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn eligibility_options(&self) -> EligibilityOptions {
        EligibilityOptions {
            threshold: self.eligibility.threshold,
            require_reviews: self.eligibility.require_reviews,
            default_branch: self.github.default_branch.clone(),
            weights: self.eligibility.weights.clone(),
        }
    }
}
