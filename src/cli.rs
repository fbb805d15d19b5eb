use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::Token;
use crate::config::Config;
use crate::eligibility::EligibilityEvaluator;
use crate::history::HistoryLog;
use crate::merge::MergeExecutor;
use crate::output::{self, WatchProgress};
use crate::patterns::PatternStore;
use crate::providers::{GitHubProvider, RunQuery};
use crate::supervisor::{Supervisor, WatchReport};
use crate::watch::{
    AdaptiveScheduler, ChannelSink, LogSink, NotificationSink, Observers, SourceErrorPolicy,
    StatusPoller,
};

#[derive(Parser)]
#[command(name = "cigate")]
#[command(author, version, about = "Adaptive CI watcher and merge gate", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Write the JSON report to this file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,

    /// Configuration file (defaults to ./cigate.{toml,json,yaml,yml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a workflow run and merge its pull request when eligible
    Watch(WatchArgs),
    /// Show what has been learned about past runs
    Patterns,
    /// Write a configuration file with every default spelled out
    Init {
        #[arg(default_value = "cigate.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show recently recorded watches
    History {
        /// Number of most recent entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Args)]
struct WatchArgs {
    #[arg(short, long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// GitHub API base URL
    #[arg(short, long)]
    url: Option<String>,

    /// Repository in 'owner/repo' form
    #[arg(short, long)]
    repo: Option<String>,

    #[arg(short, long)]
    branch: Option<String>,

    /// Only follow runs of this workflow (display name, file name or id)
    #[arg(short, long)]
    workflow: Option<String>,

    /// Follow this run instead of the latest one
    #[arg(long)]
    run_id: Option<u64>,

    /// Evaluate this pull request instead of the one open for the run's branch
    #[arg(long)]
    pr: Option<u64>,

    /// Seconds before the second poll
    #[arg(long)]
    initial_delay: Option<f64>,

    /// Upper bound on the poll interval, in seconds
    #[arg(long)]
    max_delay: Option<f64>,

    #[arg(long)]
    backoff_multiplier: Option<f64>,

    /// Give up after this many seconds
    #[arg(long)]
    max_watch_time: Option<u64>,

    #[arg(long, overrides_with = "no_auto_merge")]
    auto_merge: bool,

    #[arg(long, overrides_with = "auto_merge")]
    no_auto_merge: bool,

    /// Evaluate and report, never merge
    #[arg(long)]
    dry_run: bool,

    /// No live progress, only the final summary
    #[arg(short, long)]
    quiet: bool,

    #[arg(long, overrides_with = "no_require_reviews")]
    require_reviews: bool,

    #[arg(long, overrides_with = "require_reviews")]
    no_require_reviews: bool,

    /// Minimum score (0-100) for a merge
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    threshold: Option<u8>,

    /// Branch that accepts changes without a pull request
    #[arg(long)]
    default_branch: Option<String>,

    /// Fail after this many consecutive status query errors
    #[arg(long)]
    max_consecutive_errors: Option<u32>,
}

fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl WatchArgs {
    /// Command-line values win over the configuration file.
    fn apply(&self, config: &mut Config) {
        if let Some(token) = &self.token {
            config.github.token = Some(token.clone());
        }
        if let Some(url) = &self.url {
            config.github.base_url = url.clone();
        }
        if let Some(repo) = &self.repo {
            config.github.repo = Some(repo.clone());
        }
        if let Some(branch) = &self.default_branch {
            config.github.default_branch = branch.clone();
        }
        if let Some(secs) = self.initial_delay {
            config.scheduler.initial_delay_secs = secs;
        }
        if let Some(secs) = self.max_delay {
            config.scheduler.max_delay_secs = secs;
        }
        if let Some(multiplier) = self.backoff_multiplier {
            config.scheduler.backoff_multiplier = multiplier;
        }
        if let Some(secs) = self.max_watch_time {
            config.watch.max_watch_time_secs = secs;
        }
        if let Some(errors) = self.max_consecutive_errors {
            config.watch.max_consecutive_errors = Some(errors);
        }
        if let Some(auto_merge) = toggle(self.auto_merge, self.no_auto_merge) {
            config.merge.auto_merge = auto_merge;
        }
        if self.dry_run {
            config.merge.dry_run = true;
        }
        if let Some(require) = toggle(self.require_reviews, self.no_require_reviews) {
            config.eligibility.require_reviews = require;
        }
        if let Some(threshold) = self.threshold {
            config.eligibility.threshold = threshold;
        }
    }
}

impl Cli {
    async fn execute_watch(&self, args: &WatchArgs) -> Result<i32> {
        let mut config = Config::load(self.config.as_deref())?;
        args.apply(&mut config);

        let repo = config
            .github
            .repo
            .clone()
            .context("No repository given: pass --repo owner/repo or set github.repo")?;
        let scheduler = config.scheduler.to_scheduler_config()?;
        let token = config.github.token.as_deref().map(Token::from);

        info!("Watching GitHub Actions runs for repository: {}", repo);

        let provider = Arc::new(GitHubProvider::new(
            &config.github.base_url,
            &repo,
            token,
            RunQuery {
                branch: args.branch.clone(),
                workflow: args.workflow.clone(),
                run_id: args.run_id,
            },
        )?);

        let mut store = open_patterns(&config)?;
        if let Some(path) = store.path() {
            info!("Learned patterns at: {}", path.display());
        }

        let history = open_history(&config)?;
        if let Some(path) = history.path() {
            info!("Recording history to: {}", path.display());
        }

        let mut observers = Observers::new().with(Arc::new(LogSink));
        let progress = if args.quiet {
            None
        } else {
            let (sink, events) = ChannelSink::channel();
            observers = observers.with(Arc::new(sink));
            Some(WatchProgress::spawn(events))
        };
        let sink: Arc<dyn NotificationSink> = Arc::new(observers);

        let error_policy = match config.watch.max_consecutive_errors {
            Some(max) => SourceErrorPolicy::give_up_after(max),
            None => SourceErrorPolicy::retry_until_timeout(),
        };

        let poller = StatusPoller::new(
            provider.clone(),
            AdaptiveScheduler::new(scheduler),
            sink.clone(),
            error_policy,
        );
        let mut supervisor = Supervisor::new(
            poller,
            provider.clone(),
            EligibilityEvaluator::new(config.eligibility_options()),
            MergeExecutor::new(provider, config.merge.dry_run),
            history,
            sink,
        )
        .with_pr_number(args.pr)
        .with_auto_merge(config.merge.auto_merge);

        let cancel = CancellationToken::new();
        let on_ctrl_c = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling watch");
                    cancel.cancel();
                }
            }
        });

        let max_watch_time = Duration::from_secs(config.watch.max_watch_time_secs);
        let result = supervisor.run(&mut store, max_watch_time, &cancel).await;

        on_ctrl_c.abort();
        // Dropping the supervisor closes the event channel and lets the
        // progress task finish.
        drop(supervisor);
        if let Some(progress) = progress {
            if let Err(e) = progress.await {
                warn!("Progress display failed: {e}");
            }
        }

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!("Watch failed: {e}");
                output::print_failure(&e.to_string());
                return Ok(1);
            }
        };
        self.write_report(&report)?;
        output::print_summary(&report);

        Ok(report.exit_code())
    }

    fn execute_patterns(&self) -> Result<i32> {
        let config = Config::load(self.config.as_deref())?;
        let store = open_patterns(&config)?;
        output::print_patterns(store.snapshot());
        Ok(0)
    }

    fn execute_history(&self, limit: usize) -> Result<i32> {
        let config = Config::load(self.config.as_deref())?;
        let history = open_history(&config)?;
        if history.path().is_none() {
            warn!("History is disabled in the configuration");
        }

        let entries = history.entries().context("Failed to read watch history")?;
        let start = entries.len().saturating_sub(limit);
        output::print_history(&entries[start..]);
        Ok(0)
    }

    fn execute_init(&self, path: &Path, force: bool) -> Result<i32> {
        if path.exists() && !force {
            bail!(
                "{} already exists, pass --force to overwrite it",
                path.display()
            );
        }

        Config::default().save(path)?;
        info!("Wrote default configuration to: {}", path.display());
        Ok(0)
    }

    fn write_report(&self, report: &WatchReport) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output).with_context(|| {
                format!("Failed to write report to: {}", output_path.display())
            })?;
            info!("Report written to: {}", output_path.display());
        } else {
            println!("{}", json_output);
        }

        Ok(())
    }

    /// False for `watch --quiet`.
    pub fn shows_banner(&self) -> bool {
        !matches!(&self.command, Commands::Watch(args) if args.quiet)
    }

    /// Runs the selected subcommand and returns the process exit code.
    pub async fn execute(&self) -> Result<i32> {
        match &self.command {
            Commands::Watch(args) => self.execute_watch(args).await,
            Commands::Patterns => self.execute_patterns(),
            Commands::Init { path, force } => self.execute_init(path, *force),
            Commands::History { limit } => self.execute_history(*limit),
        }
    }
}

fn open_patterns(config: &Config) -> Result<PatternStore> {
    let path = match &config.storage.patterns_file {
        Some(path) => path.clone(),
        None => PatternStore::default_path()?,
    };
    Ok(PatternStore::load(path, config.learning.clone()))
}

fn open_history(config: &Config) -> Result<HistoryLog> {
    if config.storage.disable_history {
        return Ok(HistoryLog::disabled());
    }
    let path = match &config.storage.history_file {
        Some(path) => path.clone(),
        None => HistoryLog::default_path()?,
    };
    Ok(HistoryLog::open(path))
}
