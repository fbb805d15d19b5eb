//! The watch loop.
//!
//! ```text
//! Idle -> Watching -> Completed | TimedOut
//!            ^  |
//!            |  v
//!          Errored   (transient: a failed status query, retried after a sleep)
//! ```
//!
//! Suspension happens only while awaiting the status source and while
//! sleeping between polls. Both race against the cancellation token, so a
//! cancel takes effect without waiting for the current interval to elapse.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CigateError, Result};
use crate::patterns::{CompletedRun, PatternStore};

use super::events::{NotificationSink, WatchEvent};
use super::scheduler::{AdaptiveScheduler, LearnedHint};
use super::source::RunStatusSource;
use super::types::{millis, RunSnapshot, RunStatus, TransitionAnalysis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Watching,
    Completed,
    TimedOut,
    Errored,
}

/// What to do when the status source keeps failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceErrorPolicy {
    /// Give up after this many consecutive failures. `None` retries until
    /// the watch times out.
    pub max_consecutive_errors: Option<u32>,
}

impl SourceErrorPolicy {
    pub fn retry_until_timeout() -> Self {
        Self::default()
    }

    pub fn give_up_after(errors: u32) -> Self {
        Self {
            max_consecutive_errors: Some(errors.max(1)),
        }
    }

    fn exhausted(&self, consecutive: u32) -> bool {
        self.max_consecutive_errors
            .is_some_and(|max| consecutive >= max)
    }
}

/// Terminal result of a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    Completed {
        snapshot: RunSnapshot,
        analysis: TransitionAnalysis,
    },
    TimedOut {
        last: Option<RunSnapshot>,
        elapsed: Duration,
    },
    Cancelled {
        last: Option<RunSnapshot>,
    },
}

/// Restores the poller state when a watch ends, including when the watch
/// future is dropped mid-flight.
struct StateGuard<'a> {
    state: &'a Mutex<PollerState>,
    on_exit: PollerState,
}

impl StateGuard<'_> {
    fn set(&self, state: PollerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.set(self.on_exit);
    }
}

/// Watches one pipeline run at a time.
pub struct StatusPoller {
    source: Arc<dyn RunStatusSource>,
    scheduler: AdaptiveScheduler,
    sink: Arc<dyn NotificationSink>,
    error_policy: SourceErrorPolicy,
    state: Mutex<PollerState>,
}

impl StatusPoller {
    pub fn new(
        source: Arc<dyn RunStatusSource>,
        scheduler: AdaptiveScheduler,
        sink: Arc<dyn NotificationSink>,
        error_policy: SourceErrorPolicy,
    ) -> Self {
        Self {
            source,
            scheduler,
            sink,
            error_policy,
            state: Mutex::new(PollerState::Idle),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) -> Result<StateGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, PollerState::Watching | PollerState::Errored) {
            return Err(CigateError::AlreadyWatching);
        }
        *state = PollerState::Watching;

        Ok(StateGuard {
            state: &self.state,
            on_exit: PollerState::Idle,
        })
    }

    /// Polls until the run completes, `max_watch_time` elapses, or `cancel`
    /// fires.
    ///
    /// Source errors are retried at the current delay and never advance the
    /// scheduler. They only end the watch when the error policy gives up,
    /// which surfaces as [`CigateError::SourceExhausted`]. Timeout and
    /// cancellation are ordinary outcomes.
    pub async fn watch(
        &self,
        store: &mut PatternStore,
        max_watch_time: Duration,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome> {
        let mut guard = self.start()?;
        let started = Instant::now();

        self.sink.notify(&WatchEvent::Started {
            source: self.source.describe(),
            max_watch_time_ms: millis(max_watch_time),
        });

        let mut delay = self.scheduler.initial_delay();
        let mut previous: Option<RunSnapshot> = None;
        let mut consecutive_errors = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(previous));
            }

            let elapsed = started.elapsed();
            if elapsed >= max_watch_time {
                self.sink.notify(&WatchEvent::TimedOut {
                    elapsed_ms: millis(elapsed),
                });
                guard.on_exit = PollerState::TimedOut;
                return Ok(WatchOutcome::TimedOut {
                    last: previous,
                    elapsed,
                });
            }

            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(self.cancelled(previous)),
                fetched = self.source.latest_run() => fetched,
            };

            match fetched {
                Err(e) => {
                    consecutive_errors += 1;
                    guard.set(PollerState::Errored);
                    self.sink.notify(&WatchEvent::SourceError {
                        message: e.to_string(),
                        consecutive: consecutive_errors,
                    });

                    if self.error_policy.exhausted(consecutive_errors) {
                        return Err(CigateError::SourceExhausted {
                            attempts: consecutive_errors,
                            last_error: e.to_string(),
                        });
                    }
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    guard.set(PollerState::Watching);
                    self.sink.notify(&WatchEvent::NoRun);
                    delay = self.scheduler.next_delay(delay, false, false, None);
                }
                Ok(Some(snapshot)) => {
                    consecutive_errors = 0;
                    guard.set(PollerState::Watching);

                    let elapsed = started.elapsed();
                    let analysis = TransitionAnalysis::between(previous.as_ref(), &snapshot, elapsed);

                    if analysis.is_completed {
                        self.report_observation(previous.as_ref(), &snapshot, &analysis, None);
                        self.learn(store, &snapshot, elapsed, delay);
                        self.sink.notify(&WatchEvent::Completed {
                            snapshot: snapshot.clone(),
                            analysis: analysis.clone(),
                        });
                        guard.on_exit = PollerState::Completed;
                        return Ok(WatchOutcome::Completed { snapshot, analysis });
                    }

                    let hint = (snapshot.status() == RunStatus::Running
                        && store.has_pattern(&snapshot.workflow_name))
                    .then(|| LearnedHint {
                        average_build_duration: store
                            .get_pattern(&snapshot.workflow_name)
                            .average_build_duration(),
                        elapsed_since_watch_start: elapsed,
                    });

                    delay = self.scheduler.next_delay(
                        delay,
                        analysis.status_changed,
                        analysis.is_success,
                        hint,
                    );
                    self.report_observation(previous.as_ref(), &snapshot, &analysis, Some(delay));
                    previous = Some(snapshot);
                }
            }

            let remaining = max_watch_time.saturating_sub(started.elapsed());
            let nap = delay.min(remaining);
            debug!("Sleeping {:.1}s before next poll", nap.as_secs_f64());

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(self.cancelled(previous)),
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    fn report_observation(
        &self,
        previous: Option<&RunSnapshot>,
        snapshot: &RunSnapshot,
        analysis: &TransitionAnalysis,
        next_delay: Option<Duration>,
    ) {
        self.sink.notify(&WatchEvent::Status {
            snapshot: snapshot.clone(),
            next_delay_ms: next_delay.map(millis),
        });

        if analysis.status_changed {
            self.sink.notify(&WatchEvent::Transition {
                run_id: snapshot.id.clone(),
                from: previous.map(RunSnapshot::status),
                to: snapshot.status(),
            });
        }
    }

    fn learn(&self, store: &mut PatternStore, snapshot: &RunSnapshot, elapsed: Duration, delay: Duration) {
        let Some(conclusion) = snapshot.conclusion() else {
            return;
        };

        store.record_completion(&CompletedRun {
            workflow_name: &snapshot.workflow_name,
            branch: &snapshot.branch,
            duration: snapshot.duration_or(elapsed),
            conclusion,
            attempt: snapshot.attempt,
            final_delay: delay,
        });

        if let Err(e) = store.save() {
            warn!("Failed to save learned patterns: {e}");
        }
    }

    fn cancelled(&self, last: Option<RunSnapshot>) -> WatchOutcome {
        self.sink.notify(&WatchEvent::Cancelled);
        WatchOutcome::Cancelled { last }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::LearningConfig;
    use crate::test_utils::{running, succeeded, failed, CollectSink, ScriptedSource, Step};
    use crate::watch::scheduler::SchedulerConfig;
    use crate::watch::Conclusion;

    fn fast_scheduler() -> AdaptiveScheduler {
        AdaptiveScheduler::new(SchedulerConfig {
            initial_delay: Duration::from_millis(2),
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..SchedulerConfig::default()
        })
    }

    fn poller(source: Arc<ScriptedSource>, sink: Arc<CollectSink>, policy: SourceErrorPolicy) -> StatusPoller {
        StatusPoller::new(source, fast_scheduler(), sink, policy)
    }

    fn store() -> PatternStore {
        PatternStore::in_memory(LearningConfig::default())
    }

    #[tokio::test]
    async fn test_watch_until_success() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Run(running("1")),
            Step::Run(running("1")),
            Step::Run(succeeded("1")),
        ]));
        let sink = Arc::new(CollectSink::new());
        let poller = poller(source.clone(), sink.clone(), SourceErrorPolicy::default());
        let mut store = store();

        let outcome = poller
            .watch(&mut store, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            WatchOutcome::Completed { snapshot, analysis } => {
                assert_eq!(snapshot.conclusion(), Some(Conclusion::Success));
                assert!(analysis.status_changed);
                assert!(analysis.is_success);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(source.calls(), 3);
        assert_eq!(poller.state(), PollerState::Completed);
        assert_eq!(store.get_pattern("CI").samples, 1);
        assert!((store.get_pattern("CI").success_rate - 0.73).abs() < 1e-9);

        let kinds = sink.kinds();
        assert_eq!(kinds.first().copied(), Some("started"));
        assert!(kinds.contains(&"transition"));
        assert_eq!(kinds.last().copied(), Some("completed"));
    }

    #[tokio::test]
    async fn test_failure_is_learned() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Run(failed("5"))]));
        let sink = Arc::new(CollectSink::new());
        let poller = poller(source, sink, SourceErrorPolicy::default());
        let mut store = store();

        let outcome = poller
            .watch(&mut store, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, WatchOutcome::Completed { ref snapshot, .. } if snapshot.is_failure()));
        assert_eq!(store.get_pattern("CI").recent_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_times_out_while_running() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Run(running("1"))]));
        let sink = Arc::new(CollectSink::new());
        let poller = poller(source.clone(), sink.clone(), SourceErrorPolicy::default());
        let mut store = store();

        let outcome = poller
            .watch(&mut store, Duration::from_millis(30), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            WatchOutcome::TimedOut { last, elapsed } => {
                assert_eq!(last.map(|s| s.status()), Some(RunStatus::Running));
                assert!(elapsed >= Duration::from_millis(30));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(source.calls() >= 2);
        assert_eq!(poller.state(), PollerState::TimedOut);
        assert_eq!(sink.kinds().last().copied(), Some("timed_out"));
        assert!(!store.has_pattern("CI"));
    }

    #[tokio::test]
    async fn test_source_errors_are_retried() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Fail("connection reset".into()),
            Step::Fail("unexpected end of JSON".into()),
            Step::Empty,
            Step::Run(succeeded("1")),
        ]));
        let sink = Arc::new(CollectSink::new());
        let poller = poller(source.clone(), sink.clone(), SourceErrorPolicy::default());

        let outcome = poller
            .watch(&mut store(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, WatchOutcome::Completed { .. }));
        assert_eq!(source.calls(), 4);
        let kinds = sink.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "source_error").count(), 2);
        assert!(kinds.contains(&"no_run"));
    }

    #[tokio::test]
    async fn test_error_policy_gives_up() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Fail("502 Bad Gateway".into())]));
        let sink = Arc::new(CollectSink::new());
        let poller = poller(source.clone(), sink, SourceErrorPolicy::give_up_after(3));

        let err = poller
            .watch(&mut store(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CigateError::SourceExhausted { attempts: 3, .. }));
        assert_eq!(source.calls(), 3);
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Run(running("1"))]));
        let sink = Arc::new(CollectSink::new());
        let slow = AdaptiveScheduler::new(SchedulerConfig {
            initial_delay: Duration::from_secs(60),
            ..SchedulerConfig::default()
        });
        let poller = StatusPoller::new(source, slow, sink.clone(), SourceErrorPolicy::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            poller.watch(&mut store(), Duration::from_secs(600), &cancel),
        )
        .await
        .expect("cancellation should end the watch promptly")
        .unwrap();

        assert!(matches!(outcome, WatchOutcome::Cancelled { last: Some(_) }));
        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(sink.kinds().last().copied(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_status_query() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Hang]));
        let sink = Arc::new(CollectSink::new());
        let poller = poller(source.clone(), sink.clone(), SourceErrorPolicy::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            poller.watch(&mut store(), Duration::from_secs(600), &cancel),
        )
        .await
        .expect("cancellation should interrupt the status query")
        .unwrap();

        assert!(matches!(outcome, WatchOutcome::Cancelled { last: None }));
        assert_eq!(source.calls(), 1);
        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(sink.kinds(), vec!["started", "cancelled"]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_polls_nothing() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Run(running("1"))]));
        let poller = poller(source.clone(), Arc::new(CollectSink::new()), SourceErrorPolicy::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = poller
            .watch(&mut store(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, WatchOutcome::Cancelled { last: None }));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_second_concurrent_watch_fails_fast() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Run(running("1")),
            Step::Run(succeeded("1")),
        ]));
        let poller = poller(source, Arc::new(CollectSink::new()), SourceErrorPolicy::default());
        let cancel = CancellationToken::new();
        let mut first_store = store();
        let mut second_store = store();

        let (first, second) = tokio::join!(
            poller.watch(&mut first_store, Duration::from_secs(5), &cancel),
            poller.watch(&mut second_store, Duration::from_secs(5), &cancel),
        );

        assert!(matches!(first, Ok(WatchOutcome::Completed { .. })));
        assert!(matches!(second, Err(CigateError::AlreadyWatching)));
    }

    #[tokio::test]
    async fn test_poller_can_watch_again_after_completion() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Run(succeeded("1"))]));
        let poller = poller(source, Arc::new(CollectSink::new()), SourceErrorPolicy::default());
        let mut store = store();
        let cancel = CancellationToken::new();

        poller.watch(&mut store, Duration::from_secs(5), &cancel).await.unwrap();
        poller.watch(&mut store, Duration::from_secs(5), &cancel).await.unwrap();

        assert_eq!(store.get_pattern("CI").samples, 2);
    }

    #[test]
    fn test_error_policy_bounds() {
        assert!(!SourceErrorPolicy::retry_until_timeout().exhausted(u32::MAX));
        assert!(SourceErrorPolicy::give_up_after(0).exhausted(1));
        assert!(!SourceErrorPolicy::give_up_after(3).exhausted(2));
    }
}
