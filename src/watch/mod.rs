mod events;
mod poller;
mod scheduler;
mod source;
mod types;

pub use events::{ChannelSink, LogSink, NotificationSink, Observers, WatchEvent};
pub use poller::{PollerState, SourceErrorPolicy, StatusPoller, WatchOutcome};
pub use scheduler::{AdaptiveScheduler, LearnedHint, SchedulerConfig};
pub use source::RunStatusSource;
pub use types::{Conclusion, RunSnapshot, RunState, RunStatus, TransitionAnalysis};
pub(crate) use types::millis;
