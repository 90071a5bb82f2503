//! Deciding when feeds are polled and running the polls.
//!
//! - [`backoff`] - feed-level poll spacing after success and failure
//! - [`locks`] - per-feed mutual exclusion (`Idle` / `Polling`)
//! - [`poller`] - the tick loop, bounded worker pool and graceful drain

pub mod backoff;
pub mod locks;
pub mod poller;

pub use backoff::BackoffPolicy;
pub use locks::{FeedLocks, PollGuard, PollState};
pub use poller::{PollError, PollReport, PollSettings, PollSummary, Poller, PollerStats};
