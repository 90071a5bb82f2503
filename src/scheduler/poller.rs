use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use super::backoff::BackoffPolicy;
use super::locks::{FeedLocks, PollGuard};
use crate::feed::{filter_new, parse_feed, spawn_icon_fetch, FetchError, Fetcher, ParseError};
use crate::shutdown::ShutdownSignal;
use crate::snapshot::write_snapshot;
use crate::storage::{CandidatePost, Database, DatabaseError, Feed, FeedSchedule, PollOutcome};

/// Scheduler tuning, normally built from the `[polling]` config section.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub backoff: BackoffPolicy,
    pub max_concurrent_polls: usize,
    pub tick_interval: Duration,
    /// Longest a tick waits for a free worker before deferring the rest
    pub slot_wait: Duration,
    pub fetch_timeout: Duration,
    pub icon_timeout: Duration,
    /// Icons are not downloaded when unset
    pub icon_dir: Option<PathBuf>,
    /// Rewritten after polls that stored new posts; never written when unset
    pub snapshot_path: Option<PathBuf>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_concurrent_polls: 10,
            tick_interval: Duration::from_secs(5),
            slot_wait: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(30),
            icon_timeout: Duration::from_secs(10),
            icon_dir: None,
            snapshot_path: None,
        }
    }
}

/// Feed-scoped failure of one poll. Recorded as the feed's `last_error`.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Entries that parsed into candidate posts
    pub candidates: usize,
    pub new_posts: usize,
    /// Entries dropped for lacking a link
    pub skipped_entries: usize,
    pub fallback_dates: usize,
}

/// What happened to one dispatched feed.
#[derive(Debug)]
pub enum PollReport {
    /// Another poll of the same feed was in flight; nothing was fetched
    Skipped,
    Succeeded {
        summary: PollSummary,
        schedule: FeedSchedule,
    },
    /// `schedule` is `None` only if the failure itself could not be recorded
    Failed {
        error: PollError,
        schedule: Option<FeedSchedule>,
    },
}

impl PollReport {
    pub fn is_success(&self) -> bool {
        matches!(self, PollReport::Succeeded { .. })
    }
}

/// Totals over the polls a run has joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub panicked: usize,
    pub new_posts: usize,
}

impl PollerStats {
    fn record(&mut self, report: &PollReport) {
        match report {
            PollReport::Succeeded { summary, .. } => {
                self.succeeded += 1;
                self.new_posts += summary.new_posts;
            }
            PollReport::Failed { .. } => self.failed += 1,
            PollReport::Skipped => self.skipped += 1,
        }
    }
}

/// Feed link of every spawned poll task, keyed by task id.
type InFlight = HashMap<Id, String>;

/// Recorded as `last_error` when a poll task panics.
const PANIC_ERROR: &str = "poll task panicked";

/// Polls due feeds on a fixed tick with a bounded worker pool.
///
/// Cloning is cheap and clones share the worker pool and the per-feed locks.
#[derive(Clone)]
pub struct Poller {
    db: Database,
    fetcher: Fetcher,
    settings: Arc<PollSettings>,
    locks: FeedLocks,
    slots: Arc<Semaphore>,
    shutdown: ShutdownSignal,
}

impl Poller {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        settings: PollSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_polls.max(1)));
        Self {
            db,
            fetcher,
            settings: Arc::new(settings),
            locks: FeedLocks::new(),
            slots,
            shutdown,
        }
    }

    pub fn locks(&self) -> &FeedLocks {
        &self.locks
    }

    /// Poll one feed now, regardless of its schedule.
    ///
    /// Returns [`PollReport::Skipped`] without fetching if the feed is
    /// already being polled.
    pub async fn poll_feed(&self, feed: &Feed) -> PollReport {
        match self.locks.try_begin(&feed.link) {
            Some(guard) => self.poll_locked(feed, guard).await,
            None => {
                tracing::debug!(feed = %feed.link, "Poll already in flight, skipping");
                PollReport::Skipped
            }
        }
    }

    async fn poll_locked(&self, feed: &Feed, _guard: PollGuard) -> PollReport {
        let result = self.ingest(feed).await;

        let outcome = match &result {
            Ok(_) => PollOutcome::Success { at: Utc::now() },
            Err(e) => PollOutcome::Failure {
                at: Utc::now(),
                error: e.to_string(),
            },
        };
        let recorded = self
            .db
            .record_poll_result(&feed.link, &outcome, &self.settings.backoff)
            .await;

        match (result, recorded) {
            (Ok(summary), Ok(schedule)) => {
                tracing::info!(
                    feed = %feed.link,
                    new_posts = summary.new_posts,
                    candidates = summary.candidates,
                    next_poll_at = %schedule.next_poll_at,
                    "Feed polled"
                );
                self.maybe_fetch_icon(&feed.link).await;
                PollReport::Succeeded { summary, schedule }
            }
            (Ok(_), Err(e)) => {
                tracing::error!(feed = %feed.link, error = %e, "Failed to record poll result");
                PollReport::Failed {
                    error: PollError::Store(e),
                    schedule: None,
                }
            }
            (Err(error), Ok(schedule)) => {
                tracing::warn!(
                    feed = %feed.link,
                    error = %error,
                    consecutive_failures = schedule.consecutive_failures,
                    next_poll_at = %schedule.next_poll_at,
                    "Feed poll failed"
                );
                PollReport::Failed {
                    error,
                    schedule: Some(schedule),
                }
            }
            (Err(error), Err(e)) => {
                tracing::error!(
                    feed = %feed.link,
                    error = %error,
                    record_error = %e,
                    "Feed poll failed and the failure could not be recorded"
                );
                PollReport::Failed {
                    error,
                    schedule: None,
                }
            }
        }
    }

    /// Fetch, parse, dedup, store.
    async fn ingest(&self, feed: &Feed) -> Result<PollSummary, PollError> {
        let bytes = self
            .fetcher
            .fetch(&feed.link, self.settings.fetch_timeout)
            .await?;

        let parsed = parse_feed(&bytes, Utc::now())?;
        if parsed.skipped > 0 {
            tracing::warn!(
                feed = %feed.link,
                skipped = parsed.skipped,
                "Skipped feed entries without a link"
            );
        }

        self.db
            .apply_feed_metadata(&feed.link, &parsed.metadata)
            .await?;

        let candidates = parsed.posts.len();
        let fresh = filter_new(&self.db, &feed.link, parsed.posts.clone()).await?;
        let new_posts = self.db.upsert_posts(&feed.link, &fresh).await?;

        // Already stored: only a corrected title is applied
        let fresh_links: HashSet<&str> = fresh.iter().map(|p| p.link.as_str()).collect();
        let stored: Vec<CandidatePost> = parsed
            .posts
            .into_iter()
            .filter(|p| !fresh_links.contains(p.link.as_str()))
            .collect();
        let retitled = self.db.refresh_post_titles(&feed.link, &stored).await?;
        if retitled > 0 {
            tracing::debug!(feed = %feed.link, retitled, "Applied title corrections");
        }

        if new_posts != fresh.len() {
            tracing::warn!(
                feed = %feed.link,
                expected = fresh.len(),
                inserted = new_posts,
                "Store ignored posts that deduplication reported as new"
            );
        }

        Ok(PollSummary {
            candidates,
            new_posts,
            skipped_entries: parsed.skipped,
            fallback_dates: parsed.fallback_dates,
        })
    }

    async fn maybe_fetch_icon(&self, feed_link: &str) {
        let Some(icon_dir) = self.settings.icon_dir.clone() else {
            return;
        };

        let feed = match self.db.get_feed(feed_link).await {
            Ok(Some(feed)) => feed,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(feed = %feed_link, error = %e, "Failed to load feed for icon download");
                return;
            }
        };

        if feed.icon_path.is_none() && feed.image_url.is_some() {
            spawn_icon_fetch(
                self.db.clone(),
                self.fetcher.clone(),
                feed,
                icon_dir,
                self.settings.icon_timeout,
            );
        }
    }

    /// Dispatch due feeds onto `tasks`.
    ///
    /// With a `slot_wait`, a feed that cannot get a worker within that time
    /// defers itself and every later feed to the next tick. Returns the
    /// number of polls dispatched.
    async fn dispatch(
        &self,
        tasks: &mut JoinSet<(String, PollReport)>,
        in_flight: &mut InFlight,
        slot_wait: Option<Duration>,
    ) -> Result<usize, DatabaseError> {
        let due = self.db.list_due_feeds(Utc::now()).await?;
        let total = due.len();
        let mut dispatched = 0;

        for feed in due {
            if self.shutdown.is_triggered() {
                break;
            }

            // Still in flight from an earlier tick
            let Some(guard) = self.locks.try_begin(&feed.link) else {
                continue;
            };

            let Some(permit) = self.acquire_slot(slot_wait).await else {
                tracing::debug!(
                    deferred = total - dispatched,
                    "No free worker, deferring due feeds to the next tick"
                );
                break;
            };

            let poller = self.clone();
            let link = feed.link.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let report = poller.poll_locked(&feed, guard).await;
                (feed.link, report)
            });
            in_flight.insert(handle.id(), link);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn acquire_slot(&self, wait: Option<Duration>) -> Option<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let shutdown = self.shutdown.triggered();

        tokio::select! {
            biased;
            _ = shutdown => None,
            permit = async {
                match wait {
                    Some(wait) => tokio::time::timeout(wait, acquire).await.ok()?.ok(),
                    None => acquire.await.ok(),
                }
            } => permit,
        }
    }

    /// Fold one joined poll task into `stats`.
    ///
    /// A panicked task is recorded against its feed as a failure, so the
    /// feed backs off like any other failing feed.
    async fn settle(
        &self,
        joined: Result<(Id, (String, PollReport)), JoinError>,
        in_flight: &mut InFlight,
        stats: &mut PollerStats,
    ) {
        let e = match joined {
            Ok((id, (_, report))) => {
                in_flight.remove(&id);
                stats.record(&report);
                return;
            }
            Err(e) => e,
        };

        stats.panicked += 1;
        let Some(link) = in_flight.remove(&e.id()) else {
            tracing::error!(error = %e, "Poll task panicked");
            return;
        };
        tracing::error!(feed = %link, error = %e, "Poll task panicked");

        let outcome = PollOutcome::Failure {
            at: Utc::now(),
            error: PANIC_ERROR.to_string(),
        };
        if let Err(e) = self
            .db
            .record_poll_result(&link, &outcome, &self.settings.backoff)
            .await
        {
            tracing::error!(feed = %link, error = %e, "Failed to record panicked poll");
        }
    }

    /// Rewrite the JSON snapshot if one is configured. Returns `false` only
    /// when the write failed.
    async fn refresh_snapshot(&self) -> bool {
        let Some(path) = &self.settings.snapshot_path else {
            return true;
        };
        match write_snapshot(&self.db, path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{e:#}"),
                    "Failed to write snapshot"
                );
                false
            }
        }
    }

    /// Run until shutdown, then wait for in-flight polls to finish.
    ///
    /// Every dispatched poll has its outcome recorded before this returns.
    /// New posts are flushed to the snapshot on the following tick and once
    /// more after draining.
    pub async fn run(&self) -> PollerStats {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tasks = JoinSet::new();
        let mut in_flight = InFlight::new();
        let mut stats = PollerStats::default();
        // `stats.new_posts` as of the last snapshot written
        let mut snapshot_mark = 0;

        tracing::info!(
            max_concurrent_polls = self.settings.max_concurrent_polls,
            tick_secs = self.settings.tick_interval.as_secs(),
            "Poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.settle(joined, &mut in_flight, &mut stats).await;
                }
                _ = ticker.tick() => {
                    if stats.new_posts > snapshot_mark && self.refresh_snapshot().await {
                        snapshot_mark = stats.new_posts;
                    }
                    if let Err(e) = self
                        .dispatch(&mut tasks, &mut in_flight, Some(self.settings.slot_wait))
                        .await
                    {
                        tracing::error!(error = %e, "Failed to list due feeds");
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "Shutdown requested, draining in-flight polls");
        self.drain(&mut tasks, &mut in_flight, &mut stats).await;
        if stats.new_posts > snapshot_mark {
            self.refresh_snapshot().await;
        }
        tracing::info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            new_posts = stats.new_posts,
            "Poller stopped"
        );
        stats
    }

    /// Poll every feed that is due right now, once, waiting for each.
    pub async fn run_once(&self) -> Result<PollerStats, DatabaseError> {
        let mut tasks = JoinSet::new();
        let mut in_flight = InFlight::new();
        let mut stats = PollerStats::default();

        let dispatched = self.dispatch(&mut tasks, &mut in_flight, None).await;
        self.drain(&mut tasks, &mut in_flight, &mut stats).await;
        if stats.new_posts > 0 {
            self.refresh_snapshot().await;
        }
        dispatched?;

        Ok(stats)
    }

    async fn drain(
        &self,
        tasks: &mut JoinSet<(String, PollReport)>,
        in_flight: &mut InFlight,
        stats: &mut PollerStats,
    ) {
        while let Some(joined) = tasks.join_next_with_id().await {
            self.settle(joined, in_flight, stats).await;
        }
    }
}
