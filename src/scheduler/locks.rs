use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
}

/// Per-feed mutual exclusion.
///
/// Each feed link owns its own async mutex; the map lock is only held long
/// enough to find or create an entry, never across an await. Holding a
/// [`PollGuard`] is what it means for a feed to be `Polling`.
#[derive(Clone, Default)]
pub struct FeedLocks {
    entries: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Marks a feed as `Polling` until dropped, including on panic.
pub struct PollGuard {
    _guard: OwnedMutexGuard<()>,
}

impl FeedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, link: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(link.to_string()).or_default())
    }

    /// Move the feed from `Idle` to `Polling`, or `None` if a poll is
    /// already in flight.
    pub fn try_begin(&self, link: &str) -> Option<PollGuard> {
        self.entry(link)
            .try_lock_owned()
            .ok()
            .map(|guard| PollGuard { _guard: guard })
    }

    pub fn state(&self, link: &str) -> PollState {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(link) {
            Some(entry) if entry.try_lock().is_err() => PollState::Polling,
            _ => PollState::Idle,
        }
    }

    pub fn is_polling(&self, link: &str) -> bool {
        self.state(link) == PollState::Polling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_begin_is_refused_until_release() {
        let locks = FeedLocks::new();
        let feed = "https://a.example.com/feed";

        assert_eq!(locks.state(feed), PollState::Idle);
        let guard = locks.try_begin(feed).expect("idle feed should start");
        assert_eq!(locks.state(feed), PollState::Polling);
        assert!(locks.try_begin(feed).is_none());

        drop(guard);
        assert_eq!(locks.state(feed), PollState::Idle);
        assert!(locks.try_begin(feed).is_some());
    }

    #[test]
    fn test_feeds_are_independent() {
        let locks = FeedLocks::new();
        let _a = locks.try_begin("https://a.example.com/feed").unwrap();
        assert!(locks.try_begin("https://b.example.com/feed").is_some());
        assert!(!locks.is_polling("https://b.example.com/feed"));
    }

    #[test]
    fn test_clones_share_state() {
        let locks = FeedLocks::new();
        let other = locks.clone();
        let _guard = locks.try_begin("https://a.example.com/feed").unwrap();
        assert!(other.is_polling("https://a.example.com/feed"));
    }

    #[tokio::test]
    async fn test_guard_released_when_task_panics() {
        let locks = FeedLocks::new();
        let task_locks = locks.clone();

        let result = tokio::spawn(async move {
            let _guard = task_locks.try_begin("https://a.example.com/feed").unwrap();
            panic!("worker failed");
        })
        .await;

        assert!(result.is_err());
        assert!(!locks.is_polling("https://a.example.com/feed"));
    }
}
