use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another gazette instance appears to be using the database. Please stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Operation referenced a feed link that is not stored
    #[error("Unknown feed: {0}")]
    UnknownFeed(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamps are stored as unix seconds and surfaced as UTC.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ============================================================================
// Input Types
// ============================================================================

/// A feed as declared in the configuration document.
///
/// Only `link` is required. Absent optional fields never overwrite data that
/// is already stored for the feed.
#[derive(Debug, Clone, Default)]
pub struct FeedSeed {
    pub link: String,
    pub domain: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub image_url: Option<String>,
}

impl FeedSeed {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            ..Default::default()
        }
    }

    /// Domain to store when the feed is first inserted: the explicit override,
    /// else the link's host without a leading `www.`.
    pub fn resolved_domain(&self) -> String {
        self.domain
            .clone()
            .or_else(|| domain_from_link(&self.link))
            .unwrap_or_default()
    }
}

/// Host of `link` with a leading `www.` removed.
pub fn domain_from_link(link: &str) -> Option<String> {
    let url = url::Url::parse(link).ok()?;
    let host = url.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Feed-level metadata read from a fetched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub site_link: Option<String>,
    pub image_url: Option<String>,
}

/// A post parsed from a fetch result, not yet checked against stored posts.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePost {
    pub link: String,
    pub title: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    /// `published_at` is the ingestion time because the entry had no usable date
    pub published_is_fallback: bool,
    /// Category terms, in document order
    pub tags: Vec<String>,
}

/// Result of one poll, as recorded against the feed's schedule.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Success { at: DateTime<Utc> },
    Failure { at: DateTime<Utc>, error: String },
}

impl PollOutcome {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            PollOutcome::Success { at } | PollOutcome::Failure { at, .. } => *at,
        }
    }
}

/// Schedule state written by `record_poll_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSchedule {
    pub consecutive_failures: u32,
    pub next_poll_at: DateTime<Utc>,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub link: String,
    pub domain: String,
    pub title: String,
    pub subtitle: String,
    pub site_link: Option<String>,
    pub image_url: Option<String>,
    pub icon_path: Option<String>,
    pub last_polled_at: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
    pub next_poll_at: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            link: self.link,
            domain: self.domain,
            title: self.title,
            subtitle: self.subtitle,
            site_link: self.site_link,
            image_url: self.image_url,
            icon_path: self.icon_path,
            last_polled_at: self.last_polled_at.map(from_unix),
            last_error: self.last_error,
            consecutive_failures: u32::try_from(self.consecutive_failures).unwrap_or(0),
            next_poll_at: from_unix(self.next_poll_at),
        }
    }
}

/// Internal row type for post queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostDbRow {
    pub id: i64,
    pub feed_link: String,
    pub link: String,
    pub title: String,
    pub author: Option<String>,
    pub published_at: i64,
    pub first_seen_at: i64,
    pub published_is_fallback: bool,
    /// JSON array of strings
    pub tags: String,
}

impl PostDbRow {
    pub(crate) fn into_post(self) -> Post {
        Post {
            id: self.id,
            feed_link: self.feed_link,
            link: self.link,
            title: self.title,
            author: self.author,
            published_at: from_unix(self.published_at),
            first_seen_at: from_unix(self.first_seen_at),
            published_is_fallback: self.published_is_fallback,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub link: String,
    pub domain: String,
    pub title: String,
    pub subtitle: String,
    /// Homepage the feed document points at
    pub site_link: Option<String>,
    /// Remote icon source, from configuration or the feed document
    pub image_url: Option<String>,
    /// Local icon file, set once the icon has been downloaded
    pub icon_path: Option<String>,
    /// Last successful poll
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_poll_at: DateTime<Utc>,
}

/// Post data from database
#[derive(Debug, Clone, Serialize)]
pub struct Post {
    #[serde(skip)]
    pub id: i64,
    pub feed_link: String,
    pub link: String,
    pub title: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub published_is_fallback: bool,
    pub tags: Vec<String>,
}
