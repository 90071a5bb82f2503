//! Durable feed store backed by SQLite.
//!
//! Feeds are keyed by their link and carry their own schedule state; posts
//! are keyed by `(feed_link, link)`. Every mutation is a single statement or
//! a single transaction, so concurrent workers can share one [`Database`].

mod feeds;
mod posts;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    domain_from_link, CandidatePost, DatabaseError, Feed, FeedMetadata, FeedSchedule, FeedSeed,
    PollOutcome, Post,
};
