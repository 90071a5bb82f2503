//! Getting posts out of remote feeds.
//!
//! - [`fetcher`] - HTTP retrieval with per-attempt timeout, bounded retry and cancellation
//! - [`parser`] - RSS/Atom parsing into candidate posts using `feed-rs`
//! - [`dedup`] - filtering candidates against posts already stored for the feed
//! - [`icon`] - best-effort icon download
//! - [`opml`] - OPML export of the feed list

pub mod dedup;
pub mod fetcher;
pub mod icon;
pub mod opml;
pub mod parser;

pub use dedup::filter_new;
pub use fetcher::{FetchError, FetchErrorKind, Fetcher, RetryPolicy, MAX_FEED_SIZE};
pub use icon::{fetch_icon, spawn_icon_fetch, IconError};
pub use opml::{export_opml, export_to_file};
pub use parser::{parse_feed, ParseError, ParsedFeed};
