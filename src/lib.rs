//! gazette: polls RSS/Atom feeds, deduplicates their posts and keeps them in SQLite.
//!
//! The pieces, leaves first:
//!
//! - [`storage`] - durable feeds and posts
//! - [`feed`] - fetching, parsing and deduplicating feed documents
//! - [`scheduler`] - due selection, worker pool, per-feed exclusion and backoff
//! - [`config`] - the TOML document that seeds the feed list
//! - [`snapshot`] - JSON export of the read model

pub mod config;
pub mod feed;
pub mod scheduler;
pub mod shutdown;
pub mod snapshot;
pub mod storage;
pub mod util;
