use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use thiserror::Error;

use crate::storage::{CandidatePost, FeedMetadata};

/// The document as a whole could not be read as RSS or Atom.
#[derive(Debug, Error)]
#[error("Failed to parse feed: {0}")]
pub struct ParseError(#[from] parser::ParseFeedError);

/// Posts and metadata extracted from one fetched document.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub metadata: FeedMetadata,
    /// Posts in document order
    pub posts: Vec<CandidatePost>,
    /// Entries dropped because they carried no link
    pub skipped: usize,
    /// Posts whose publication time fell back to `now`
    pub fallback_dates: usize,
}

/// Parse an RSS or Atom document.
///
/// Entries without a usable link are skipped and counted, never fatal.
/// Entries without a date get `now` with `published_is_fallback` set.
pub fn parse_feed(bytes: &[u8], now: DateTime<Utc>) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes)?;

    let metadata = FeedMetadata {
        title: feed.title.map(|t| t.content.trim().to_string()).filter(|t| !t.is_empty()),
        subtitle: feed
            .description
            .map(|d| d.content.trim().to_string())
            .filter(|d| !d.is_empty()),
        site_link: preferred_link(&feed.links),
        image_url: feed
            .logo
            .or(feed.icon)
            .map(|image| image.uri)
            .filter(|uri| !uri.is_empty()),
    };

    let mut parsed = ParsedFeed {
        metadata,
        ..Default::default()
    };

    for entry in feed.entries {
        match to_candidate(entry, now) {
            Some(post) => {
                if post.published_is_fallback {
                    parsed.fallback_dates += 1;
                }
                parsed.posts.push(post);
            }
            None => parsed.skipped += 1,
        }
    }

    Ok(parsed)
}

fn to_candidate(entry: Entry, now: DateTime<Utc>) -> Option<CandidatePost> {
    let link = preferred_link(&entry.links)?;

    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let author = entry
        .authors
        .into_iter()
        .map(|person| person.name.trim().to_string())
        .find(|name| !name.is_empty());

    let (published_at, published_is_fallback) = match entry.published.or(entry.updated) {
        Some(dt) => (dt, false),
        None => (now, true),
    };

    let mut tags: Vec<String> = Vec::new();
    for category in entry.categories {
        let term = category.term.trim();
        if !term.is_empty() && !tags.iter().any(|t| t == term) {
            tags.push(term.to_string());
        }
    }

    Some(CandidatePost {
        link,
        title,
        author,
        published_at,
        published_is_fallback,
        tags,
    })
}

/// `rel="alternate"` first, then a link with no rel, then whatever comes first.
fn preferred_link(links: &[Link]) -> Option<String> {
    let usable = || links.iter().filter(|l| !l.href.trim().is_empty());

    usable()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .or_else(|| usable().find(|l| l.rel.is_none()))
        .or_else(|| usable().next())
        .map(|l| l.href.trim().to_string())
}
