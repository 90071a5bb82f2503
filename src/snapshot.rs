//! JSON snapshot of the read model for static serving layers.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::path::Path;

use crate::storage::{Database, DatabaseError, Feed, Post};
use crate::util::write_atomic;

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub feeds: Vec<Feed>,
    pub posts: PostBuckets,
}

/// Posts grouped by age relative to `generated_at`, each newest first.
#[derive(Debug, Default, Serialize)]
pub struct PostBuckets {
    pub last_24h: Vec<Post>,
    pub between_24h_48h: Vec<Post>,
    pub older: Vec<Post>,
}

impl PostBuckets {
    /// `posts` must already be ordered newest first.
    fn from_posts(posts: Vec<Post>, now: DateTime<Utc>) -> Self {
        let day_ago = now - TimeDelta::hours(24);
        let two_days_ago = now - TimeDelta::hours(48);

        let mut buckets = Self::default();
        for post in posts {
            if post.published_at > day_ago {
                buckets.last_24h.push(post);
            } else if post.published_at > two_days_ago {
                buckets.between_24h_48h.push(post);
            } else {
                buckets.older.push(post);
            }
        }
        buckets
    }
}

pub async fn build_snapshot(db: &Database, now: DateTime<Utc>) -> Result<Snapshot, DatabaseError> {
    let feeds = db.list_feeds().await?;
    let posts = db.recent_posts(None).await?;

    Ok(Snapshot {
        generated_at: now,
        feeds,
        posts: PostBuckets::from_posts(posts, now),
    })
}

pub async fn write_snapshot(db: &Database, path: &Path) -> Result<()> {
    let snapshot = build_snapshot(db, Utc::now())
        .await
        .context("Failed to read posts for snapshot")?;
    let json = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize snapshot")?;
    write_atomic(path, &json)
        .with_context(|| format!("Failed to write snapshot to '{}'", path.display()))?;

    tracing::info!(
        path = %path.display(),
        feeds = snapshot.feeds.len(),
        last_24h = snapshot.posts.last_24h.len(),
        "Snapshot written"
    );
    Ok(())
}
