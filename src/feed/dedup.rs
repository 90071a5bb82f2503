use std::collections::HashSet;

use crate::storage::{CandidatePost, Database, DatabaseError};

/// Drop candidates already stored under `feed_link`, and repeated links
/// within the batch (first occurrence wins). Order is preserved.
///
/// Read-only: concurrent pollers of the same feed are excluded by the
/// scheduler, and `upsert_posts` ignores stored links anyway.
pub async fn filter_new(
    db: &Database,
    feed_link: &str,
    candidates: Vec<CandidatePost>,
) -> Result<Vec<CandidatePost>, DatabaseError> {
    let mut seen = HashSet::with_capacity(candidates.len());
    let unique: Vec<CandidatePost> = candidates
        .into_iter()
        .filter(|post| seen.insert(post.link.clone()))
        .collect();

    if unique.is_empty() {
        return Ok(unique);
    }

    let links: Vec<&str> = unique.iter().map(|p| p.link.as_str()).collect();
    let existing = db.existing_post_links(feed_link, &links).await?;

    Ok(unique
        .into_iter()
        .filter(|post| !existing.contains(&post.link))
        .collect())
}
