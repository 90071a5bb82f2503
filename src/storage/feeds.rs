use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{
    DatabaseError, Feed, FeedDbRow, FeedMetadata, FeedSchedule, FeedSeed, PollOutcome,
};
use crate::scheduler::BackoffPolicy;

const FEED_COLUMNS: &str = "link, domain, title, subtitle, site_link, image_url, icon_path, \
     last_polled_at, last_error, consecutive_failures, next_poll_at";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a feed, or merge the seed's explicit fields into the stored row.
    pub async fn upsert_feed(&self, seed: &FeedSeed) -> Result<(), DatabaseError> {
        self.sync_feeds(std::slice::from_ref(seed)).await
    }

    /// Sync feeds from the configuration document in a single transaction.
    ///
    /// New feeds are inserted and become due immediately. For feeds that
    /// already exist, fields present in the seed overwrite the stored value
    /// and absent fields keep whatever is stored. Schedule state is never
    /// touched.
    pub async fn sync_feeds(&self, seeds: &[FeedSeed]) -> Result<(), DatabaseError> {
        if seeds.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for seed in seeds {
            sqlx::query(
                r#"
                INSERT INTO feeds (link, domain, title, subtitle, image_url)
                VALUES (?, ?, COALESCE(?, ''), COALESCE(?, ''), ?)
                ON CONFLICT(link) DO UPDATE SET
                    domain = COALESCE(?, feeds.domain),
                    title = COALESCE(?, feeds.title),
                    subtitle = COALESCE(?, feeds.subtitle),
                    image_url = COALESCE(?, feeds.image_url)
            "#,
            )
            .bind(&seed.link)
            .bind(seed.resolved_domain())
            .bind(&seed.title)
            .bind(&seed.subtitle)
            .bind(&seed.image_url)
            .bind(&seed.domain)
            .bind(&seed.title)
            .bind(&seed.subtitle)
            .bind(&seed.image_url)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All feeds, ordered by title.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY title COLLATE NOCASE, link"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    pub async fn get_feed(&self, link: &str) -> Result<Option<Feed>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE link = ?"))
                .bind(link)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Feeds whose next poll is due at `now`, oldest-due first.
    ///
    /// Ties are broken by link so the order is stable across ticks.
    pub async fn list_due_feeds(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE next_poll_at <= ? ORDER BY next_poll_at ASC, link ASC"
        ))
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    // ========================================================================
    // Schedule Operations
    // ========================================================================

    /// Record the outcome of a poll and schedule the next one.
    ///
    /// Runs in one transaction: the failure counter, last error, last
    /// successful poll and next eligible poll always change together.
    ///
    /// - Success: failures reset to 0, next poll at `at + base_interval`.
    /// - Failure: failures incremented, next poll at
    ///   `at + min(base_interval * 2^failures, max_interval)`.
    pub async fn record_poll_result(
        &self,
        feed_link: &str,
        outcome: &PollOutcome,
        policy: &BackoffPolicy,
    ) -> Result<FeedSchedule, DatabaseError> {
        let at = outcome.at();
        let mut tx = self.pool.begin().await?;

        let schedule = match outcome {
            PollOutcome::Success { .. } => {
                let next_poll_at = policy.next_poll_at(at, 0);
                let result = sqlx::query(
                    "UPDATE feeds SET last_polled_at = ?, last_error = NULL, \
                     consecutive_failures = 0, next_poll_at = ? WHERE link = ?",
                )
                .bind(at.timestamp())
                .bind(next_poll_at.timestamp())
                .bind(feed_link)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(DatabaseError::UnknownFeed(feed_link.to_string()));
                }

                FeedSchedule {
                    consecutive_failures: 0,
                    next_poll_at,
                }
            }
            PollOutcome::Failure { error, .. } => {
                let failures: Option<(i64,)> = sqlx::query_as(
                    "UPDATE feeds SET consecutive_failures = consecutive_failures + 1, last_error = ? \
                     WHERE link = ? RETURNING consecutive_failures",
                )
                .bind(error)
                .bind(feed_link)
                .fetch_optional(&mut *tx)
                .await?;

                let Some((failures,)) = failures else {
                    return Err(DatabaseError::UnknownFeed(feed_link.to_string()));
                };
                let consecutive_failures = u32::try_from(failures).unwrap_or(u32::MAX);
                let next_poll_at = policy.next_poll_at(at, consecutive_failures);

                sqlx::query("UPDATE feeds SET next_poll_at = ? WHERE link = ?")
                    .bind(next_poll_at.timestamp())
                    .bind(feed_link)
                    .execute(&mut *tx)
                    .await?;

                FeedSchedule {
                    consecutive_failures,
                    next_poll_at,
                }
            }
        };

        tx.commit().await?;
        Ok(schedule)
    }

    // ========================================================================
    // Metadata Operations
    // ========================================================================

    /// Fill feed metadata discovered in a fetched document.
    ///
    /// Only empty stored fields are filled, so values from the configuration
    /// document always take precedence over what the feed says about itself.
    /// The homepage link follows the latest document that names one.
    pub async fn apply_feed_metadata(
        &self,
        feed_link: &str,
        metadata: &FeedMetadata,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE feeds SET
                title = CASE WHEN title = '' THEN COALESCE(?, '') ELSE title END,
                subtitle = CASE WHEN subtitle = '' THEN COALESCE(?, '') ELSE subtitle END,
                site_link = COALESCE(?, site_link),
                image_url = COALESCE(image_url, ?)
            WHERE link = ?
        "#,
        )
        .bind(&metadata.title)
        .bind(&metadata.subtitle)
        .bind(&metadata.site_link)
        .bind(&metadata.image_url)
        .bind(feed_link)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Point the feed at its downloaded icon.
    pub async fn set_feed_icon(&self, feed_link: &str, icon_path: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET icon_path = ? WHERE link = ?")
            .bind(icon_path)
            .bind(feed_link)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
