use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::HashSet;

use super::schema::Database;
use super::types::{CandidatePost, DatabaseError, Post, PostDbRow};

const POST_COLUMNS: &str = "id, feed_link, link, title, author, published_at, first_seen_at, \
     published_is_fallback, tags";

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Insert posts for a feed, returning the number of newly stored posts.
    ///
    /// Posts whose link is already stored under the feed are skipped without
    /// error; only their title is refreshed. Publication date, link, tags and
    /// first-seen time of a stored post never change.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::UnknownFeed`] if `feed_link` is not stored.
    pub async fn upsert_posts(
        &self,
        feed_link: &str,
        posts: &[CandidatePost],
    ) -> Result<usize, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        ensure_feed(&mut tx, feed_link).await?;

        // Two-phase write: INSERT OR IGNORE counts new rows through changes(),
        // then a title-only UPDATE applies corrections to rows that already existed.
        let mut total_inserted: usize = 0;

        for chunk in posts.chunks(BATCH_SIZE) {
            let mut insert_builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO posts \
                 (feed_link, link, title, author, published_at, first_seen_at, published_is_fallback, tags) ",
            );

            insert_builder.push_values(chunk, |mut b, post| {
                b.push_bind(feed_link)
                    .push_bind(&post.link)
                    .push_bind(&post.title)
                    .push_bind(&post.author)
                    .push_bind(post.published_at.timestamp())
                    .push_bind(now)
                    .push_bind(post.published_is_fallback)
                    .push_bind(encode_tags(&post.tags));
            });

            insert_builder.build().execute(&mut *tx).await?;

            let changes: (i64,) = sqlx::query_as("SELECT changes()")
                .fetch_one(&mut *tx)
                .await?;
            total_inserted += usize::try_from(changes.0).unwrap_or(0);

            update_titles(&mut tx, feed_link, chunk).await?;
        }

        tx.commit().await?;
        Ok(total_inserted)
    }

    /// Apply title corrections to posts already stored under `feed_link`.
    ///
    /// Candidates with no stored row are ignored. Returns the number of rows
    /// whose title changed.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::UnknownFeed`] if `feed_link` is not stored.
    pub async fn refresh_post_titles(
        &self,
        feed_link: &str,
        posts: &[CandidatePost],
    ) -> Result<usize, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        ensure_feed(&mut tx, feed_link).await?;

        let mut changed = 0;
        for chunk in posts.chunks(BATCH_SIZE) {
            changed += update_titles(&mut tx, feed_link, chunk).await?;
        }

        tx.commit().await?;
        Ok(changed)
    }

    /// The subset of `links` already stored under `feed_link`.
    pub async fn existing_post_links(
        &self,
        feed_link: &str,
        links: &[&str],
    ) -> Result<HashSet<String>, DatabaseError> {
        const BATCH_SIZE: usize = 500;
        let mut existing = HashSet::new();

        for chunk in links.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT link FROM posts WHERE feed_link = ");
            builder.push_bind(feed_link);
            builder.push(" AND link IN (");
            let mut separated = builder.separated(", ");
            for link in chunk {
                separated.push_bind(*link);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&self.pool).await?;
            existing.extend(rows.into_iter().map(|(link,)| link));
        }

        Ok(existing)
    }

    /// Posts of one feed, newest publication first.
    ///
    /// `limit` of `None` returns every post.
    pub async fn posts_for_feed(
        &self,
        feed_link: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Post>, DatabaseError> {
        let rows: Vec<PostDbRow> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE feed_link = ? \
             ORDER BY published_at DESC, first_seen_at DESC, id DESC LIMIT ?"
        ))
        .bind(feed_link)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PostDbRow::into_post).collect())
    }

    /// Posts across all feeds, newest publication first.
    pub async fn recent_posts(&self, limit: Option<i64>) -> Result<Vec<Post>, DatabaseError> {
        let rows: Vec<PostDbRow> = sqlx::query_as(&format!(
            "SELECT {POST_COLUMNS} FROM posts \
             ORDER BY published_at DESC, first_seen_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PostDbRow::into_post).collect())
    }

    pub async fn count_posts(&self, feed_link: &str) -> Result<i64, DatabaseError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE feed_link = ?")
            .bind(feed_link)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

const BATCH_SIZE: usize = 50;

async fn ensure_feed(
    tx: &mut Transaction<'_, Sqlite>,
    feed_link: &str,
) -> Result<(), DatabaseError> {
    let known: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM feeds WHERE link = ?")
        .bind(feed_link)
        .fetch_optional(&mut **tx)
        .await?;
    match known {
        Some(_) => Ok(()),
        None => Err(DatabaseError::UnknownFeed(feed_link.to_string())),
    }
}

/// Title-only UPDATE for one chunk, skipping rows whose title already matches.
async fn update_titles(
    tx: &mut Transaction<'_, Sqlite>,
    feed_link: &str,
    chunk: &[CandidatePost],
) -> Result<usize, DatabaseError> {
    if chunk.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE posts SET title = CASE link ");
    for post in chunk {
        builder.push("WHEN ");
        builder.push_bind(&post.link);
        builder.push(" THEN ");
        builder.push_bind(&post.title);
        builder.push(" ");
    }
    builder.push("ELSE title END WHERE feed_link = ");
    builder.push_bind(feed_link);
    builder.push(" AND link IN (");

    let mut separated = builder.separated(", ");
    for post in chunk {
        separated.push_bind(&post.link);
    }
    separated.push_unseparated(") AND title <> CASE link ");
    for post in chunk {
        builder.push("WHEN ");
        builder.push_bind(&post.link);
        builder.push(" THEN ");
        builder.push_bind(&post.title);
        builder.push(" ");
    }
    builder.push("ELSE title END");

    let result = builder.build().execute(&mut **tx).await?;
    Ok(usize::try_from(result.rows_affected()).unwrap_or(0))
}

fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use crate::storage::{CandidatePost, Database, DatabaseError, FeedSeed};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    const FEED: &str = "https://blog.example.com/feed.xml";

    async fn test_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.upsert_feed(&FeedSeed::new(FEED)).await.unwrap();
        db
    }

    fn test_post(slug: &str, title: &str, published: i64) -> CandidatePost {
        CandidatePost {
            link: format!("https://blog.example.com/{}", slug),
            title: title.to_string(),
            author: Some("Ada".to_string()),
            published_at: Utc.timestamp_opt(published, 0).unwrap(),
            published_is_fallback: false,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_posts_counts_new_only() {
        let db = test_db().await;

        let count = db
            .upsert_posts(FEED, &[test_post("a", "A", 100), test_post("b", "B", 200)])
            .await
            .unwrap();
        assert_eq!(count, 2);

        let count = db
            .upsert_posts(
                FEED,
                &[
                    test_post("a", "A", 100),
                    test_post("b", "B", 200),
                    test_post("c", "C", 300),
                ],
            )
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.count_posts(FEED).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_upsert_posts_unchanged_content_is_idempotent() {
        let db = test_db().await;
        let posts = vec![test_post("a", "A", 100), test_post("b", "B", 200)];

        db.upsert_posts(FEED, &posts).await.unwrap();
        let count = db.upsert_posts(FEED, &posts).await.unwrap();

        assert_eq!(count, 0);
        assert_eq!(db.count_posts(FEED).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_posts_duplicate_within_batch() {
        let db = test_db().await;
        let count = db
            .upsert_posts(FEED, &[test_post("a", "A", 100), test_post("a", "A again", 100)])
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(db.count_posts(FEED).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_posts_corrects_title_only() {
        let db = test_db().await;
        db.upsert_posts(FEED, &[test_post("a", "Typo", 100)])
            .await
            .unwrap();
        let before = db.posts_for_feed(FEED, None).await.unwrap();

        // Same link with a corrected title and a different date
        db.upsert_posts(FEED, &[test_post("a", "Fixed", 999)])
            .await
            .unwrap();

        let after = db.posts_for_feed(FEED, None).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].title, "Fixed");
        assert_eq!(after[0].published_at, before[0].published_at);
        assert_eq!(after[0].first_seen_at, before[0].first_seen_at);
    }

    #[tokio::test]
    async fn test_refresh_post_titles_touches_stored_posts_only() {
        let db = test_db().await;
        db.upsert_posts(FEED, &[test_post("a", "Typo", 100), test_post("b", "B", 200)])
            .await
            .unwrap();

        let changed = db
            .refresh_post_titles(
                FEED,
                &[
                    test_post("a", "Fixed", 100),
                    test_post("b", "B", 200),
                    test_post("unseen", "Never stored", 300),
                ],
            )
            .await
            .unwrap();

        assert_eq!(changed, 1);
        assert_eq!(db.count_posts(FEED).await.unwrap(), 2);
        let titles: Vec<_> = db
            .posts_for_feed(FEED, None)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["B", "Fixed"]);

        let err = db
            .refresh_post_titles("https://other.example.com/rss", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::UnknownFeed(_)));
    }

    #[tokio::test]
    async fn test_tags_are_stored_at_first_sight() {
        let db = test_db().await;
        let tagged = CandidatePost {
            tags: vec!["rust".to_string(), "async".to_string()],
            ..test_post("a", "A", 100)
        };
        db.upsert_posts(FEED, &[tagged]).await.unwrap();

        // A later poll with different categories leaves the stored tags alone
        let retagged = CandidatePost {
            tags: vec!["other".to_string()],
            ..test_post("a", "A", 100)
        };
        db.upsert_posts(FEED, &[retagged]).await.unwrap();

        let posts = db.posts_for_feed(FEED, None).await.unwrap();
        assert_eq!(posts[0].tags, vec!["rust", "async"]);
    }

    #[tokio::test]
    async fn test_upsert_posts_unknown_feed() {
        let db = test_db().await;
        let err = db
            .upsert_posts("https://other.example.com/rss", &[test_post("a", "A", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::UnknownFeed(_)));
    }

    #[tokio::test]
    async fn test_upsert_posts_empty() {
        let db = test_db().await;
        assert_eq!(db.upsert_posts(FEED, &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_posts_large_batch_chunking() {
        let db = test_db().await;
        let posts: Vec<_> = (0..120)
            .map(|i| test_post(&format!("p{}", i), &format!("Post {}", i), i))
            .collect();

        assert_eq!(db.upsert_posts(FEED, &posts).await.unwrap(), 120);
        assert_eq!(db.upsert_posts(FEED, &posts).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_link_in_two_feeds_is_two_posts() {
        let db = test_db().await;
        let other = "https://mirror.example.com/feed.xml";
        db.upsert_feed(&FeedSeed::new(other)).await.unwrap();

        let post = test_post("shared", "Syndicated", 100);
        assert_eq!(db.upsert_posts(FEED, &[post.clone()]).await.unwrap(), 1);
        assert_eq!(db.upsert_posts(other, &[post]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_existing_post_links() {
        let db = test_db().await;
        db.upsert_posts(FEED, &[test_post("a", "A", 100)])
            .await
            .unwrap();

        let a = "https://blog.example.com/a";
        let b = "https://blog.example.com/b";
        let existing = db.existing_post_links(FEED, &[a, b]).await.unwrap();
        assert_eq!(existing.len(), 1);
        assert!(existing.contains(a));

        let none = db.existing_post_links(FEED, &[]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_posts_ordered_by_publication_desc() {
        let db = test_db().await;
        db.upsert_posts(
            FEED,
            &[
                test_post("old", "Old", 100),
                test_post("new", "New", 300),
                test_post("mid", "Mid", 200),
            ],
        )
        .await
        .unwrap();

        let titles: Vec<_> = db
            .posts_for_feed(FEED, None)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["New", "Mid", "Old"]);

        let limited = db.recent_posts(Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].title, "New");
    }
}
