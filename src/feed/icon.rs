//! Best-effort download of feed icons.
//!
//! An icon failure is logged and dropped: it never touches the feed's
//! failure count or schedule.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::fetcher::{FetchError, Fetcher, RetryPolicy};
use crate::storage::{Database, DatabaseError, Feed};
use crate::util::write_atomic;

const ALLOWED_EXTENSIONS: &[&str] = &["png", "ico", "jpg", "jpeg", "gif", "svg", "webp"];
const DEFAULT_EXTENSION: &str = "ico";

#[derive(Debug, Error)]
pub enum IconError {
    #[error("Invalid icon URL '{0}'")]
    InvalidUrl(String),
    #[error("Feed has no domain to name the icon after")]
    NoDomain,
    #[error("Domain '{0}' cannot be used as an icon file name")]
    InvalidDomain(String),
    #[error("Icon download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Failed to write icon: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Download the feed's icon to `{icon_dir}/{domain}.{ext}` and record it.
///
/// Returns `Ok(None)` when the feed has no icon source. An icon file that
/// already exists is reused without fetching.
pub async fn fetch_icon(
    db: &Database,
    fetcher: &Fetcher,
    feed: &Feed,
    icon_dir: &Path,
    timeout: Duration,
) -> Result<Option<PathBuf>, IconError> {
    let Some(source) = feed.image_url.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let stem = icon_file_stem(&feed.domain)?;

    let url = resolve_icon_url(&feed.link, source)?;
    let path = icon_dir.join(format!("{}.{}", stem, icon_extension(&url)));

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let bytes = fetcher
            .fetch_with(url.as_str(), timeout, &RetryPolicy::single_attempt())
            .await?;

        tokio::fs::create_dir_all(icon_dir).await?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(std::io::Error::other)??;

        tracing::debug!(feed = %feed.link, path = %path.display(), "Icon downloaded");
    }

    db.set_feed_icon(&feed.link, &path.to_string_lossy()).await?;
    Ok(Some(path))
}

/// Fire-and-forget icon download. Errors are logged at `warn`.
pub fn spawn_icon_fetch(
    db: Database,
    fetcher: Fetcher,
    feed: Feed,
    icon_dir: PathBuf,
    timeout: Duration,
) {
    tokio::spawn(async move {
        if let Err(e) = fetch_icon(&db, &fetcher, &feed, &icon_dir, timeout).await {
            tracing::warn!(feed = %feed.link, error = %e, "Icon download failed");
        }
    });
}

/// The domain as a single path component inside the icon directory.
///
/// Domains come from configuration verbatim, so anything beyond a plain
/// host name (separators, `..`, a leading dot) is refused.
fn icon_file_stem(domain: &str) -> Result<&str, IconError> {
    if domain.is_empty() {
        return Err(IconError::NoDomain);
    }
    let plain = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if !plain || domain.starts_with('.') {
        return Err(IconError::InvalidDomain(domain.to_string()));
    }
    Ok(domain)
}

/// Icon sources may be relative to the feed document.
fn resolve_icon_url(feed_link: &str, source: &str) -> Result<Url, IconError> {
    let source = source.trim();
    Url::parse(source)
        .or_else(|_| Url::parse(feed_link).and_then(|base| base.join(source)))
        .map_err(|_| IconError::InvalidUrl(source.to_string()))
}

fn icon_extension(url: &Url) -> &'static str {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .and_then(|ext| ALLOWED_EXTENSIONS.iter().copied().find(|allowed| *allowed == ext))
        .unwrap_or(DEFAULT_EXTENSION)
}
