//! Configuration file parser for `config.toml`.
//!
//! The file is required: it carries the feed list. Every section uses
//! `#[serde(default)]` so only `[[feeds.feedlist]]` entries need to be given.
//! Unknown keys are accepted by serde but logged as warnings, since they are
//! usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::RetryPolicy;
use crate::scheduler::{BackoffPolicy, PollSettings};
use crate::storage::FeedSeed;
use crate::util::validate_feed_link;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file; overridden by `--database`.
    pub database_path: PathBuf,

    /// Directory for downloaded feed icons. Icons are skipped when unset.
    pub icon_dir: Option<PathBuf>,

    /// JSON snapshot rewritten whenever polls store new posts.
    pub snapshot_path: Option<PathBuf>,

    pub polling: PollingConfig,

    pub feeds: FeedList,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("gazette.db"),
            icon_dir: None,
            snapshot_path: None,
            polling: PollingConfig::default(),
            feeds: FeedList::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Poll spacing for a healthy feed.
    pub base_interval_secs: u64,
    /// Cap on poll spacing for a failing feed.
    pub max_interval_secs: u64,
    pub max_concurrent_polls: usize,
    pub tick_interval_secs: u64,
    pub slot_wait_secs: u64,
    /// Per-attempt timeout covering request and body.
    pub fetch_timeout_secs: u64,
    /// Total attempts per fetch, including the first.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub icon_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 900,
            max_interval_secs: 21_600,
            max_concurrent_polls: 10,
            tick_interval_secs: 5,
            slot_wait_secs: 2,
            fetch_timeout_secs: 30,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            icon_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedList {
    pub feedlist: Vec<FeedEntry>,
}

/// One `[[feeds.feedlist]]` entry. Set fields override what the feed
/// document says about itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedEntry {
    pub link: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    /// Icon source URL
    #[serde(default)]
    pub image: Option<String>,
}

impl FeedEntry {
    pub fn to_seed(&self) -> FeedSeed {
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        FeedSeed {
            link: self.link.trim().to_string(),
            domain: clean(&self.domain),
            title: clean(&self.title),
            subtitle: clean(&self.subtitle),
            image_url: clean(&self.image),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "database_path",
        "icon_dir",
        "snapshot_path",
        "polling",
        "feeds",
    ];
    const KNOWN_POLLING_KEYS: [&'static str; 10] = [
        "base_interval_secs",
        "max_interval_secs",
        "max_concurrent_polls",
        "tick_interval_secs",
        "slot_wait_secs",
        "fetch_timeout_secs",
        "max_attempts",
        "retry_base_delay_ms",
        "retry_max_delay_ms",
        "icon_timeout_secs",
    ];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → `Err(ConfigError::Io)`
    /// - File over 1 MB → `Err(ConfigError::TooLarge)`
    /// - Invalid TOML or wrong types → `Err(ConfigError::Parse)`
    /// - Bad values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a huge file is never pulled into memory
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;

        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.feedlist.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.polling;

        if p.max_concurrent_polls == 0 {
            return Err(ConfigError::Invalid(
                "polling.max_concurrent_polls must be at least 1".to_string(),
            ));
        }
        if p.base_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.base_interval_secs must be positive".to_string(),
            ));
        }
        if p.base_interval_secs > p.max_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "polling.base_interval_secs ({}) exceeds polling.max_interval_secs ({})",
                p.base_interval_secs, p.max_interval_secs
            )));
        }
        if p.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.tick_interval_secs must be positive".to_string(),
            ));
        }
        if p.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if p.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "polling.max_attempts must be at least 1".to_string(),
            ));
        }

        for (index, entry) in self.feeds.feedlist.iter().enumerate() {
            validate_feed_link(&entry.link).map_err(|e| {
                ConfigError::Invalid(format!(
                    "feeds.feedlist[{}] link '{}': {}",
                    index, entry.link, e
                ))
            })?;
        }

        Ok(())
    }

    /// Feed seeds to upsert at startup. Repeated links keep the first entry.
    pub fn seeds(&self) -> Vec<FeedSeed> {
        let mut seen = std::collections::HashSet::new();
        self.feeds
            .feedlist
            .iter()
            .map(FeedEntry::to_seed)
            .filter(|seed| {
                let first = seen.insert(seed.link.clone());
                if !first {
                    tracing::warn!(link = %seed.link, "Duplicate feed in config, ignoring");
                }
                first
            })
            .collect()
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.polling.base_interval_secs),
            Duration::from_secs(self.polling.max_interval_secs),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.polling.max_attempts,
            base_delay: Duration::from_millis(self.polling.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.polling.retry_max_delay_ms),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        let p = &self.polling;
        PollSettings {
            backoff: self.backoff_policy(),
            max_concurrent_polls: p.max_concurrent_polls,
            tick_interval: Duration::from_secs(p.tick_interval_secs),
            slot_wait: Duration::from_secs(p.slot_wait_secs),
            fetch_timeout: Duration::from_secs(p.fetch_timeout_secs),
            icon_timeout: Duration::from_secs(p.icon_timeout_secs),
            icon_dir: self.icon_dir.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    if let Some(toml::Value::Table(polling)) = raw.get("polling") {
        for key in polling.keys() {
            if !Config::KNOWN_POLLING_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in [polling], ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
