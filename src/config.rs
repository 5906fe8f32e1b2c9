//! Configuration file parser for ~/.config/rssreader/config.toml.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged, since they are usually typos.
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::fetcher::{DEFAULT_MAX_FEED_SIZE, DEFAULT_TIMEOUT};
use crate::feed::{DateFormatError, FetchConfig, ParserSelector};
use crate::sync::{DEFAULT_REFRESH_CONCURRENCY, DEFAULT_REFRESH_INTERVAL};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between timer-driven refreshes of each watched feed.
    pub refresh_interval_secs: u64,

    /// Upper bound on a whole feed request, body included.
    pub request_timeout_secs: u64,

    /// Responses larger than this are rejected without parsing.
    pub max_feed_size_bytes: usize,

    /// How many feeds `refresh` fetches at once.
    pub refresh_concurrency: usize,

    /// SQLite file. Defaults to `feeds.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Domain → LDML date pattern, e.g. `"apple.com" = "EEE, dd MMM yyyy HH:mm:ss zzz"`.
    pub parser_overrides: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            request_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_feed_size_bytes: DEFAULT_MAX_FEED_SIZE,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            database_path: None,
            parser_overrides: HashMap::new(),
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "refresh_interval_secs",
        "request_timeout_secs",
        "max_feed_size_bytes",
        "refresh_concurrency",
        "database_path",
        "parser_overrides",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero interval, timeout, size or concurrency → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            refresh_interval_secs = config.refresh_interval_secs,
            overrides = config.parser_overrides.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("refresh_interval_secs", self.refresh_interval_secs == 0),
            ("request_timeout_secs", self.request_timeout_secs == 0),
            ("max_feed_size_bytes", self.max_feed_size_bytes == 0),
            ("refresh_concurrency", self.refresh_concurrency == 0),
        ];
        for (key, is_zero) in checks {
            if is_zero {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_feed_size: self.max_feed_size_bytes,
        }
    }

    /// Built-in parser table with `parser_overrides` layered on top.
    pub fn selector(&self) -> Result<ParserSelector, ConfigError> {
        ParserSelector::with_overrides(&self.parser_overrides).map_err(|e: DateFormatError| {
            ConfigError::Invalid {
                key: "parser_overrides".to_string(),
                reason: e.to_string(),
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
