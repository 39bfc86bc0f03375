//! Configuration file parser for ~/.config/news-aggregator/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchConfig;

/// Environment variable that overrides `database_path`.
pub const DATABASE_ENV_VAR: &str = "NEWS_AGGREGATOR_DB";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `None` means `<config dir>/aggregator.db`.
    /// The `NEWS_AGGREGATOR_DB` env var takes precedence.
    pub database_path: Option<PathBuf>,

    /// User-Agent sent on every outbound fetch (webhooks use their own).
    pub user_agent: String,

    /// Permit fetching loopback and private-network hosts.
    /// Only for trusted deployments and local testing.
    pub allow_private_hosts: bool,

    pub fetch: FetchSettings,
    pub refresh: RefreshSettings,
    pub synthesis: SynthesisSettings,
    pub webhook: WebhookSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Bound for discovery and structure-detection requests.
    pub default_timeout_secs: u64,
    /// Bound for page fetches made while synthesizing a feed.
    pub synthesis_timeout_secs: u64,
    /// Bound for feed downloads during refresh (covers redirect chains).
    pub feed_timeout_secs: u64,
    /// Response bodies larger than this are rejected.
    pub max_response_bytes: usize,
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Sources refreshed in parallel within one project.
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisSettings {
    /// Default cap on scraped articles when a source config omits `maxItems`.
    pub max_items: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            user_agent: crate::feed::DEFAULT_USER_AGENT.to_string(),
            allow_private_hosts: false,
            fetch: FetchSettings::default(),
            refresh: RefreshSettings::default(),
            synthesis: SynthesisSettings::default(),
            webhook: WebhookSettings::default(),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 10,
            synthesis_timeout_secs: 15,
            feed_timeout_secs: 30,
            max_response_bytes: 10 * 1024 * 1024,
            max_redirects: 10,
        }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            max_concurrent: crate::refresh::DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self { max_items: 20 }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a corrupted multi-GB file
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
            let known_keys = [
                "database_path",
                "user_agent",
                "allow_private_hosts",
                "fetch",
                "refresh",
                "synthesis",
                "webhook",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            max_concurrent = config.refresh.max_concurrent,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Resolves the database path: env var, then config value, then default.
    pub fn resolve_database_path(&self, config_dir: &Path) -> PathBuf {
        if let Ok(from_env) = std::env::var(DATABASE_ENV_VAR) {
            if !from_env.trim().is_empty() {
                return PathBuf::from(from_env);
            }
        }
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("aggregator.db"))
    }

    /// Builds the read-only fetch configuration shared by every component.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.user_agent.clone(),
            default_timeout: Duration::from_secs(self.fetch.default_timeout_secs),
            synthesis_timeout: Duration::from_secs(self.fetch.synthesis_timeout_secs),
            feed_timeout: Duration::from_secs(self.fetch.feed_timeout_secs),
            webhook_timeout: Duration::from_secs(self.webhook.timeout_secs),
            max_response_bytes: self.fetch.max_response_bytes,
            max_redirects: self.fetch.max_redirects,
            allow_private_hosts: self.allow_private_hosts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
