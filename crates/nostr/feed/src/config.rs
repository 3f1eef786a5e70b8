//! Feed and application configuration.
//!
//! The application config is a single JSON file:
//!
//! ```json
//! {
//!   "client": { "relays": ["wss://nos.lol"], "pingIntervalMs": 30000 },
//!   "feed": { "postKinds": [20], "sort": "trending" }
//! }
//! ```
//!
//! Every field is optional.

use crate::rank::SortPolicy;
use nostr_client::{ClientConfig, ConfigError};
use nostr_core::{KIND_PICTURE, KIND_SHORT_TEXT_NOTE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    /// Pubkey whose own reactions are flagged in the view
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_pubkey: Option<String>,

    /// Kinds stored as posts
    #[serde(default = "default_post_kinds")]
    pub post_kinds: Vec<u16>,

    #[serde(default)]
    pub sort: SortPolicy,

    #[serde(default = "default_half_life")]
    pub trending_half_life_hours: f64,

    /// How long missing keys are collected before one batched fetch
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window_ms: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_max_posts")]
    pub max_posts: usize,

    /// HTTP endpoint for batched profile lookups. Relays are queried when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_service_url: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            viewer_pubkey: None,
            post_kinds: default_post_kinds(),
            sort: SortPolicy::default(),
            trending_half_life_hours: default_half_life(),
            coalesce_window_ms: default_coalesce_window(),
            fetch_timeout_ms: default_fetch_timeout(),
            max_posts: default_max_posts(),
            metadata_service_url: None,
        }
    }
}

impl FeedConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.post_kinds.is_empty() {
            return Err(ConfigError::Invalid("postKinds must not be empty".into()));
        }
        let half_life = self.trending_half_life_hours;
        if half_life.is_nan() || half_life <= 0.0 {
            return Err(ConfigError::Invalid(
                "trendingHalfLifeHours must be positive".into(),
            ));
        }
        if self.max_posts == 0 {
            return Err(ConfigError::Invalid("maxPosts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub feed: FeedConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.feed.validate()
    }
}

/// Load and validate the config at `path`. A missing file yields defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str::<AppConfig>(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?
    } else {
        debug!("No config at {}, using defaults", path.display());
        AppConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn default_post_kinds() -> Vec<u16> {
    vec![KIND_SHORT_TEXT_NOTE, KIND_PICTURE]
}

fn default_half_life() -> f64 {
    6.0
}

fn default_coalesce_window() -> u64 {
    250
}

fn default_fetch_timeout() -> u64 {
    5_000
}

fn default_max_posts() -> usize {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.feed.post_kinds, vec![1, 20]);
        assert_eq!(config.feed.sort, SortPolicy::Chronological);
        assert_eq!(config.feed.coalesce_window(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"client":{{"relays":["nos.lol"]}},"feed":{{"sort":"trending","maxPosts":10}}}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.client.relays, vec!["nos.lol"]);
        assert_eq!(config.client.ping_interval_ms, 30_000);
        assert_eq!(config.feed.sort, SortPolicy::Trending);
        assert_eq!(config.feed.max_posts, 10);
        assert_eq!(config.feed.trending_half_life_hours, 6.0);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"feed":{{"postKinds":[]}}}}"#).unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let config = FeedConfig {
            trending_half_life_hours: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
