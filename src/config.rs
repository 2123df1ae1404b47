//! Runtime configuration: a JSON file plus secrets from the environment.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::capture::RetryPolicy;
use crate::model::TransitSystem;

/// The nine NYCT subway feeds.
pub const NYC_SUBWAY_FEED_IDS: [&str; 9] = ["1", "26", "16", "21", "2", "11", "31", "36", "51"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_system")]
    pub system: TransitSystem,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    pub feed_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Query parameter the key is sent as.
    #[serde(default = "default_api_key_param")]
    pub api_key_param: String,
    /// Send the key in this header instead of the query string.
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(default = "default_feed_ids")]
    pub feed_ids: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_system() -> TransitSystem {
    TransitSystem::NycMta
}

fn default_database_url() -> String {
    "sqlite:database/transit.db?mode=rwc".to_string()
}

fn default_api_key_env() -> String {
    "NYC_MTA_API_KEY".to_string()
}

fn default_api_key_param() -> String {
    "key".to_string()
}

fn default_feed_ids() -> Vec<String> {
    NYC_SUBWAY_FEED_IDS.iter().map(|id| id.to_string()).collect()
}

fn default_max_retries() -> u32 {
    5
}

fn default_delay_secs() -> u64 {
    2
}

fn default_page_size() -> usize {
    100
}

fn default_chunk_size() -> usize {
    20
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_secs: default_delay_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_secs(self.delay_secs))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// API key from the environment, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_json(r#"{"feed_url": "http://datamine.mta.info/mta_esi.php"}"#).unwrap();
        assert_eq!(config.system, TransitSystem::NycMta);
        assert_eq!(config.api_key_param, "key");
        assert_eq!(config.api_key_header, None);
        assert_eq!(config.feed_ids.len(), 9);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.delay_secs, 2);
        assert_eq!(config.batch.page_size, 100);
        assert_eq!(config.batch.chunk_size, 20);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_json(
            r#"{
                "system": "nyc_mta",
                "database_url": "sqlite::memory:",
                "feed_url": "https://api-endpoint.mta.info/feeds",
                "api_key_header": "x-api-key",
                "feed_ids": ["1"],
                "retry": {"max_retries": 1},
                "batch": {"page_size": 10, "chunk_size": 5}
            }"#,
        )
        .unwrap();
        assert_eq!(config.feed_ids, vec!["1".to_string()]);
        assert_eq!(config.api_key_header.as_deref(), Some("x-api-key"));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.delay_secs, 2);
        assert_eq!(config.batch.page_size, 10);
    }

    #[test]
    fn test_missing_feed_url_is_rejected() {
        assert!(Config::from_json("{}").is_err());
        assert!(Config::from_json(r#"{"feed_url": "x", "system": "chicago"}"#).is_err());
    }
}
