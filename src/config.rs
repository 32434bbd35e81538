use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::discovery::DiscoveryConfig;
use nostr_core::{
    normalize_relay_url, KIND_CONTACT_LIST, KIND_METADATA, KIND_RELAY_LIST, KIND_TEXT_NOTE,
};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub relays: RelaysConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelaysConfig {
    /// Relays monitored from startup.
    #[serde(default = "default_seed_relays")]
    pub seed: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_kinds")]
    pub kinds: Vec<u16>,
    /// Trailing window requested when subscribing.
    #[serde(default = "default_since_minutes")]
    pub since_minutes: u64,
    /// Messages kept per topic.
    #[serde(default = "default_topic_cap")]
    pub topic_cap: usize,
    #[serde(default = "default_trending_window_secs")]
    pub trending_window_secs: u64,
    #[serde(default = "default_trending_min_messages")]
    pub trending_min_messages: usize,
    /// Capacity of the seen-id LRU used to detect first sightings.
    #[serde(default = "default_seen_cache_size")]
    pub seen_cache_size: usize,
    #[serde(default = "default_profile_cache_size")]
    pub profile_cache_size: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Subscribe to relays promoted from relay-list announcements.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_max_monitored_relays")]
    pub max_monitored_relays: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StoreConfig {
    /// SQLite file for recommendation state. Disabled when unset.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RelaysConfig {
    fn default() -> Self {
        Self {
            seed: default_seed_relays(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            since_minutes: default_since_minutes(),
            topic_cap: default_topic_cap(),
            trending_window_secs: default_trending_window_secs(),
            trending_min_messages: default_trending_min_messages(),
            seen_cache_size: default_seen_cache_size(),
            profile_cache_size: default_profile_cache_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            auto_connect: true,
            max_monitored_relays: default_max_monitored_relays(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_seed_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
    ]
}

fn default_kinds() -> Vec<u16> {
    vec![KIND_METADATA, KIND_TEXT_NOTE, KIND_CONTACT_LIST, KIND_RELAY_LIST]
}

fn default_since_minutes() -> u64 {
    30
}

fn default_topic_cap() -> usize {
    100
}

fn default_trending_window_secs() -> u64 {
    3600
}

fn default_trending_min_messages() -> usize {
    5
}

fn default_seen_cache_size() -> usize {
    10_000
}

fn default_profile_cache_size() -> usize {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_monitored_relays() -> usize {
    50
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_bind_address() -> String {
    "127.0.0.1:3848".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let content = fs::read_to_string(expanded_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    pub fn validate(&self) -> Result<()> {
        for url in &self.relays.seed {
            if normalize_relay_url(url).is_none() {
                anyhow::bail!("Seed relay URL must be a ws:// or wss:// URL: {}", url);
            }
        }

        if self.ingest.kinds.is_empty() {
            anyhow::bail!("ingest.kinds must not be empty");
        }
        if self.ingest.topic_cap == 0 {
            anyhow::bail!("ingest.topic_cap must be at least 1");
        }
        if self.ingest.seen_cache_size == 0 || self.ingest.profile_cache_size == 0 {
            anyhow::bail!("ingest cache sizes must be at least 1");
        }
        if self.ingest.sweep_interval_secs == 0 {
            anyhow::bail!("ingest.sweep_interval_secs must be at least 1");
        }

        self.discovery
            .validate()
            .with_context(|| "Invalid [discovery] section")?;

        if self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("Invalid bind address: {}", self.api.bind);
        }

        Ok(())
    }

    pub fn expand_paths(&mut self) {
        if let Some(path) = &self.store.path {
            self.store.path = Some(shellexpand::tilde(path).to_string());
        }
    }
}
