//! Configuration management for kledger

use crate::error::{ChainError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub mining: MiningConfig,
    pub webhooks: WebhookConfig,
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL clients use to reach this node; websocket URLs are derived from it.
    pub public_url: String,
    pub motd: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            motd: "Welcome to kledger".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/kledger.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub enabled: bool,
    pub address_prefix: char,
    pub nonce_max_size: usize,
    pub initial_work: u64,
    pub min_work: u64,
    pub max_work: u64,
    pub work_factor: f64,
    pub seconds_per_block: u64,
    pub base_reward: u64,
    pub reduced_reward: u64,
    pub reward_reduction_height: u64,
    pub genesis_hash: String,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address_prefix: 'k',
            nonce_max_size: 24,
            initial_work: 100_000,
            min_work: 1,
            max_work: 100_000,
            work_factor: 0.025,
            seconds_per_block: 300,
            base_reward: 25,
            reduced_reward: 1,
            reward_reduction_height: 222_222,
            genesis_hash: "0".repeat(64),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    pub max_in_flight: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub token_ttl_secs: u64,
    pub event_buffer: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 30,
            event_buffer: 1024,
        }
    }
}

impl Config {
    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mining = &self.mining;
        if !mining.address_prefix.is_ascii_lowercase() && !mining.address_prefix.is_ascii_digit() {
            return Err(ChainError::ConfigError(
                "mining.address_prefix must be a lowercase ascii letter or digit".to_string(),
            ));
        }
        if mining.min_work > mining.max_work {
            return Err(ChainError::ConfigError(
                "mining.min_work must not exceed mining.max_work".to_string(),
            ));
        }
        if !(mining.min_work..=mining.max_work).contains(&mining.initial_work) {
            return Err(ChainError::ConfigError(
                "mining.initial_work must lie within [min_work, max_work]".to_string(),
            ));
        }
        if mining.nonce_max_size == 0 {
            return Err(ChainError::ConfigError(
                "mining.nonce_max_size must be positive".to_string(),
            ));
        }
        if mining.seconds_per_block == 0 {
            return Err(ChainError::ConfigError(
                "mining.seconds_per_block must be positive".to_string(),
            ));
        }
        if mining.genesis_hash.len() != 64
            || !mining.genesis_hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ChainError::ConfigError(
                "mining.genesis_hash must be 64 lowercase hex characters".to_string(),
            ));
        }
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError("database.path must be set".to_string()));
        }
        if self.webhooks.max_in_flight == 0 || self.websocket.event_buffer == 0 {
            return Err(ChainError::ConfigError(
                "webhooks.max_in_flight and websocket.event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from `path`, falling back to defaults when the file is
/// absent, then apply `PORT` / `KLEDGER_DATABASE` environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let config_str = match fs::read_to_string(path.as_ref()) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
        config.server.port = port;
    }
    if let Ok(db) = std::env::var("KLEDGER_DATABASE") {
        config.database.path = db;
    }

    config.validate()?;
    Ok(config)
}
