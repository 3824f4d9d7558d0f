use serde::Deserialize;
use std::fs;
use std::env;
use anyhow::{Context, Result};

use crate::behavior::BehaviorConfig;
use crate::guard::GuardConfig;
use crate::query::QueryOptions;
use crate::ratelimit::RateLimitConfig;
use crate::validator::ValidationConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub ws_path: String,
    pub max_connections_per_ip: usize,
    pub max_frame_bytes: usize,
    /// How long a rate-limited submission may wait for the next window; 0 rejects immediately.
    #[serde(default)]
    pub submit_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_open_queries: usize,
    #[serde(flatten)]
    pub defaults: QueryOptions,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_open_queries: 8,
            defaults: QueryOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub base_url: String,
    pub timeout_ms: u64,
    /// JSON seed for the memory backend.
    pub seed_file: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            base_url: "http://127.0.0.1:8085".to_string(),
            timeout_ms: 5_000,
            seed_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enable: bool,
    pub bind_addr: String,
    pub path: String,
}

impl Config {
    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            rate_limit: self.limits.clone(),
            validation: self.validation.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

pub fn load_config() -> Result<Config> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let config_content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    let config: Config = toml::from_str(&config_content)
        .with_context(|| "Failed to parse configuration")?;

    Ok(config)
}
