//! Configuration for the credit ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// HTTP listen address for caller-facing routes
    pub http_listen_addr: String,

    /// HTTP listen address for catalog sync; keep it off the public network
    pub internal_listen_addr: String,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Credit amounts granted by the platform
    pub rewards: RewardConfig,

    /// Referral reward reactor configuration
    pub reactor: ReactorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "credit-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            http_listen_addr: "0.0.0.0:8080".to_string(),
            internal_listen_addr: "127.0.0.1:8081".to_string(),
            json_logs: false,
            storage: StorageConfig::default(),
            rewards: RewardConfig::default(),
            reactor: ReactorConfig::default(),
        }
    }
}

/// RocksDB and transaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,

    /// Attempts per transaction before a conflict is reported to the caller
    pub max_txn_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
            max_txn_retries: 16,
        }
    }
}

/// Platform-granted credit amounts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Balance of a freshly opened account
    pub starting_credits: u64,

    /// Granted to a new user registering a referral code
    pub signup_bonus: u64,

    /// Paid to the referrer on the referred user's first purchase
    pub referral_reward: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            starting_credits: 100,
            signup_bonus: 25,
            referral_reward: 50,
        }
    }
}

/// Reward reactor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Mailbox capacity (bounded for backpressure)
    pub mailbox_capacity: usize,

    /// Outbox sweep period (milliseconds); picks up events the mailbox dropped
    pub sweep_interval_ms: u64,

    /// Disable to leave purchase events in the outbox
    pub enabled: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            sweep_interval_ms: 5_000,
            enabled: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("LEDGER_HTTP_ADDR") {
            config.http_listen_addr = addr;
        }

        if let Ok(addr) = std::env::var("LEDGER_INTERNAL_HTTP_ADDR") {
            config.internal_listen_addr = addr;
        }

        if let Ok(json) = std::env::var("LEDGER_JSON_LOGS") {
            config.json_logs = json == "1" || json.eq_ignore_ascii_case("true");
        }

        if let Ok(retries) = std::env::var("LEDGER_MAX_TXN_RETRIES") {
            config.storage.max_txn_retries = retries
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_MAX_TXN_RETRIES: {}", e)))?;
        }

        Ok(config)
    }
}
