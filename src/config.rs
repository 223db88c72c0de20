//! Configuration — TOML file defaults + environment variable overrides.
//!
//! Pipeline parameters live in `config/default.toml`.
//! Secrets (API key, database URL, anonymization key) come from
//! environment variables. No component reads the environment directly;
//! everything flows through the `Config` value built here.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub sync: SyncConfig,
    pub anonymize: AnonymizeConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.sumup.com/v0.1".into()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Allowed drift between a line item's stated total and
    /// unit_price * quantity + vat_amount.
    #[serde(default = "default_tolerance")]
    pub line_item_tolerance: Decimal,
    /// Explicit start watermark (RFC 3339) for backfills. Overrides the
    /// persisted watermark for this run only.
    #[serde(default)]
    pub start_watermark: Option<String>,
}

fn default_page_size() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    50
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizeConfig {
    #[serde(default)]
    pub key: String,
    /// Maximum coordinate perturbation per axis, in degrees.
    #[serde(default = "default_jitter")]
    pub jitter_degrees: Decimal,
    /// Hex chars kept for hashed display fields (username). auth_code
    /// keeps the full digest.
    #[serde(default = "default_hash_prefix_len")]
    pub hash_prefix_len: usize,
}

fn default_jitter() -> Decimal {
    Decimal::new(45, 3) // 0.045 degrees, roughly 5 km
}
fn default_hash_prefix_len() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_output: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from `config/default.toml` merged with env vars.
    /// Non-secret overrides use the `POS__` prefix (e.g. `POS__SYNC__PAGE_SIZE`).
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("POS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = builder.try_deserialize()?;

        // Secrets come from env only (these should never be in TOML)
        if let Ok(v) = env::var("POS_API_KEY") {
            cfg.api.api_key = v;
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database.url = v;
        }
        if let Ok(v) = env::var("ANONYMIZE_KEY") {
            cfg.anonymize.key = v;
        }
        if let Ok(v) = env::var("START_WATERMARK") {
            cfg.sync.start_watermark = Some(v);
        }

        Ok(cfg)
    }
}
