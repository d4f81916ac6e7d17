use anyhow::Result;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub session: Session,
    pub pending: Pending,
    pub dispatch: Dispatch,
    pub http_sink: HttpSink,
    pub pixel: Pixel,
    pub partner: Partner,
    pub debounce: Debounce,
    pub observability: Observability,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
    /// Debug mode default; a persisted flag in storage overrides this.
    pub debug: bool,
    /// Source tag stamped into event metadata and batch envelopes.
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct Session {
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Pending {
    pub staleness_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Dispatch {
    pub event_log_capacity: usize,
    /// Event-name prefix marking structured pushes for the tag manager.
    pub structured_prefix: String,
    pub schema_version: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSink {
    pub endpoint: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pixel {
    pub endpoint: String,
    pub store_name: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Partner {
    pub endpoint: String,
    pub site_key: String,
    pub handshake_timeout_ms: u64,
}

/// Per-event-name debounce windows, in milliseconds. Zero disables the
/// window for that name.
#[derive(Debug, Deserialize, Clone)]
pub struct Debounce {
    pub cart_quantity_ms: u64,
    pub cart_item_ms: u64,
    pub package_swap_ms: u64,
    pub upsell_ms: u64,
    pub route_ms: u64,
    pub order_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string("config/default.toml")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
