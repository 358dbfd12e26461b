//! Application configuration for ListingFlow.
//!
//! User config lives at `~/.listingflow/listingflow.toml`.
//! Every key has a default; the config is read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ListingFlowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "listingflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".listingflow";

/// Bus address selecting the in-process broker.
pub const MEMORY_BUS_ADDRESS: &str = "memory://";

// ---------------------------------------------------------------------------
// Config structs (matching listingflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    /// Topic, routing key and queue names.
    #[serde(default)]
    pub topology: TopologyConfig,
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// `memory://` or a path to the durable broker database.
    #[serde(default = "default_bus_address")]
    pub address: String,

    /// How often an idle durable consumer polls for new messages.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Wait before a worker reconnects after losing its consumer.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// How long a durable delivery stays claimed without a heartbeat from
    /// its connection. Expired claims are handed to other consumers.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: default_bus_address(),
            poll_interval_ms: default_poll_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
            lease_ttl_ms: default_lease_ttl(),
        }
    }
}

impl BusConfig {
    pub fn is_memory(&self) -> bool {
        self.address == MEMORY_BUS_ADDRESS
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

fn default_bus_address() -> String {
    "~/.listingflow/bus.db".into()
}
fn default_poll_interval() -> u64 {
    250
}
fn default_reconnect_delay() -> u64 {
    1000
}
fn default_lease_ttl() -> u64 {
    30_000
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.listingflow/listings.db".into()
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed per stage before dead-lettering.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff unit; attempt `n` waits `n * base_delay_ms`.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    5000
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Pages shorter than this are treated as not yet rendered.
    #[serde(default = "default_min_content_len")]
    pub min_content_len: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            min_content_len: default_min_content_len(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_min_content_len() -> usize {
    1000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0 Safari/537.36"
        .into()
}

/// `[topology]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_ingress_topic")]
    pub ingress_topic: String,
    #[serde(default = "default_enrichment_topic")]
    pub enrichment_topic: String,
    #[serde(default = "default_analysis_topic")]
    pub analysis_topic: String,
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,

    #[serde(default = "default_ingest_key")]
    pub ingest_key: String,
    #[serde(default = "default_geo_key")]
    pub geo_key: String,
    #[serde(default = "default_economic_key")]
    pub economic_key: String,
    #[serde(default = "default_persist_key")]
    pub persist_key: String,
    #[serde(default = "default_analyze_key")]
    pub analyze_key: String,
    #[serde(default = "default_notify_key")]
    pub notify_key: String,
    #[serde(default = "default_dead_letter_key")]
    pub dead_letter_key: String,

    #[serde(default = "default_extraction_queue")]
    pub extraction_queue: String,
    #[serde(default = "default_geo_queue")]
    pub geo_queue: String,
    #[serde(default = "default_economic_queue")]
    pub economic_queue: String,
    #[serde(default = "default_persistence_queue")]
    pub persistence_queue: String,
    #[serde(default = "default_scoring_queue")]
    pub scoring_queue: String,
    #[serde(default = "default_notification_queue")]
    pub notification_queue: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            ingress_topic: default_ingress_topic(),
            enrichment_topic: default_enrichment_topic(),
            analysis_topic: default_analysis_topic(),
            notification_topic: default_notification_topic(),
            ingest_key: default_ingest_key(),
            geo_key: default_geo_key(),
            economic_key: default_economic_key(),
            persist_key: default_persist_key(),
            analyze_key: default_analyze_key(),
            notify_key: default_notify_key(),
            dead_letter_key: default_dead_letter_key(),
            extraction_queue: default_extraction_queue(),
            geo_queue: default_geo_queue(),
            economic_queue: default_economic_queue(),
            persistence_queue: default_persistence_queue(),
            scoring_queue: default_scoring_queue(),
            notification_queue: default_notification_queue(),
            dead_letter_queue: default_dead_letter_queue(),
        }
    }
}

fn default_ingress_topic() -> String {
    "ingress".into()
}
fn default_enrichment_topic() -> String {
    "enrichment".into()
}
fn default_analysis_topic() -> String {
    "analysis".into()
}
fn default_notification_topic() -> String {
    "notification".into()
}
fn default_ingest_key() -> String {
    "ingest.request".into()
}
fn default_geo_key() -> String {
    "enrich.geo".into()
}
fn default_economic_key() -> String {
    "enrich.economic".into()
}
fn default_persist_key() -> String {
    "persist.request".into()
}
fn default_analyze_key() -> String {
    "analyze.request".into()
}
fn default_notify_key() -> String {
    "notify.user".into()
}
fn default_dead_letter_key() -> String {
    "parse.failed".into()
}
fn default_extraction_queue() -> String {
    "extraction_queue".into()
}
fn default_geo_queue() -> String {
    "geo_enrichment_queue".into()
}
fn default_economic_queue() -> String {
    "economic_enrichment_queue".into()
}
fn default_persistence_queue() -> String {
    "persistence_queue".into()
}
fn default_scoring_queue() -> String {
    "scoring_queue".into()
}
fn default_notification_queue() -> String {
    "notification_queue".into()
}
fn default_dead_letter_queue() -> String {
    "dead_letter_queue".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.listingflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| ListingFlowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.listingflow/listingflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ListingFlowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ListingFlowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ListingFlowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = render_config(&AppConfig::default())?;

    std::fs::write(&path, content).map_err(|e| ListingFlowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Serialize a config as pretty TOML.
pub fn render_config(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| ListingFlowError::config(e.to_string()))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ListingFlowError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
