//! Configuration: TOML file, then environment overrides, then validation.
//!
//! Every section and field has a default, so an empty (or absent) file is a
//! valid configuration as long as the credentials come from the
//! environment. Credentials are deliberately *not* validated by
//! [`load_config`]; [`Config::source_credentials`] and
//! [`Config::destination_credentials`] resolve them separately so a missing
//! key surfaces as [`SyncError::Credentials`] before any sync work starts.
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `RS_SUBDOMAIN` | `source.subdomain` |
//! | `RS_API_KEY` | `source.api_key` |
//! | `ONYX_API_URL` | `destination.url` |
//! | `ONYX_API_KEY` | `destination.api_key` |
//! | `RS_INCLUDE_{CUSTOMERS,ASSETS,TICKETS,INVOICES}` | `sync.include_*` |
//! | `RS_INCLUDE_INTERNAL_COMMENTS` | `sync.include_internal_comments` |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;
use crate::models::EntityType;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Replaces `https://{subdomain}.repairshopr.com/api/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub burst_capacity: Option<u32>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fetch_ticket_comments: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            subdomain: String::new(),
            api_key: None,
            base_url: None,
            requests_per_minute: default_rpm(),
            burst_capacity: None,
            page_size: default_page_size(),
            timeout_secs: default_source_timeout(),
            fetch_ticket_comments: false,
        }
    }
}

fn default_rpm() -> u32 {
    150
}
fn default_page_size() -> usize {
    25
}
fn default_source_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_destination_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_source_tag")]
    pub source_tag: Option<String>,
    /// Consecutive documents that must run out of retries before the
    /// destination is treated as down. Fewer are per-document failures.
    #[serde(default = "default_outage_after")]
    pub outage_after: usize,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_destination_timeout(),
            source_tag: default_source_tag(),
            outage_after: default_outage_after(),
        }
    }
}

fn default_destination_timeout() -> u64 {
    120
}
fn default_source_tag() -> Option<String> {
    Some("ingestion_api".to_string())
}
fn default_outage_after() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub include_customers: bool,
    #[serde(default = "default_true")]
    pub include_assets: bool,
    #[serde(default = "default_true")]
    pub include_tickets: bool,
    #[serde(default)]
    pub include_invoices: bool,
    #[serde(default)]
    pub include_internal_comments: bool,
    /// Only tickets in these statuses become documents. Empty means all.
    #[serde(default)]
    pub ticket_statuses: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            include_customers: true,
            include_assets: true,
            include_tickets: true,
            include_invoices: false,
            include_internal_comments: false,
            ticket_statuses: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn includes(&self, entity: EntityType) -> bool {
        match entity {
            EntityType::Customer => self.include_customers,
            EntityType::Asset => self.include_assets,
            EntityType::Ticket => self.include_tickets,
            EntityType::Invoice => self.include_invoices,
        }
    }

    pub fn ticket_status_allowed(&self, status: &str) -> bool {
        self.ticket_statuses.is_empty()
            || self
                .ticket_statuses
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(status.trim()))
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_capacity() -> usize {
    60_000
}
fn default_cache_ttl() -> u64 {
    4 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    2_000
}
fn default_max_delay() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    /// Row in the SQLite backend, so several pipelines can share one database.
    #[serde(default = "default_checkpoint_name")]
    pub name: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: default_checkpoint_path(),
            name: default_checkpoint_name(),
        }
    }
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("~/.onyx-rs-bridge/state.json")
}
fn default_checkpoint_name() -> String {
    "repairshopr".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============ Credentials ============

impl Config {
    /// RepairShopr API key; missing is fatal.
    pub fn source_credentials(&self) -> Result<String, SyncError> {
        if self.source.subdomain.trim().is_empty() {
            return Err(SyncError::Credentials(
                "source.subdomain (RS_SUBDOMAIN) is not set".to_string(),
            ));
        }
        non_empty(&self.source.api_key)
            .ok_or_else(|| SyncError::Credentials("RS_API_KEY is not set".to_string()))
    }

    /// Onyx base URL and API key; missing is fatal unless running dry.
    pub fn destination_credentials(&self) -> Result<(String, String), SyncError> {
        let url = non_empty(&self.destination.url).ok_or_else(|| {
            SyncError::Credentials("destination.url (ONYX_API_URL) is not set".to_string())
        })?;
        let key = non_empty(&self.destination.api_key)
            .ok_or_else(|| SyncError::Credentials("ONYX_API_KEY is not set".to_string()))?;
        Ok((url, key))
    }

    /// Apply `RS_*` / `ONYX_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RS_SUBDOMAIN") {
            self.source.subdomain = v.trim().to_string();
        }
        if let Some(v) = lookup("RS_API_KEY") {
            self.source.api_key = Some(v);
        }
        if let Some(v) = lookup("ONYX_API_URL") {
            self.destination.url = Some(v);
        }
        if let Some(v) = lookup("ONYX_API_KEY") {
            self.destination.api_key = Some(v);
        }
        let flags: [(&str, &mut bool); 5] = [
            ("RS_INCLUDE_CUSTOMERS", &mut self.sync.include_customers),
            ("RS_INCLUDE_ASSETS", &mut self.sync.include_assets),
            ("RS_INCLUDE_TICKETS", &mut self.sync.include_tickets),
            ("RS_INCLUDE_INVOICES", &mut self.sync.include_invoices),
            (
                "RS_INCLUDE_INTERNAL_COMMENTS",
                &mut self.sync.include_internal_comments,
            ),
        ];
        for (name, slot) in flags {
            if let Some(v) = lookup(name) {
                *slot = parse_flag(&v).with_context(|| format!("invalid value for {}", name))?;
            }
        }
        Ok(())
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_flag(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected true/false, got '{}'", other),
    }
}

// ============ Loading ============

/// Default config location: `~/.onyx-rs-bridge/config.toml`.
pub fn default_config_path() -> PathBuf {
    expand_tilde(Path::new("~/.onyx-rs-bridge/config.toml"))
}

/// Load configuration.
///
/// An explicit `path` must exist. Without one, the default location is
/// used when present and built-in defaults otherwise. Environment
/// overrides are applied before validation.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => parse_file(p)?,
        None => {
            let default = default_config_path();
            if default.exists() {
                parse_file(&default)?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env_overrides(|k| std::env::var(k).ok())?;
    config.checkpoint.path = expand_tilde(&config.checkpoint.path);
    validate(&config)?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn validate(config: &Config) -> Result<()> {
    let rpm = config.source.requests_per_minute;
    if !(1..=180).contains(&rpm) {
        anyhow::bail!(
            "source.requests_per_minute must be in 1..=180 (RepairShopr hard limit), got {}",
            rpm
        );
    }
    if config.source.page_size == 0 {
        anyhow::bail!("source.page_size must be > 0");
    }
    let sub = config.source.subdomain.trim();
    if sub.contains('/') || sub.contains('.') {
        anyhow::bail!(
            "source.subdomain must be the bare subdomain (e.g. 'acme'), got '{}'",
            sub
        );
    }
    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be > 0");
    }
    if config.destination.outage_after == 0 {
        anyhow::bail!("destination.outage_after must be > 0");
    }
    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be > 0");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        anyhow::bail!(
            "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
            config.retry.base_delay_ms,
            config.retry.max_delay_ms
        );
    }
    Ok(())
}

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") || s == "~" {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(s.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn empty_file_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.source.requests_per_minute, 150);
        assert_eq!(config.sync.batch_size, 50);
        assert!(config.sync.include_tickets);
        assert!(!config.sync.include_invoices);
        assert_eq!(config.cache.capacity, 60_000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.destination.source_tag.as_deref(), Some("ingestion_api"));
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
        assert_eq!(config.checkpoint.name, "repairshopr");
        assert_eq!(config.destination.outage_after, 5);
        validate(&config).unwrap();
    }

    #[test]
    fn parses_sections() {
        let config: Config = toml::from_str(
            r#"
            [source]
            subdomain = "acme"
            requests_per_minute = 120
            [sync]
            include_invoices = true
            ticket_statuses = ["Resolved", "Closed"]
            [checkpoint]
            backend = "sqlite"
            path = "/var/lib/rs/state.db"
            name = "shop-east"
            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.source.subdomain, "acme");
        assert!(config.sync.includes(EntityType::Invoice));
        assert!(config.sync.ticket_status_allowed("resolved"));
        assert!(!config.sync.ticket_status_allowed("In Progress"));
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Sqlite);
        assert_eq!(config.checkpoint.name, "shop-east");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("RS_SUBDOMAIN", " acme "),
            ("RS_API_KEY", "k1"),
            ("RS_INCLUDE_INVOICES", "yes"),
            ("RS_INCLUDE_ASSETS", "0"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.source.subdomain, "acme");
        assert_eq!(config.source_credentials().unwrap(), "k1");
        assert!(config.sync.include_invoices);
        assert!(!config.sync.include_assets);

        let mut bad = Config::default();
        assert!(bad
            .apply_env_overrides(|k| (k == "RS_INCLUDE_TICKETS").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn missing_credentials_are_typed() {
        let config = Config::default();
        assert!(matches!(
            config.source_credentials(),
            Err(SyncError::Credentials(_))
        ));
        assert!(matches!(
            config.destination_credentials(),
            Err(SyncError::Credentials(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.source.requests_per_minute = 200;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.source.subdomain = "acme.repairshopr.com".into();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.retry.base_delay_ms = 60_000;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.sync.batch_size = 0;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.destination.outage_after = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
