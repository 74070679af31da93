use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub archiver: ArchiverConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub gap_detection: GapDetectionConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_folder_pattern")]
    pub folder_archive_all_pattern: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_folder_pattern() -> String {
    "archive*".to_string()
}
fn default_shutdown_grace() -> String {
    "30s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    #[serde(default = "default_source_account")]
    pub source_account: String,
}

fn default_source_account() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/tg_archiver".to_string()
}
fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_max_stream_length")]
    pub max_stream_length: u64,
    #[serde(default = "default_max_dlq_length")]
    pub max_dlq_length: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_auto_claim_min_idle")]
    pub auto_claim_min_idle: String,
    #[serde(default = "default_stale_consumer_idle")]
    pub stale_consumer_idle: String,
    #[serde(default = "default_stale_consumer_force_idle")]
    pub stale_consumer_force_idle: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            consumer_group: default_consumer_group(),
            max_stream_length: default_max_stream_length(),
            max_dlq_length: default_max_dlq_length(),
            max_retries: default_max_retries(),
            auto_claim_min_idle: default_auto_claim_min_idle(),
            stale_consumer_idle: default_stale_consumer_idle(),
            stale_consumer_force_idle: default_stale_consumer_force_idle(),
        }
    }
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_consumer_group() -> String {
    "processor-workers".to_string()
}
fn default_max_stream_length() -> u64 {
    100_000
}
fn default_max_dlq_length() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_auto_claim_min_idle() -> String {
    "5m".to_string()
}
fn default_stale_consumer_idle() -> String {
    "5m".to_string()
}
fn default_stale_consumer_force_idle() -> String {
    "50m".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_object_store_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_object_store_region")]
    pub region: String,
    #[serde(default = "default_object_store_bucket")]
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_object_store_endpoint(),
            region: default_object_store_region(),
            bucket: default_object_store_bucket(),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: default_force_path_style(),
        }
    }
}

fn default_object_store_endpoint() -> String {
    "http://127.0.0.1:9000".to_string()
}
fn default_object_store_region() -> String {
    "us-east-1".to_string()
}
fn default_object_store_bucket() -> String {
    "tg-archiver-media".to_string()
}
fn default_force_path_style() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backfill_mode")]
    pub mode: String,
    pub start_date: Option<String>,
    #[serde(default = "default_backfill_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_backfill_delay_ms")]
    pub delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_backfill_mode(),
            start_date: None,
            batch_size: default_backfill_batch_size(),
            delay_ms: default_backfill_delay_ms(),
        }
    }
}

fn default_backfill_mode() -> String {
    "on_discovery".to_string()
}
fn default_backfill_batch_size() -> u32 {
    100
}
fn default_backfill_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
pub struct GapDetectionConfig {
    #[serde(default = "default_gap_enabled")]
    pub enabled: bool,
    #[serde(default = "default_gap_threshold_hours")]
    pub threshold_hours: u32,
    #[serde(default = "default_gap_check_interval")]
    pub check_interval: String,
    #[serde(default = "default_gap_max_channels")]
    pub max_channels_per_check: u32,
}

impl Default for GapDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_gap_enabled(),
            threshold_hours: default_gap_threshold_hours(),
            check_interval: default_gap_check_interval(),
            max_channels_per_check: default_gap_max_channels(),
        }
    }
}

fn default_gap_enabled() -> bool {
    true
}
fn default_gap_threshold_hours() -> u32 {
    6
}
fn default_gap_check_interval() -> String {
    "5m".to_string()
}
fn default_gap_max_channels() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_processor_workers")]
    pub workers: u32,
    #[serde(default = "default_processor_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_block_time_realtime")]
    pub block_time_realtime: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: default_processor_workers(),
            batch_size: default_processor_batch_size(),
            block_time_realtime: default_block_time_realtime(),
        }
    }
}

fn default_processor_workers() -> u32 {
    4
}
fn default_processor_batch_size() -> u32 {
    10
}
fn default_block_time_realtime() -> String {
    "1s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_target_language")]
    pub target_language: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_language: default_target_language(),
        }
    }
}

fn default_target_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_import_dir")]
    pub watch_dir: PathBuf,
    #[serde(default = "default_import_concurrency")]
    pub concurrency: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_import_dir(),
            concurrency: default_import_concurrency(),
        }
    }
}

fn default_import_dir() -> PathBuf {
    PathBuf::from("./import")
}
fn default_import_concurrency() -> u32 {
    2
}

impl Config {
    /// Resolve the MTProto session file path (relative to data_dir if not absolute).
    pub fn session_path(&self) -> PathBuf {
        self.archiver.data_dir.join("session.db")
    }

    /// Parse `backfill.start_date` (RFC 3339) as the default start point for channels
    /// with no per-channel override and no prior progress.
    pub fn backfill_start_date(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.backfill
            .start_date
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.archiver.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.archiver.version
        ))
        .into());
    }

    if config.telegram.api_id.is_none() || config.telegram.api_hash.is_none() {
        return Err(ConfigError::Validation(
            "[telegram] api_id and api_hash are required".to_string(),
        )
        .into());
    }

    humantime::parse_duration(&config.archiver.shutdown_grace).map_err(|e| {
        ConfigError::Validation(format!(
            "archiver.shutdown_grace '{}': {}",
            config.archiver.shutdown_grace, e
        ))
    })?;

    match config.backfill.mode.as_str() {
        "on_discovery" | "manual" | "continuous" => {}
        other => {
            return Err(ConfigError::Validation(format!("backfill.mode: unknown mode '{other}'")).into());
        }
    }

    if let Some(ref start_date) = config.backfill.start_date {
        chrono::DateTime::parse_from_rfc3339(start_date)
            .map_err(|e| ConfigError::Validation(format!("backfill.start_date '{start_date}': {e}")))?;
    }

    if config.backfill.batch_size == 0 {
        return Err(ConfigError::Validation("backfill.batch_size must be greater than 0".to_string()).into());
    }

    humantime::parse_duration(&config.gap_detection.check_interval).map_err(|e| {
        ConfigError::Validation(format!(
            "gap_detection.check_interval '{}': {}",
            config.gap_detection.check_interval, e
        ))
    })?;

    if config.gap_detection.threshold_hours == 0 {
        return Err(ConfigError::Validation("gap_detection.threshold_hours must be greater than 0".to_string()).into());
    }

    humantime::parse_duration(&config.broker.auto_claim_min_idle).map_err(|e| {
        ConfigError::Validation(format!(
            "broker.auto_claim_min_idle '{}': {}",
            config.broker.auto_claim_min_idle, e
        ))
    })?;
    humantime::parse_duration(&config.broker.stale_consumer_idle).map_err(|e| {
        ConfigError::Validation(format!(
            "broker.stale_consumer_idle '{}': {}",
            config.broker.stale_consumer_idle, e
        ))
    })?;
    humantime::parse_duration(&config.broker.stale_consumer_force_idle).map_err(|e| {
        ConfigError::Validation(format!(
            "broker.stale_consumer_force_idle '{}': {}",
            config.broker.stale_consumer_force_idle, e
        ))
    })?;
    humantime::parse_duration(&config.processor.block_time_realtime).map_err(|e| {
        ConfigError::Validation(format!(
            "processor.block_time_realtime '{}': {}",
            config.processor.block_time_realtime, e
        ))
    })?;

    if config.processor.workers == 0 {
        return Err(ConfigError::Validation("processor.workers must be greater than 0".to_string()).into());
    }

    if config.object_store.bucket.is_empty() {
        return Err(ConfigError::Validation("object_store.bucket must not be empty".to_string()).into());
    }

    if config.telegram.source_account.trim().is_empty() {
        return Err(ConfigError::Validation("telegram.source_account must not be empty".to_string()).into());
    }

    Ok(())
}

/// `folder_archive_all_pattern` is matched against folder titles with an exact,
/// case-insensitive comparison — no glob support. Exposed separately so discovery can
/// reuse the same matcher without re-parsing config each cycle.
pub fn folder_matches_pattern(folder_title: &str, pattern: &str) -> bool {
    folder_title.eq_ignore_ascii_case(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_pattern_matches_case_insensitively() {
        assert!(folder_matches_pattern("Archive All", "archive all"));
        assert!(folder_matches_pattern("ARCHIVE ALL", "archive all"));
        assert!(!folder_matches_pattern("News", "archive all"));
    }

    #[test]
    fn folder_pattern_does_not_match_partial_titles() {
        assert!(!folder_matches_pattern("Full Archive All", "archive all"));
        assert!(!folder_matches_pattern("Archive All 2", "archive all"));
    }
}
