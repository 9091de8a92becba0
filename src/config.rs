//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/attendance.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [face]
//! provider = "http"
//! endpoint = "http://127.0.0.1:9000/represent"
//! threshold = 0.5
//! top_k = 5
//!
//! [tasks]
//! max_workers = 3
//! ```
//!
//! Every section except `[db]` and `[server]` is optional and falls back to
//! the defaults below.

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub face: FaceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub attendance: AttendanceConfig,
    #[serde(default)]
    pub sheets: SheetsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FaceConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_face_model")]
    pub model: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            endpoint: None,
            model: default_face_model(),
            threshold: default_threshold(),
            top_k: default_top_k(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl FaceConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_face_model() -> String {
    "SFace".to_string()
}
fn default_threshold() -> f32 {
    0.50
}
fn default_top_k() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: u64,
    /// How often the server checks index freshness; `0` disables the loop.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_age_minutes: default_max_age_minutes(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

fn default_max_age_minutes() -> u64 {
    60
}
fn default_refresh_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            history_limit: default_history_limit(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl TasksConfig {
    /// Retry policy used by task bodies that call external sinks.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

fn default_max_workers() -> usize {
    3
}
fn default_history_limit() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct AttendanceConfig {
    /// UTC offset used to stamp people and punches, `±HH:MM`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_time_zone")]
    pub default_time_zone: String,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            default_time_zone: default_time_zone(),
        }
    }
}

impl AttendanceConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

fn default_utc_offset() -> String {
    "+08:00".to_string()
}
fn default_time_zone() -> String {
    attendance_core::models::DEFAULT_TIME_ZONE.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetsConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_personnel_tab")]
    pub personnel_tab: String,
    #[serde(default = "default_attendance_tab")]
    pub attendance_tab: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            personnel_tab: default_personnel_tab(),
            attendance_tab: default_attendance_tab(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_personnel_tab() -> String {
    "personnel".to_string()
}
fn default_attendance_tab() -> String {
    "attendance".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_storage_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub public_urls: bool,
    #[serde(default = "default_signed_url_expiry_hours")]
    pub signed_url_expiry_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            bucket: String::new(),
            region: default_region(),
            prefix: default_storage_prefix(),
            endpoint_url: None,
            public_urls: false,
            signed_url_expiry_hours: default_signed_url_expiry_hours(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_storage_prefix() -> String {
    "attendance/".to_string()
}
fn default_signed_url_expiry_hours() -> u64 {
    24
}

/// Parse a `±HH:MM` UTC offset.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => anyhow::bail!("invalid utc offset '{}': expected ±HH:MM", s),
    };
    let (h, m) = rest
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid utc offset '{}': expected ±HH:MM", s))?;
    let hours: i32 = h
        .parse()
        .with_context(|| format!("invalid utc offset hours in '{}'", s))?;
    let minutes: i32 = m
        .parse()
        .with_context(|| format!("invalid utc offset minutes in '{}'", s))?;
    if hours > 14 || minutes > 59 {
        anyhow::bail!("utc offset '{}' out of range", s);
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow::anyhow!("utc offset '{}' out of range", s))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate face recognition
    if !(-1.0..=1.0).contains(&config.face.threshold) {
        anyhow::bail!("face.threshold must be in [-1.0, 1.0]");
    }
    if config.face.top_k == 0 {
        anyhow::bail!("face.top_k must be >= 1");
    }
    match config.face.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.face.endpoint.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("face.endpoint must be set when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown face provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    // Validate tasks
    if config.tasks.max_workers == 0 {
        anyhow::bail!("tasks.max_workers must be >= 1");
    }
    if config.tasks.history_limit == 0 {
        anyhow::bail!("tasks.history_limit must be >= 1");
    }
    if !config.tasks.backoff_factor.is_finite() || config.tasks.backoff_factor < 1.0 {
        anyhow::bail!("tasks.backoff_factor must be a finite number >= 1.0");
    }

    config.attendance.offset()?;

    match config.sheets.provider.as_str() {
        "disabled" => {}
        "webhook" => {
            if config.sheets.url.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("sheets.url must be set when provider is 'webhook'");
            }
        }
        other => anyhow::bail!(
            "Unknown sheets provider: '{}'. Must be disabled or webhook.",
            other
        ),
    }

    match config.storage.provider.as_str() {
        "disabled" => {}
        "s3" => {
            if config.storage.bucket.is_empty() {
                anyhow::bail!("storage.bucket must be set when provider is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage provider: '{}'. Must be disabled or s3.",
            other
        ),
    }

    Ok(())
}
