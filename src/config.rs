//! Configuration using Figment
//!
//! Settings are loaded from:
//! 1. A TOML file (default `config/rfid_ingest.toml`; a missing file means all defaults)
//! 2. Environment variables prefixed with `RFID_INGEST_`, nested with `__`
//!
//! Every field has a default, so a bare deployment runs with 3 s `Reader` gating and a
//! store under `~/.rfid_ingest`.
//!
//! Running components never hold a `Settings` of their own. They read the latest
//! version from a [`ConfigHandle`] at the top of each processing cycle, and anything
//! that changes configuration publishes a whole new version through the same handle.
//!
//! # Example
//! ```no_run
//! use rfid_ingest::config::{ConfigHandle, Settings};
//!
//! let settings = Settings::load()?;
//! let handle = ConfigHandle::new(settings);
//! handle.update(|s| s.reader.gating = Some(5.0));
//! assert_eq!(handle.current().version, 2);
//! # Ok::<(), rfid_ingest::error::IngestError>(())
//! ```

use chrono::{DateTime, FixedOffset, Local, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{AppResult, IngestError};
use crate::logging::OutputFormat;
use crate::tags::gating::{resolve_window, GatingStyle};
use crate::tags::read::{format_offset, parse_offset};

/// Default settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/rfid_ingest.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Gating and reader definitions
    pub reader: ReaderSettings,
    /// Durable store settings
    pub storage: StorageSettings,
    /// Status sampler settings
    pub status: StatusSettings,
    /// Inter-stage queue sizes
    pub queues: QueueSettings,
}

/// Application-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    /// Identifier reported in every status snapshot
    pub unit_id: String,
    /// `AUTO` for the system zone, or a fixed offset such as `-05:00`
    pub timezone: String,
}

/// Gating configuration and the reader set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    /// Gating window in seconds
    #[serde(deserialize_with = "lenient_seconds")]
    pub gating: Option<f64>,
    /// How detections are grouped within a window
    #[serde(deserialize_with = "lenient_style")]
    pub gating_style: GatingStyle,
    /// Physical (or simulated) readers
    pub readers: Vec<ReaderDefinition>,
}

/// One configured reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderDefinition {
    /// Reader id stamped on every read it produces
    pub id: u32,
    /// Backend type tag (e.g., "SIMULATED")
    #[serde(rename = "type")]
    pub kind: String,
    /// Network address of the reader
    #[serde(default = "default_reader_address")]
    pub address: String,
    /// Transmit power preset
    #[serde(default = "default_power_level")]
    pub power_level: String,
    /// Whether this reader is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Backend-specific options (dynamic)
    #[serde(default)]
    pub options: toml::Table,
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory of the batch files
    pub path: PathBuf,
    /// Advertised retention in days; nothing is deleted by this crate
    pub retention_days: u32,
}

/// Status sampler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    /// Sampling period in milliseconds
    pub interval_ms: u64,
    /// Strength reported for a known antenna with no reads in the interval
    pub no_signal_floor_dbm: f64,
    /// Raw reads held between samples before the oldest are dropped
    pub sample_capacity: usize,
}

/// Bounded queue sizes between stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Raw reads waiting for the gating processor
    pub raw_capacity: usize,
    /// Batches waiting for the distribution router
    pub router_capacity: usize,
    /// Batches waiting for the store writer
    pub store_capacity: usize,
    /// Live events buffered per subscriber
    pub subscriber_capacity: usize,
}

// Default value functions
fn default_reader_address() -> String {
    "127.0.0.1".to_string()
}

fn default_power_level() -> String {
    "HIGH".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_unit_id() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn default_storage_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rfid_ingest")
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "rfid-ingest".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            unit_id: default_unit_id(),
            timezone: "AUTO".to_string(),
        }
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            gating: Some(3.0),
            gating_style: GatingStyle::Reader,
            readers: Vec::new(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            retention_days: 180,
        }
    }
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            no_signal_floor_dbm: -100.0,
            sample_capacity: 100_000,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            raw_capacity: 100_000,
            router_capacity: 100,
            store_capacity: 100,
            subscriber_capacity: 256,
        }
    }
}

/// Accepts a number or numeric string; anything else reads as "not configured".
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Float(f64),
        Int(i64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Seconds::deserialize(deserializer)? {
        Seconds::Float(secs) => Some(secs),
        Seconds::Int(secs) => Some(secs as f64),
        Seconds::Text(text) => text.trim().parse::<f64>().ok(),
        Seconds::Other(_) => None,
    })
}

fn lenient_style<'de, D>(deserializer: D) -> Result<GatingStyle, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer).unwrap_or_default();
    Ok(GatingStyle::from_config(&text))
}

impl Settings {
    /// Load settings from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `RFID_INGEST_`.
    /// Example: `RFID_INGEST_READER__GATING_STYLE=Box`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RFID_INGEST_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Parse settings from TOML text without consulting the environment
    pub fn from_toml(text: &str) -> AppResult<Self> {
        let settings = Figment::new().merge(Toml::string(text)).extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(IngestError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        self.application.log_format.parse::<OutputFormat>()?;

        let queues = [
            ("raw_capacity", self.queues.raw_capacity),
            ("router_capacity", self.queues.router_capacity),
            ("store_capacity", self.queues.store_capacity),
            ("subscriber_capacity", self.queues.subscriber_capacity),
            ("sample_capacity", self.status.sample_capacity),
        ];
        for (name, capacity) in queues {
            if capacity == 0 {
                return Err(IngestError::Configuration(format!(
                    "Invalid {name} 0. Queues must hold at least one entry"
                )));
            }
        }

        if self.status.interval_ms == 0 {
            return Err(IngestError::Configuration(
                "Invalid status interval_ms 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for reader in &self.reader.readers {
            if !ids.insert(reader.id) {
                return Err(IngestError::Configuration(format!(
                    "Duplicate reader ID: {}",
                    reader.id
                )));
            }
        }

        Ok(())
    }

    /// Gating window, with the 3 s default applied
    pub fn gating_window(&self) -> Duration {
        resolve_window(self.reader.gating)
    }

    /// Get all enabled readers
    pub fn enabled_readers(&self) -> Vec<&ReaderDefinition> {
        self.reader.readers.iter().filter(|r| r.enabled).collect()
    }

    /// Clock used for locally generated timestamps
    pub fn clock_zone(&self) -> ClockZone {
        ClockZone::from_config(&self.application.timezone)
    }
}

/// Zone the unit reports wall-clock times in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockZone {
    /// The host's local zone
    Local,
    /// A fixed offset from UTC
    Fixed(FixedOffset),
}

impl ClockZone {
    /// `AUTO` or empty selects the host zone; unparseable values fall back to it.
    pub fn from_config(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return ClockZone::Local;
        }
        match parse_offset(trimmed) {
            Ok(offset) => ClockZone::Fixed(offset),
            Err(_) => {
                tracing::error!(timezone = trimmed, "Unable to parse timezone, using system zone");
                ClockZone::Local
            }
        }
    }

    /// Current time in this zone
    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            ClockZone::Local => Local::now().fixed_offset(),
            ClockZone::Fixed(offset) => Utc::now().with_timezone(offset),
        }
    }

    /// Human-readable zone label
    pub fn label(&self) -> String {
        match self {
            ClockZone::Local => format!("local ({})", format_offset(*Local::now().offset())),
            ClockZone::Fixed(offset) => format_offset(*offset),
        }
    }
}

/// One published configuration version.
#[derive(Debug)]
pub struct VersionedSettings {
    /// Monotonic version, starting at 1
    pub version: u64,
    /// Settings of this version
    pub settings: Settings,
}

/// Shared, versioned access to the live configuration.
///
/// Readers take the current version; writers publish a replacement. A published
/// version is never mutated, so a component that read version N at the top of its
/// cycle works with a consistent view until the next cycle.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<VersionedSettings>>>,
}

impl ConfigHandle {
    /// Publish `settings` as version 1
    pub fn new(settings: Settings) -> Self {
        let (tx, _) = watch::channel(Arc::new(VersionedSettings {
            version: 1,
            settings,
        }));
        Self { tx: Arc::new(tx) }
    }

    /// Latest published version
    pub fn current(&self) -> Arc<VersionedSettings> {
        self.tx.borrow().clone()
    }

    /// Publish a new version derived from the current one; returns its number
    pub fn update(&self, apply: impl FnOnce(&mut Settings)) -> u64 {
        let mut published = 0;
        self.tx.send_modify(|current| {
            let mut settings = current.settings.clone();
            apply(&mut settings);
            published = current.version + 1;
            *current = Arc::new(VersionedSettings {
                version: published,
                settings,
            });
        });
        tracing::info!(version = published, "Published configuration");
        published
    }

    /// Re-read and validate a settings file, then publish it
    ///
    /// On any fault the current version stays in effect.
    pub fn reload_from<P: AsRef<Path>>(&self, path: P) -> AppResult<u64> {
        let settings = Settings::load_from(path)?;
        settings.validate()?;
        Ok(self.update(|current| *current = settings))
    }

    /// Watch for new versions
    pub fn subscribe(&self) -> watch::Receiver<Arc<VersionedSettings>> {
        self.tx.subscribe()
    }
}
