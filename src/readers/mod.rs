//! Reader backends.
//!
//! The pipeline never talks to a vendor SDK. Each backend implements [`RfidReader`] and
//! hands its detections to a [`ReadIntake`]; backends are selected by the `type` tag of
//! a reader definition through an explicit [`ReaderRegistry`] built at startup.
//!
//! # Example
//! ```no_run
//! use rfid_ingest::config::Settings;
//! use rfid_ingest::readers::{ReaderRegistry, ReaderSet};
//!
//! let settings = Settings::load()?;
//! let registry = ReaderRegistry::with_builtin();
//! let (readers, failures) = ReaderSet::from_settings(&settings, &registry);
//! assert!(failures.is_empty());
//! println!("{} readers configured", readers.len());
//! # Ok::<(), rfid_ingest::error::IngestError>(())
//! ```

pub mod simulated;

pub use simulated::SimulatedReader;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{ReaderDefinition, Settings};
use crate::error::{AppResult, IngestError};
use crate::tags::intake::ReadIntake;

/// Point-in-time description of one reader, as shown in status snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderStatus {
    /// Reader id
    pub id: u32,
    /// Display name
    pub name: String,
    /// Backend type tag
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the reader is currently inventorying
    pub reading: bool,
    /// Whether the backend has a live session
    pub connected: bool,
    /// Backend-specific status text
    pub status: String,
    /// Status text per antenna port
    pub port_status: BTreeMap<u16, String>,
}

/// A source of raw tag detections.
#[async_trait]
pub trait RfidReader: Send + Sync {
    /// Id stamped on every read this reader produces
    fn id(&self) -> u32;

    /// Backend type tag
    fn kind(&self) -> &str;

    /// Whether the reader is currently inventorying
    fn is_reading(&self) -> bool;

    /// Whether the backend has a live session
    fn is_connected(&self) -> bool;

    /// Backend-specific status text
    fn status(&self) -> String;

    /// Status text per antenna port; these ports are the ones reported in status
    /// snapshots even while they see no tags
    fn antenna_status(&self) -> BTreeMap<u16, String>;

    /// Synchronize the reader's clock with the unit
    async fn set_clock(&self, now: DateTime<FixedOffset>) -> AppResult<()>;

    /// Begin delivering detections to `intake`
    async fn start_reading(&self, intake: ReadIntake) -> AppResult<()>;

    /// Stop delivering detections
    async fn stop_reading(&self) -> AppResult<()>;

    /// Status record for snapshots
    fn describe(&self) -> ReaderStatus {
        ReaderStatus {
            id: self.id(),
            name: format!("Reader {}", self.id()),
            kind: self.kind().to_string(),
            reading: self.is_reading(),
            connected: self.is_connected(),
            status: self.status(),
            port_status: self.antenna_status(),
        }
    }
}

/// Builds a reader from its definition.
pub type ReaderFactory =
    Box<dyn Fn(&ReaderDefinition) -> AppResult<Arc<dyn RfidReader>> + Send + Sync>;

/// Map from backend type tag to factory.
pub struct ReaderRegistry {
    factories: HashMap<String, ReaderFactory>,
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ReaderRegistry {
    /// Registry with no backends
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every backend shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(SimulatedReader::KIND, |definition| {
            let reader: Arc<dyn RfidReader> = Arc::new(SimulatedReader::from_definition(definition)?);
            Ok(reader)
        });
        registry
    }

    /// Register (or replace) the factory for a type tag; tags match case-insensitively
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ReaderDefinition) -> AppResult<Arc<dyn RfidReader>> + Send + Sync + 'static,
    {
        self.factories
            .insert(kind.to_ascii_uppercase(), Box::new(factory));
    }

    /// Registered type tags, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build the reader described by `definition`
    pub fn create(&self, definition: &ReaderDefinition) -> AppResult<Arc<dyn RfidReader>> {
        let factory = self
            .factories
            .get(&definition.kind.to_ascii_uppercase())
            .ok_or_else(|| IngestError::UnknownReaderType(definition.kind.clone()))?;
        factory(definition)
    }
}

/// The configured readers.
#[derive(Default)]
pub struct ReaderSet {
    readers: Vec<Arc<dyn RfidReader>>,
}

impl ReaderSet {
    /// Wrap already-built readers
    pub fn new(readers: Vec<Arc<dyn RfidReader>>) -> Self {
        Self { readers }
    }

    /// Build every enabled reader in `settings`.
    ///
    /// A reader that cannot be built is logged and left out; its error is returned
    /// alongside the readers that could.
    pub fn from_settings(settings: &Settings, registry: &ReaderRegistry) -> (Self, Vec<IngestError>) {
        let mut readers = Vec::new();
        let mut failures = Vec::new();

        for definition in settings.enabled_readers() {
            match registry.create(definition) {
                Ok(reader) => {
                    tracing::info!(reader = definition.id, kind = %definition.kind, address = %definition.address, "Reader configured");
                    readers.push(reader);
                }
                Err(err) => {
                    tracing::error!(reader = definition.id, kind = %definition.kind, error = %err, "Unable to configure reader");
                    failures.push(err);
                }
            }
        }

        (Self { readers }, failures)
    }

    /// Number of readers
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Whether no reader is configured
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Reader with the given id
    pub fn get(&self, id: u32) -> Option<&Arc<dyn RfidReader>> {
        self.readers.iter().find(|reader| reader.id() == id)
    }

    /// Whether any reader is inventorying
    pub fn is_reading(&self) -> bool {
        self.readers.iter().any(|reader| reader.is_reading())
    }

    /// Status of every reader, in configuration order
    pub fn statuses(&self) -> Vec<ReaderStatus> {
        self.readers.iter().map(|reader| reader.describe()).collect()
    }

    /// Set every reader's clock; failures are logged per reader
    pub async fn set_clocks(&self, now: DateTime<FixedOffset>) {
        for reader in &self.readers {
            if let Err(err) = reader.set_clock(now).await {
                tracing::warn!(reader = reader.id(), error = %err, "Unable to set reader clock");
            }
        }
    }

    /// Start every reader; failures are logged per reader
    pub async fn start_reading(&self, intake: &ReadIntake) {
        for reader in &self.readers {
            if let Err(err) = reader.start_reading(intake.clone()).await {
                tracing::error!(reader = reader.id(), error = %err, "Unable to start reader");
            }
        }
    }

    /// Stop every reader, returning the errors of those that failed
    pub async fn stop_reading(&self) -> Vec<IngestError> {
        let mut failures = Vec::new();
        for reader in &self.readers {
            if let Err(err) = reader.stop_reading().await {
                tracing::error!(reader = reader.id(), error = %err, "Unable to stop reader");
                failures.push(err);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: u32, kind: &str) -> ReaderDefinition {
        ReaderDefinition {
            id,
            kind: kind.to_string(),
            address: "127.0.0.1".to_string(),
            power_level: "HIGH".to_string(),
            enabled: true,
            options: toml::Table::new(),
        }
    }

    #[test]
    fn builtin_registry_knows_the_simulator() {
        let registry = ReaderRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec!["SIMULATED".to_string()]);

        let reader = registry.create(&definition(4, "simulated")).unwrap();
        assert_eq!(reader.id(), 4);
        assert_eq!(reader.kind(), "SIMULATED");
    }

    #[test]
    fn unknown_type_fails_only_that_reader() {
        let mut settings = Settings::default();
        settings.reader.readers = vec![definition(1, "SIMULATED"), definition(2, "IMPINJ")];

        let (readers, failures) = ReaderSet::from_settings(&settings, &ReaderRegistry::with_builtin());
        assert_eq!(readers.len(), 1);
        assert!(readers.get(1).is_some());
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], IngestError::UnknownReaderType(kind) if kind == "IMPINJ"));
    }

    #[test]
    fn disabled_readers_are_skipped() {
        let mut settings = Settings::default();
        let mut disabled = definition(2, "SIMULATED");
        disabled.enabled = false;
        settings.reader.readers = vec![definition(1, "SIMULATED"), disabled];

        let (readers, failures) = ReaderSet::from_settings(&settings, &ReaderRegistry::with_builtin());
        assert!(failures.is_empty());
        assert_eq!(readers.len(), 1);
    }

    #[test]
    fn statuses_describe_each_reader() {
        let registry = ReaderRegistry::with_builtin();
        let readers = ReaderSet::new(vec![registry.create(&definition(3, "SIMULATED")).unwrap()]);
        let statuses = readers.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "Reader 3");
        assert!(!statuses[0].reading);
        assert_eq!(statuses[0].port_status.len(), 4);
    }
}
