//! Custom error types for the ingestion pipeline.
//!
//! This module defines the primary error type, `IngestError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of faults the pipeline can run into, from configuration problems
//! to malformed persisted records and reader backend failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while extracting the settings file and
//!   environment overrides.
//! - **`Configuration`**: Semantic errors in otherwise parseable settings (duplicate reader
//!   ids, zero-sized queues). Caught by `Settings::validate`.
//! - **`Io`**: Wraps `std::io::Error` for batch file reads and writes.
//! - **`Json`** / **`Timestamp`** / **`InvalidTag`** / **`InvalidRead`**: Faults decoding or
//!   constructing a tag read. During store replay these are logged and the line skipped.
//! - **`UnknownReaderType`** / **`Reader`**: Reader backend registration and control faults.
//! - **`ChannelClosed`**: A worker queue was closed because the stage has shut down.
//!
//! None of these is fatal to a running pipeline; callers log and continue.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, IngestError>;

/// Every fault the ingestion pipeline can report.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed tag read record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("Invalid tag identifier '{0}'")]
    InvalidTag(String),

    #[error("Invalid tag read: {0}")]
    InvalidRead(String),

    #[error("Unknown reader type '{0}'")]
    UnknownReaderType(String),

    #[error("Reader {id} error: {message}")]
    Reader { id: u32, message: String },

    #[error("{0} queue is closed")]
    ChannelClosed(&'static str),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<IngestError>),
}

impl From<figment::Error> for IngestError {
    fn from(value: figment::Error) -> Self {
        IngestError::Config(Box::new(value))
    }
}

impl IngestError {
    /// Whether the pipeline keeps running normally after this fault.
    ///
    /// Only a closed queue means a stage is gone; everything else is localized to
    /// one record, one file or one reader.
    pub fn is_recoverable(&self) -> bool {
        match self {
            IngestError::ChannelClosed(_) => false,
            IngestError::ShutdownFailed(_) => false,
            _ => true,
        }
    }
}
