//! # RFID Ingest Core Library
//!
//! This crate takes the raw stream of tag detections produced by one or more RFID
//! readers, collapses repeated detections over a configurable gating window, persists
//! the surviving reads to a crash-tolerant batch store and fans them out to live
//! subscribers. A periodic status sampler reports activity and per-antenna signal
//! strength alongside.
//!
//! ## Crate Structure
//!
//! - **`config`**: Settings loaded with `figment` from TOML and `RFID_INGEST_*`
//!   environment variables, plus the versioned [`config::ConfigHandle`] running stages
//!   read from.
//! - **`error`**: The crate-wide `IngestError` enum.
//! - **`feed`**: Live fan-out of batches, status snapshots and sighting notices.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`pipeline`**: Builds and controls the whole pipeline; the surface an API layer
//!   drives.
//! - **`readers`**: The reader backend trait, its registry and the simulated backend.
//! - **`status`**: The status aggregator and its snapshot.
//! - **`tags`**: The tag read record, gating, the processor, router and store.

pub mod config;
pub mod error;
pub mod feed;
pub mod logging;
pub mod pipeline;
pub mod readers;
pub mod status;
pub mod tags;

pub use pipeline::Pipeline;
