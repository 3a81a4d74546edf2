//! Tag reads and the stages they flow through.
//!
//! ```text
//! reader → ReadIntake ─┬→ GatingProcessor → TagRouter ─┬→ TagStore
//!                      │                               └→ LiveFeed
//!                      └→ StatusAggregator (sampling)
//! ```
//!
//! - **`read`**: the [`TagRead`] record and its line encoding.
//! - **`gating`**: grouping keys and the strongest-read collapse.
//! - **`intake`**: the submit handle readers call.
//! - **`processor`**: the windowing worker.
//! - **`router`**: ordered handoff to store and subscribers.
//! - **`store`**: one-file-per-batch persistence with replay.
//! - **`sighting`**: first-seen notices.

pub mod gating;
pub mod intake;
pub mod processor;
pub mod read;
pub mod router;
pub mod sighting;
pub mod store;

pub use gating::{collapse, GatedWindow, GatingKey, GatingStyle, DEFAULT_GATING};
pub use intake::ReadIntake;
pub use processor::GatingProcessor;
pub use read::{filter_by_time, sort_by_time, Epc, TagRead, TIMESTAMP_FORMAT};
pub use router::TagRouter;
pub use sighting::SightingTracker;
pub use store::{ReplayReport, StoreStats, TagStore};
