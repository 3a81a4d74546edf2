//! Gating: collapsing repeated detections within one window.
//!
//! A tag crossing a mat is seen dozens of times per second on every antenna that can
//! hear it. Within one gating window every raw read is mapped to a [`GatingKey`] chosen
//! by the configured [`GatingStyle`], and only the strongest read per key survives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::read::{Epc, TagRead};
use crate::error::IngestError;

/// Window used when the configured gating is absent, zero or unusable.
pub const DEFAULT_GATING: Duration = Duration::from_millis(3000);

/// Granularity at which detections count as "the same".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GatingStyle {
    /// Strongest read per tag per reader.
    #[default]
    Reader,
    /// Strongest read per tag per antenna.
    Antenna,
    /// Strongest read per tag across every reader.
    Box,
}

impl GatingStyle {
    /// Resolve a configured style, falling back to [`GatingStyle::Reader`].
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(style = value, "Unknown gating style, using Reader");
            GatingStyle::Reader
        })
    }

    /// Name as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            GatingStyle::Reader => "Reader",
            GatingStyle::Antenna => "Antenna",
            GatingStyle::Box => "Box",
        }
    }

    /// Grouping key of `read` under this style.
    pub fn key(&self, read: &TagRead) -> GatingKey {
        let (reader, antenna) = match self {
            GatingStyle::Reader => (Some(read.reader_id()), None),
            GatingStyle::Antenna => (Some(read.reader_id()), Some(read.antenna())),
            GatingStyle::Box => (None, None),
        };
        GatingKey {
            epc: read.epc(),
            reader,
            antenna,
        }
    }
}

impl FromStr for GatingStyle {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reader" => Ok(GatingStyle::Reader),
            "antenna" => Ok(GatingStyle::Antenna),
            "box" => Ok(GatingStyle::Box),
            _ => Err(IngestError::Configuration(format!(
                "Invalid gating style '{s}'. Must be one of: Reader, Antenna, Box"
            ))),
        }
    }
}

impl fmt::Display for GatingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a detection for de-duplication.
///
/// Ordered by tag, then reader, then antenna; that order also decides ties between
/// survivors sharing the same epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GatingKey {
    epc: Epc,
    reader: Option<u32>,
    antenna: Option<u16>,
}

/// Result of collapsing one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatedWindow {
    /// One read per distinct key, in key order.
    pub survivors: Vec<TagRead>,
    /// Survivor with the greatest epoch milliseconds.
    pub last_read: Option<TagRead>,
}

/// Keep the strongest read per key.
///
/// On equal signal strength the earliest arrival wins, so the outcome only depends on
/// arrival order when two reads of one key are indistinguishable by strength.
pub fn collapse(reads: impl IntoIterator<Item = TagRead>, style: GatingStyle) -> GatedWindow {
    let mut strongest: BTreeMap<GatingKey, TagRead> = BTreeMap::new();
    for read in reads {
        let key = style.key(&read);
        match strongest.get(&key) {
            Some(kept) if kept.rssi() >= read.rssi() => {}
            _ => {
                strongest.insert(key, read);
            }
        }
    }

    // Iterating in key order and replacing only on a strictly later epoch makes the
    // smallest key win ties.
    let mut last_read: Option<&TagRead> = None;
    for read in strongest.values() {
        if last_read.map_or(true, |last| read.epoch_millis() > last.epoch_millis()) {
            last_read = Some(read);
        }
    }
    let last_read = last_read.cloned();

    GatedWindow {
        survivors: strongest.into_values().collect(),
        last_read,
    }
}

/// Turn a configured gating in seconds into a window length.
pub fn resolve_window(seconds: Option<f64>) -> Duration {
    match seconds {
        Some(secs) if secs.is_finite() && secs > 0.0 => {
            let millis = (secs * 1000.0).round() as u64;
            if millis == 0 {
                DEFAULT_GATING
            } else {
                Duration::from_millis(millis)
            }
        }
        _ => DEFAULT_GATING,
    }
}
