//! First-sighting notices for the operator.
//!
//! A tag is announced the first time it is seen and again whenever more than
//! [`QUIET_PERIOD`] has passed since its previous announcement, counted in whole
//! seconds: with the default 5 s, a tag is announced again after 6 s. Raw reads are
//! used, so the notice fires before the gating window closes.

use std::collections::HashMap;
use std::time::Duration;

use super::read::{Epc, TagRead};

/// Silence after which a tag is announced again.
pub const QUIET_PERIOD: Duration = Duration::from_secs(5);

/// Per-tag announcement state.
#[derive(Debug)]
pub struct SightingTracker {
    announced: HashMap<Epc, i64>,
    quiet_secs: i64,
}

impl Default for SightingTracker {
    fn default() -> Self {
        Self::new(QUIET_PERIOD)
    }
}

impl SightingTracker {
    /// Tracker announcing again after `quiet` of silence
    pub fn new(quiet: Duration) -> Self {
        Self {
            announced: HashMap::new(),
            quiet_secs: i64::try_from(quiet.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Record `read`; returns true when it should be announced.
    pub fn observe(&mut self, read: &TagRead) -> bool {
        let at = read.epoch_millis();
        match self.announced.get(&read.epc()) {
            Some(previous) if at.saturating_sub(*previous) / 1000 <= self.quiet_secs => false,
            _ => {
                self.announced.insert(read.epc(), at);
                true
            }
        }
    }

    /// Number of tags ever announced
    pub fn len(&self) -> usize {
        self.announced.len()
    }

    /// Whether nothing has been announced
    pub fn is_empty(&self) -> bool {
        self.announced.is_empty()
    }

    /// Forget every tag
    pub fn clear(&mut self) {
        self.announced.clear();
    }
}
