//! Simulated Reader
//!
//! Software reader that emits random detections for a fixed tag population, used for
//! demos, the CLI and tests. It exercises the same intake path as a physical reader.
//!
//! # Options
//!
//! | key        | default                    | meaning                              |
//! |------------|----------------------------|--------------------------------------|
//! | `tags`     | 10                         | size of the tag population           |
//! | `base_tag` | `"e2801160600002000000"`   | hex id of the first tag              |
//! | `antennas` | 4                          | antenna ports, numbered from 1       |
//! | `rate_hz`  | 10.0                       | detections per second                |
//! | `rssi_min` | -75.0                      | weakest simulated signal (dBm)       |
//! | `rssi_max` | -35.0                      | strongest simulated signal (dBm)     |
//! | `seed`     | none                       | fixed RNG seed for repeatable output |

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RfidReader;
use crate::config::ReaderDefinition;
use crate::error::{AppResult, IngestError};
use crate::tags::intake::ReadIntake;
use crate::tags::{Epc, TagRead};

/// Shape of the simulated traffic
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationProfile {
    /// Size of the tag population
    pub tags: u32,
    /// Id of the first tag; the rest follow consecutively
    pub base_tag: Epc,
    /// Number of antenna ports
    pub antennas: u16,
    /// Detections per second
    pub rate_hz: f64,
    /// Weakest simulated signal in dBm
    pub rssi_min: f64,
    /// Strongest simulated signal in dBm
    pub rssi_max: f64,
    /// Fixed RNG seed
    pub seed: Option<u64>,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            tags: 10,
            base_tag: Epc::from(0xe280_1160_6000_0200_0000u128),
            antennas: 4,
            rate_hz: 10.0,
            rssi_min: -75.0,
            rssi_max: -35.0,
            seed: None,
        }
    }
}

struct Session {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Reader of type `SIMULATED`
pub struct SimulatedReader {
    id: u32,
    address: String,
    profile: SimulationProfile,
    clock: Arc<Mutex<Option<FixedOffset>>>,
    session: Mutex<Option<Session>>,
}

impl SimulatedReader {
    /// Type tag of this backend
    pub const KIND: &'static str = "SIMULATED";

    /// Create a reader with an explicit profile
    pub fn new(id: u32, profile: SimulationProfile) -> Self {
        Self {
            id,
            address: "simulated".to_string(),
            profile,
            clock: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
        }
    }

    /// Create a reader from its configuration entry
    pub fn from_definition(definition: &ReaderDefinition) -> AppResult<Self> {
        let profile = parse_profile(definition.id, &definition.options)?;
        let mut reader = Self::new(definition.id, profile);
        reader.address = definition.address.clone();
        Ok(reader)
    }

    /// Traffic profile
    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    /// Network address from configuration (informational)
    pub fn address(&self) -> &str {
        &self.address
    }
}

fn invalid(id: u32, message: String) -> IngestError {
    IngestError::Reader { id, message }
}

fn parse_profile(id: u32, options: &toml::Table) -> AppResult<SimulationProfile> {
    let mut profile = SimulationProfile::default();

    let float = |key: &str| -> AppResult<Option<f64>> {
        match options.get(key) {
            None => Ok(None),
            Some(toml::Value::Float(value)) => Ok(Some(*value)),
            Some(toml::Value::Integer(value)) => Ok(Some(*value as f64)),
            Some(other) => Err(invalid(id, format!("option '{key}' must be a number, got {other}"))),
        }
    };
    let integer = |key: &str| -> AppResult<Option<i64>> {
        match options.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(value)) => Ok(Some(*value)),
            Some(other) => Err(invalid(id, format!("option '{key}' must be an integer, got {other}"))),
        }
    };

    if let Some(tags) = integer("tags")? {
        profile.tags = u32::try_from(tags)
            .ok()
            .filter(|tags| *tags > 0)
            .ok_or_else(|| invalid(id, format!("option 'tags' must be positive, got {tags}")))?;
    }
    if let Some(antennas) = integer("antennas")? {
        profile.antennas = u16::try_from(antennas)
            .ok()
            .filter(|antennas| *antennas > 0)
            .ok_or_else(|| invalid(id, format!("option 'antennas' must be positive, got {antennas}")))?;
    }
    if let Some(rate) = float("rate_hz")? {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(invalid(id, format!("option 'rate_hz' must be positive, got {rate}")));
        }
        profile.rate_hz = rate;
    }
    if let Some(min) = float("rssi_min")? {
        profile.rssi_min = min;
    }
    if let Some(max) = float("rssi_max")? {
        profile.rssi_max = max;
    }
    if !(profile.rssi_min.is_finite() && profile.rssi_max.is_finite())
        || profile.rssi_min > profile.rssi_max
    {
        return Err(invalid(
            id,
            format!(
                "signal range {}..{} is not valid",
                profile.rssi_min, profile.rssi_max
            ),
        ));
    }
    if let Some(seed) = integer("seed")? {
        profile.seed = Some(seed as u64);
    }
    match options.get("base_tag") {
        None => {}
        Some(toml::Value::String(hex)) => profile.base_tag = Epc::from_hex(hex)?,
        Some(other) => {
            return Err(invalid(id, format!("option 'base_tag' must be a hex string, got {other}")))
        }
    }

    Ok(profile)
}

fn reader_now(clock: &Mutex<Option<FixedOffset>>) -> DateTime<FixedOffset> {
    match *clock.lock() {
        Some(offset) => Utc::now().with_timezone(&offset),
        None => Local::now().fixed_offset(),
    }
}

async fn run_simulation(
    id: u32,
    profile: SimulationProfile,
    clock: Arc<Mutex<Option<FixedOffset>>>,
    intake: ReadIntake,
    cancel: CancellationToken,
) {
    let mut rng = match profile.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / profile.rate_hz));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(reader = id, rate_hz = profile.rate_hz, tags = profile.tags, "Simulated reader started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let offset = u128::from(rng.gen_range(0..profile.tags));
        let epc = Epc::from(profile.base_tag.value().wrapping_add(offset));
        let antenna = rng.gen_range(1..=profile.antennas);
        let rssi = if profile.rssi_min < profile.rssi_max {
            rng.gen_range(profile.rssi_min..profile.rssi_max)
        } else {
            profile.rssi_min
        };

        let read = match TagRead::new(epc, id, antenna, rssi, reader_now(&clock)) {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(reader = id, error = %err, "Discarding simulated read");
                continue;
            }
        };
        if let Err(err) = intake.submit(read).await {
            tracing::info!(reader = id, error = %err, "Intake closed, simulated reader stopping");
            break;
        }
    }
    tracing::info!(reader = id, "Simulated reader stopped");
}

#[async_trait]
impl RfidReader for SimulatedReader {
    fn id(&self) -> u32 {
        self.id
    }

    fn kind(&self) -> &str {
        Self::KIND
    }

    fn is_reading(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |session| !session.worker.is_finished())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn status(&self) -> String {
        if self.is_reading() {
            "Reading".to_string()
        } else {
            "Idle".to_string()
        }
    }

    fn antenna_status(&self) -> BTreeMap<u16, String> {
        (1..=self.profile.antennas)
            .map(|port| (port, "Connected".to_string()))
            .collect()
    }

    async fn set_clock(&self, now: DateTime<FixedOffset>) -> AppResult<()> {
        *self.clock.lock() = Some(*now.offset());
        tracing::debug!(reader = self.id, time = %now, "Simulated reader clock set");
        Ok(())
    }

    async fn start_reading(&self, intake: ReadIntake) -> AppResult<()> {
        let mut session = self.session.lock();
        if session
            .as_ref()
            .map_or(false, |running| !running.worker.is_finished())
        {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_simulation(
            self.id,
            self.profile.clone(),
            Arc::clone(&self.clock),
            intake,
            cancel.clone(),
        ));
        *session = Some(Session { cancel, worker });
        Ok(())
    }

    async fn stop_reading(&self) -> AppResult<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            session.worker.await.map_err(|err| IngestError::Reader {
                id: self.id,
                message: format!("simulation task failed: {err}"),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(text: &str) -> toml::Table {
        text.parse::<toml::Table>().unwrap()
    }

    #[test]
    fn default_profile_when_no_options() {
        let profile = parse_profile(1, &toml::Table::new()).unwrap();
        assert_eq!(profile, SimulationProfile::default());
    }

    #[test]
    fn options_override_profile() {
        let profile = parse_profile(
            1,
            &options("tags = 3\nantennas = 2\nrate_hz = 100\nbase_tag = \"0x10\"\nseed = 7\n"),
        )
        .unwrap();
        assert_eq!(profile.tags, 3);
        assert_eq!(profile.antennas, 2);
        assert_eq!(profile.rate_hz, 100.0);
        assert_eq!(profile.base_tag, Epc::from(16));
        assert_eq!(profile.seed, Some(7));
    }

    #[test]
    fn bad_options_are_reader_errors() {
        for text in [
            "tags = 0",
            "rate_hz = -1.0",
            "antennas = \"four\"",
            "rssi_min = -20.0\nrssi_max = -60.0",
            "base_tag = 5",
        ] {
            assert!(
                matches!(parse_profile(9, &options(text)), Err(IngestError::Reader { id: 9, .. })),
                "accepted {text}"
            );
        }
    }

    #[tokio::test]
    async fn set_clock_pins_the_reported_offset() {
        let reader = SimulatedReader::new(1, SimulationProfile::default());
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        reader
            .set_clock(Utc::now().with_timezone(&offset))
            .await
            .unwrap();
        assert_eq!(*reader_now(&reader.clock).offset(), offset);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let reader = SimulatedReader::new(1, SimulationProfile::default());
        assert!(!reader.is_reading());
        tokio_test::assert_ok!(tokio_test::block_on(reader.stop_reading()));
        assert_eq!(reader.status(), "Idle");
    }
}
