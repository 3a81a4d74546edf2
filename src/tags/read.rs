//! Tag read record and its line encoding.
//!
//! A [`TagRead`] is produced once per antenna detection by a reader backend and, after
//! gating, becomes the canonical record that is persisted and broadcast. It is immutable
//! once constructed; all fields are private and validated on the way in.
//!
//! # Line encoding
//!
//! Each record encodes to one JSON object per line:
//!
//! ```text
//! {"chip":"4660","timestamp":"2023-11-14 17:13:20.123","reader":2,"antenna":1,"rssi":-41.5,"tz":"-05:00","epochMilli":1700000000123}
//! ```
//!
//! - `chip` is the tag identifier in decimal
//! - `timestamp` is the reader-local wall clock, millisecond precision
//! - `tz` is the offset of that wall clock (`Z` for UTC)
//!
//! Decoding is lenient in the same places older batch files need it: a missing `reader`
//! or `epochMilli` reads as zero and a missing `tz` as UTC.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SubsecRound, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, IngestError};

/// Wall-clock format used on disk and on the wire.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Electronic product code of a tag.
///
/// Held numerically so the hex form reported by readers and the decimal form used by
/// timing software always agree, whatever case or zero padding the reader used.
///
/// Codes are limited to 128 significant bits, which covers 96 and 128 bit EPC banks.
/// Longer codes are rejected with [`IngestError::InvalidTag`] and the reader logs and
/// skips the detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epc(u128);

impl Epc {
    /// Parse the hex form reported by a reader.
    pub fn from_hex(hex: &str) -> AppResult<Self> {
        let trimmed = hex.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(IngestError::InvalidTag(hex.to_string()));
        }
        u128::from_str_radix(digits, 16)
            .map(Epc)
            .map_err(|_| IngestError::InvalidTag(hex.to_string()))
    }

    /// Parse the decimal form stored in batch files.
    pub fn from_decimal(decimal: &str) -> AppResult<Self> {
        let trimmed = decimal.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IngestError::InvalidTag(decimal.to_string()));
        }
        u128::from_str(trimmed)
            .map(Epc)
            .map_err(|_| IngestError::InvalidTag(decimal.to_string()))
    }

    /// Lowercase hex without padding.
    pub fn hex(&self) -> String {
        format!("{:x}", self.0)
    }

    /// Decimal string.
    pub fn decimal(&self) -> String {
        self.0.to_string()
    }

    /// Raw numeric value.
    pub fn value(&self) -> u128 {
        self.0
    }
}

impl From<u128> for Epc {
    fn from(value: u128) -> Self {
        Epc(value)
    }
}

impl fmt::Display for Epc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One tag detection.
///
/// Used both for the raw per-antenna events a reader submits and for the canonical
/// records that survive gating; the two carry identical fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRead {
    epc: Epc,
    reader: u32,
    antenna: u16,
    rssi: f64,
    timestamp: NaiveDateTime,
    tz_offset: FixedOffset,
    epoch_millis: i64,
}

impl TagRead {
    /// Build a read from a zoned detection time.
    ///
    /// The epoch milliseconds are derived from `detected_at`.
    pub fn new(
        epc: Epc,
        reader: u32,
        antenna: u16,
        rssi: f64,
        detected_at: DateTime<FixedOffset>,
    ) -> AppResult<Self> {
        Self::from_parts(
            epc,
            reader,
            antenna,
            rssi,
            detected_at.naive_local(),
            *detected_at.offset(),
            detected_at.timestamp_millis(),
        )
    }

    /// Build a read from individually supplied fields.
    ///
    /// Readers whose firmware reports a separate monotonic epoch use this form. The
    /// wall-clock timestamp is truncated to whole milliseconds.
    pub fn from_parts(
        epc: Epc,
        reader: u32,
        antenna: u16,
        rssi: f64,
        timestamp: NaiveDateTime,
        tz_offset: FixedOffset,
        epoch_millis: i64,
    ) -> AppResult<Self> {
        if !rssi.is_finite() {
            return Err(IngestError::InvalidRead(format!(
                "signal strength must be finite, got {rssi}"
            )));
        }
        Ok(Self {
            epc,
            reader,
            antenna,
            rssi,
            timestamp: timestamp.trunc_subsecs(3),
            tz_offset,
            epoch_millis,
        })
    }

    /// Decode one line of a batch file.
    pub fn from_line(line: &str) -> AppResult<Self> {
        let wire: WireRead = serde_json::from_str(line)?;
        wire.try_into()
    }

    /// Encode as one line of a batch file, without the trailing newline.
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Tag identifier.
    pub fn epc(&self) -> Epc {
        self.epc
    }

    /// Tag identifier as lowercase hex.
    pub fn tag_hex(&self) -> String {
        self.epc.hex()
    }

    /// Tag identifier as decimal.
    pub fn tag_decimal(&self) -> String {
        self.epc.decimal()
    }

    /// Reader that produced the detection.
    pub fn reader_id(&self) -> u32 {
        self.reader
    }

    /// Antenna port on that reader.
    pub fn antenna(&self) -> u16 {
        self.antenna
    }

    /// Peak signal strength in dBm.
    pub fn rssi(&self) -> f64 {
        self.rssi
    }

    /// Reader-local wall-clock detection time.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Offset of the wall clock in [`timestamp`](Self::timestamp).
    pub fn tz_offset(&self) -> FixedOffset {
        self.tz_offset
    }

    /// Epoch milliseconds reported with the detection.
    pub fn epoch_millis(&self) -> i64 {
        self.epoch_millis
    }

    /// Detection time with its offset attached.
    pub fn detected_at(&self) -> Option<DateTime<FixedOffset>> {
        self.tz_offset
            .from_local_datetime(&self.timestamp)
            .single()
    }

    /// Formatted wall-clock timestamp as written to disk.
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    fn to_wire(&self) -> WireRead {
        WireRead {
            chip: self.epc.decimal(),
            timestamp: self.formatted_timestamp(),
            reader: self.reader,
            antenna: self.antenna,
            rssi: self.rssi,
            tz: format_offset(self.tz_offset),
            epoch_milli: self.epoch_millis,
        }
    }
}

impl fmt::Display for TagRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = serde_json::to_string(&self.to_wire()).map_err(|_| fmt::Error)?;
        f.write_str(&line)
    }
}

impl Serialize for TagRead {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TagRead {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireRead::deserialize(deserializer)?;
        TagRead::try_from(wire).map_err(serde::de::Error::custom)
    }
}

/// Sort reads by wall-clock time, keeping arrival order among equal timestamps.
pub fn sort_by_time(reads: &mut [TagRead]) {
    reads.sort_by_key(|read| read.timestamp);
}

/// Keep reads strictly after `from` and strictly before `to`; absent bounds are open.
pub fn filter_by_time(
    reads: impl IntoIterator<Item = TagRead>,
    from: Option<NaiveDateTime>,
    to: Option<NaiveDateTime>,
) -> Vec<TagRead> {
    reads
        .into_iter()
        .filter(|read| from.map_or(true, |from| read.timestamp > from))
        .filter(|read| to.map_or(true, |to| read.timestamp < to))
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRead {
    chip: String,
    timestamp: String,
    #[serde(default)]
    reader: u32,
    antenna: u16,
    rssi: f64,
    #[serde(default = "utc_label")]
    tz: String,
    #[serde(rename = "epochMilli", default)]
    epoch_milli: i64,
}

fn utc_label() -> String {
    "Z".to_string()
}

impl TryFrom<WireRead> for TagRead {
    type Error = IngestError;

    fn try_from(wire: WireRead) -> AppResult<Self> {
        let timestamp = NaiveDateTime::parse_from_str(&wire.timestamp, TIMESTAMP_FORMAT)?;
        TagRead::from_parts(
            Epc::from_decimal(&wire.chip)?,
            wire.reader,
            wire.antenna,
            wire.rssi,
            timestamp,
            parse_offset(&wire.tz)?,
            wire.epoch_milli,
        )
    }
}

/// Render an offset the way readers report it: `Z` for UTC, else `+HH:MM`.
pub fn format_offset(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    if seconds == 0 {
        return "Z".to_string();
    }
    let sign = if seconds < 0 { '-' } else { '+' };
    let abs = seconds.unsigned_abs();
    let (hours, minutes, secs) = (abs / 3600, (abs % 3600) / 60, abs % 60);
    if secs == 0 {
        format!("{sign}{hours:02}:{minutes:02}")
    } else {
        format!("{sign}{hours:02}:{minutes:02}:{secs:02}")
    }
}

/// Parse `Z`, `+HH`, `+HH:MM`, `+HHMM` or `+HH:MM:SS`.
pub fn parse_offset(text: &str) -> AppResult<FixedOffset> {
    let invalid = || IngestError::InvalidRead(format!("invalid timezone offset '{text}'"));
    let text = text.trim();
    if text.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match text.as_bytes().first() {
        Some(b'+') => (1, &text[1..]),
        Some(b'-') => (-1, &text[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let field = |range: std::ops::Range<usize>| -> AppResult<i32> {
        digits
            .get(range)
            .map_or(Ok(0), |s| s.parse::<i32>().map_err(|_| invalid()))
    };
    let seconds = match digits.len() {
        2 => field(0..2)? * 3600,
        4 => field(0..2)? * 3600 + field(2..4)? * 60,
        6 => field(0..2)? * 3600 + field(2..4)? * 60 + field(4..6)?,
        _ => return Err(invalid()),
    };
    FixedOffset::east_opt(sign * seconds).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> TagRead {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let at = offset
            .with_ymd_and_hms(2023, 11, 14, 17, 13, 20)
            .unwrap()
            + chrono::Duration::milliseconds(123);
        TagRead::new(Epc::from_hex("E2801160600002").unwrap(), 2, 1, -41.5, at).unwrap()
    }

    #[test]
    fn epc_hex_is_normalised() {
        let a = Epc::from_hex("00000ABC").unwrap();
        let b = Epc::from_hex("abc").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hex(), "abc");
        assert_eq!(a.decimal(), "2748");
        assert_eq!(Epc::from_decimal("2748").unwrap(), a);
    }

    #[test]
    fn epc_accepts_full_128_bit_codes() {
        let widest = Epc::from_hex(&"f".repeat(32)).unwrap();
        assert_eq!(widest.decimal(), u128::MAX.to_string());
        assert_eq!(Epc::from_decimal(&widest.decimal()).unwrap(), widest);
        // Padding beyond 32 digits is fine as long as the value fits
        assert_eq!(Epc::from_hex(&format!("0000{}", "f".repeat(32))).unwrap(), widest);
    }

    #[test]
    fn epc_rejects_garbage() {
        assert!(Epc::from_hex("").is_err());
        assert!(Epc::from_hex("xyz").is_err());
        // 33 significant hex digits do not fit
        assert!(Epc::from_hex(&format!("1{}", "0".repeat(32))).is_err());
        assert!(Epc::from_decimal("-5").is_err());
        assert!(matches!(
            Epc::from_hex(&"f".repeat(33)),
            Err(IngestError::InvalidTag(_))
        ));
        assert!(Epc::from_decimal("12a").is_err());
    }

    #[test]
    fn line_round_trips() {
        let read = sample();
        let line = read.to_line();
        assert!(line.contains("\"timestamp\":\"2023-11-14 17:13:20.123\""));
        assert!(line.contains("\"tz\":\"-05:00\""));
        assert!(line.contains("\"chip\":\"63754156856311810\""));
        assert_eq!(TagRead::from_line(&line).unwrap(), read);
    }

    #[test]
    fn epoch_is_derived_from_detection_time() {
        let read = sample();
        assert_eq!(read.epoch_millis(), 1_700_000_000_123);
        assert_eq!(read.detected_at().unwrap().timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn sub_millisecond_precision_is_dropped() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_nano_opt(7, 0, 0, 123_456_789)
            .unwrap();
        let read = TagRead::from_parts(
            Epc::from(1),
            1,
            1,
            -50.0,
            ts,
            FixedOffset::east_opt(0).unwrap(),
            0,
        )
        .unwrap();
        assert_eq!(read.formatted_timestamp(), "2024-05-01 07:00:00.123");
        assert_eq!(TagRead::from_line(&read.to_line()).unwrap(), read);
    }

    #[test]
    fn non_finite_rssi_is_rejected() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert!(TagRead::from_parts(Epc::from(1), 1, 1, f64::NAN, ts, utc, 0).is_err());
    }

    #[test]
    fn legacy_lines_default_missing_fields() {
        let line = r#"{"chip":"255","timestamp":"2023-01-02 03:04:05.006","antenna":3,"rssi":-60.0}"#;
        let read = TagRead::from_line(line).unwrap();
        assert_eq!(read.tag_hex(), "ff");
        assert_eq!(read.reader_id(), 0);
        assert_eq!(read.epoch_millis(), 0);
        assert_eq!(read.tz_offset().local_minus_utc(), 0);
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(TagRead::from_line("not json").is_err());
        assert!(TagRead::from_line(
            r#"{"chip":"1","timestamp":"yesterday","antenna":1,"rssi":-1.0}"#
        )
        .is_err());
        assert!(TagRead::from_line(
            r#"{"chip":"1","timestamp":"2023-01-02 03:04:05.006","antenna":1,"rssi":-1.0,"tz":"PST"}"#
        )
        .is_err());
    }

    #[test]
    fn offsets_parse_and_format() {
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+05:30").unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_offset("-0800").unwrap().local_minus_utc(), -28_800);
        assert_eq!(parse_offset("+02").unwrap().local_minus_utc(), 7_200);
        assert_eq!(format_offset(FixedOffset::east_opt(19_800).unwrap()), "+05:30");
        assert_eq!(format_offset(FixedOffset::west_opt(28_800).unwrap()), "-08:00");
        assert!(parse_offset("05:00").is_err());
    }

    #[test]
    fn sorting_is_stable_on_equal_timestamps() {
        let base = sample();
        let earlier = TagRead::from_parts(
            Epc::from(9),
            1,
            1,
            -70.0,
            base.timestamp() - chrono::Duration::seconds(5),
            base.tz_offset(),
            0,
        )
        .unwrap();
        let twin = TagRead::from_parts(
            Epc::from(7),
            1,
            1,
            -70.0,
            base.timestamp(),
            base.tz_offset(),
            0,
        )
        .unwrap();
        let mut reads = vec![base.clone(), twin.clone(), earlier.clone()];
        sort_by_time(&mut reads);
        assert_eq!(reads, vec![earlier, base, twin]);
    }

    #[test]
    fn time_filter_bounds_are_exclusive() {
        let read = sample();
        let ts = read.timestamp();
        let one = chrono::Duration::seconds(1);
        assert_eq!(filter_by_time(vec![read.clone()], Some(ts), None).len(), 0);
        assert_eq!(filter_by_time(vec![read.clone()], None, Some(ts)).len(), 0);
        assert_eq!(
            filter_by_time(vec![read.clone()], Some(ts - one), Some(ts + one)).len(),
            1
        );
        assert_eq!(filter_by_time(vec![read], None, None).len(), 1);
    }
}
