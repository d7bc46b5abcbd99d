//! Interval and timestamp primitives
//!
//! Both are unsigned millisecond counts since the Unix epoch. Interval
//! carries parse/format helpers for the `(\d+(y|M|w|d|h|m|s|ms))+` grammar;
//! timestamp carries floor/ceil-to-interval alignment. Week alignment uses
//! a fixed epoch offset because the epoch itself falls on a Thursday.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};

pub type Interval = u64;
pub type Timestamp = u64;

pub const SEC_MS: Interval = 1_000;
pub const MIN_MS: Interval = 60_000;
pub const HOUR_MS: Interval = 3_600_000;
pub const DAY_MS: Interval = 86_400_000;
pub const WEEK_MS: Interval = 604_800_000;
pub const MONTH_MS: Interval = 2_629_746_000;
pub const YEAR_MS: Interval = 31_556_952_000;

// Epoch (1970-01-01) was a Thursday; shift so weeks align to Monday.
const WEEK_OFFSET_MS: Timestamp = 345_600_000;

// Ordered by factor descending; `M` before `m` matters for parsing.
const INTERVAL_FACTORS: [(&str, Interval); 8] = [
    ("y", YEAR_MS),
    ("M", MONTH_MS),
    ("w", WEEK_MS),
    ("d", DAY_MS),
    ("h", HOUR_MS),
    ("m", MIN_MS),
    ("s", SEC_MS),
    ("ms", 1),
];

/// Formats an interval as a compact string, e.g. `5_400_000` -> `"1h30m"`.
pub fn format_interval(interval: Interval) -> String {
    let mut result = String::new();
    let mut remainder = interval;
    for (letter, factor) in INTERVAL_FACTORS {
        let quotient = remainder / factor;
        remainder %= factor;
        if quotient > 0 {
            result.push_str(&format!("{quotient}{letter}"));
        }
        if remainder == 0 {
            break;
        }
    }
    if result.is_empty() {
        result.push_str("0ms");
    }
    result
}

/// Parses interval representations such as `"1d"`, `"15m"` or `"1h30m"`.
pub fn parse_interval(input: &str) -> Result<Interval> {
    let mut result = 0;
    let mut chars = input.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if !c.is_ascii_digit() {
            bail!("invalid interval {input:?}: expected digit at offset {start}");
        }
        while chars.peek().is_some_and(|(_, c)| c.is_ascii_digit()) {
            chars.next();
        }
        let digits_end = chars.peek().map(|&(i, _)| i).unwrap_or(input.len());
        while chars.peek().is_some_and(|(_, c)| c.is_alphabetic()) {
            chars.next();
        }
        let unit_end = chars.peek().map(|&(i, _)| i).unwrap_or(input.len());
        let value: u64 = input[start..digits_end].parse()?;
        let unit = &input[digits_end..unit_end];
        let Some(&(_, factor)) = INTERVAL_FACTORS.iter().find(|(u, _)| *u == unit) else {
            bail!("invalid interval {input:?}: unknown unit {unit:?}");
        };
        result += value * factor;
    }
    if result == 0 {
        bail!("invalid interval {input:?}: empty or zero");
    }
    Ok(result)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now() -> Timestamp {
    Utc::now().timestamp_millis() as Timestamp
}

pub fn format_timestamp(timestamp: Timestamp) -> String {
    to_datetime_utc(timestamp).to_rfc3339()
}

pub fn format_span(start: Timestamp, end: Timestamp) -> String {
    format!("{} - {}", format_timestamp(start), format_timestamp(end))
}

/// Parses an ISO-8601 timestamp; naive inputs are handled as UTC.
pub fn parse_timestamp(input: &str) -> Result<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis() as Timestamp);
    }
    let formats = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"];
    for format in formats {
        if let Ok(naive) = chrono::NaiveDate::parse_from_str(input, format) {
            let dt = naive.and_hms_opt(0, 0, 0).unwrap();
            return Ok(Utc.from_utc_datetime(&dt).timestamp_millis() as Timestamp);
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(input, format) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_millis() as Timestamp);
        }
    }
    bail!("invalid timestamp {input:?}")
}

fn to_datetime_utc(timestamp: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp as i64).unwrap()
}

/// Floors a timestamp to an interval boundary.
pub fn floor_timestamp(timestamp: Timestamp, interval: Interval) -> Timestamp {
    if interval < WEEK_MS {
        crate::math::floor_multiple(timestamp, interval)
    } else if interval == WEEK_MS {
        crate::math::floor_multiple_offset(timestamp, interval, WEEK_OFFSET_MS)
    } else if interval == MONTH_MS {
        let dt = to_datetime_utc(timestamp);
        Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis() as Timestamp
    } else {
        panic!("cannot floor to interval {}", format_interval(interval));
    }
}

/// Ceils a timestamp to an interval boundary.
pub fn ceil_timestamp(timestamp: Timestamp, interval: Interval) -> Timestamp {
    if interval < WEEK_MS {
        crate::math::ceil_multiple(timestamp, interval)
    } else if interval == WEEK_MS {
        crate::math::ceil_multiple_offset(timestamp, interval, WEEK_OFFSET_MS)
    } else if interval == MONTH_MS {
        let floored = floor_timestamp(timestamp, interval);
        if floored == timestamp {
            return timestamp;
        }
        let dt = to_datetime_utc(floored) + Months::new(1);
        dt.timestamp_millis() as Timestamp
    } else {
        panic!("cannot ceil to interval {}", format_interval(interval));
    }
}

/// Serde helper for interval fields accepting either raw milliseconds or
/// the `"1h30m"` grammar; always serializes to the readable form.
pub mod serde_interval {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_interval, parse_interval, Interval};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        interval: &Interval,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_interval(*interval))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Interval, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Millis(ms) => Ok(ms),
            Repr::Text(text) => parse_interval(&text).map_err(serde::de::Error::custom),
        }
    }
}
