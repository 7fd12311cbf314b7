//! UTC timestamp parsing and formatting.
//!
//! Wire timestamps are ISO-8601 with a trailing `Z`. Inputs are accepted
//! more leniently: explicit offsets (`+02:00` or `+0200`), bare datetimes
//! (assumed UTC), and numeric epochs in seconds or milliseconds.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde_json::Value;

/// Parse a JSON value into a UTC timestamp, or `None` when it does not look
/// like one. Never fails hard: a bad timestamp in caller data degrades to
/// "no time", not to a rejected request.
pub fn parse_utc_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_utc(raw),
        Value::Number(n) => {
            let mut stamp = n.as_f64()?;
            if stamp > 1_000_000_000_000.0 {
                stamp /= 1000.0;
            }
            Utc.timestamp_opt(stamp as i64, 0).single()
        }
        _ => None,
    }
}

/// Parse an ISO-8601 string into UTC.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // `+0000`-style offsets get a colon inserted so the RFC 3339 parser
    // accepts them.
    let mut normalized = raw.to_owned();
    if normalized.ends_with('Z') || normalized.ends_with('z') {
        normalized.truncate(normalized.len() - 1);
        normalized.push_str("+00:00");
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 5 {
        let sign_at = bytes.len() - 5;
        if (bytes[sign_at] == b'+' || bytes[sign_at] == b'-')
            && bytes[bytes.len() - 3] != b':'
            && bytes[sign_at..].iter().skip(1).all(|b| b.is_ascii_digit())
        {
            normalized.insert(normalized.len() - 2, ':');
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Bare datetimes are taken as UTC.
    for fmt in &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Format a UTC timestamp as ISO-8601 with a trailing `Z`, to the second.
pub fn to_iso_z(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Truncate to the containing hour. Cache bucket for weather and forecast
/// lookups.
pub fn floor_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0)
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

/// Truncate to the containing 5-minute bucket. Cache bucket for traffic
/// status lookups.
pub fn floor_to_5min(dt: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = dt
        .with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt);
    trimmed - Duration::minutes((trimmed.minute() % 5) as i64)
}

/// A whole-request deadline. Work that can be cut short checks `expired`
/// between steps; in-flight calls are bounded with `remaining`.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<std::time::Instant>,
}

impl Deadline {
    pub fn none() -> Deadline {
        Deadline { at: None }
    }

    pub fn after(duration: std::time::Duration) -> Deadline {
        Deadline {
            at: Some(std::time::Instant::now() + duration),
        }
    }

    pub fn expired(&self) -> bool {
        self.at.map_or(false, |at| std::time::Instant::now() >= at)
    }

    /// Time left, `None` when unbounded. An expired deadline reports zero.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.at
            .map(|at| at.saturating_duration_since(std::time::Instant::now()))
    }
}
