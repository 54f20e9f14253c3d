//! Timestamp canonicalization for payloads crossing the sync boundary.
//!
//! The remote side emits ISO 8601 timestamps that sometimes lack a zone
//! designator; those are known to be UTC. Everything entering the cache goes
//! through [`normalize`] so no naive wall-clock value survives past the
//! mapping step.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::{SyncResult, TetherError};

/// Raw timestamp input: either text from the wire or an instant that was
/// already parsed upstream.
#[derive(Debug, Clone)]
pub enum TimestampInput {
    Text(String),
    Instant(DateTime<Utc>),
}

impl From<&str> for TimestampInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for TimestampInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<DateTime<Utc>> for TimestampInput {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Instant(dt)
    }
}

impl From<DateTime<FixedOffset>> for TimestampInput {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Self::Instant(dt.with_timezone(&Utc))
    }
}

/// Canonicalize a timestamp into an unambiguous UTC instant.
///
/// Strings with an explicit `Z` or `±HH:MM`/`±HHMM` offset keep that offset's
/// meaning; strings without one get `Z` appended before parsing. Instants
/// pass through unchanged, which makes the operation idempotent. Unparseable
/// input is an error — never coerced to "now".
pub fn normalize(input: impl Into<TimestampInput>) -> SyncResult<DateTime<Utc>> {
    match input.into() {
        TimestampInput::Instant(dt) => Ok(dt),
        TimestampInput::Text(raw) => {
            let trimmed = raw.trim();
            let candidate = if has_explicit_offset(trimmed) {
                trimmed.to_string()
            } else {
                format!("{trimmed}Z")
            };
            parse_instant(&candidate)
                .ok_or_else(|| TetherError::InvalidTimestamp(raw.to_string()))
        }
    }
}

/// Rewrite the named timestamp fields of a JSON object — or of every object
/// in a JSON array — to canonical RFC 3339 UTC. Non-string and absent fields
/// are left alone; malformed timestamp strings propagate `InvalidTimestamp`.
pub fn normalize_timestamp_fields(value: &mut Value, fields: &[&str]) -> SyncResult<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                normalize_timestamp_fields(item, fields)?;
            }
        }
        Value::Object(map) => {
            for field in fields {
                if let Some(slot) = map.get_mut(*field) {
                    if let Some(raw) = slot.as_str() {
                        let instant = normalize(raw)?;
                        *slot = Value::String(instant.to_rfc3339());
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// True when the string carries its own zone designator: a trailing `Z` or a
/// `±HH:MM`/`±HHMM` offset after the time portion.
fn has_explicit_offset(s: &str) -> bool {
    if s.ends_with('Z') || s.ends_with('z') {
        return true;
    }
    let Some(time_start) = s.find(['T', 't']) else {
        return false;
    };
    let time = &s[time_start + 1..];
    let Some(sign) = time.rfind(['+', '-']) else {
        return false;
    };
    let tail = &time[sign + 1..];
    match tail.len() {
        4 => tail.bytes().all(|b| b.is_ascii_digit()),
        5 => {
            let bytes = tail.as_bytes();
            bytes[2] == b':'
                && tail
                    .bytes()
                    .enumerate()
                    .all(|(i, b)| i == 2 || b.is_ascii_digit())
        }
        _ => false,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let (body, offset_minutes) = split_offset(s)?;
    let naive = parse_naive(body)?;
    let utc = naive - chrono::Duration::minutes(offset_minutes);
    Some(DateTime::<Utc>::from_naive_utc_and_offset(utc, Utc))
}

fn split_offset(s: &str) -> Option<(&str, i64)> {
    if let Some(body) = s.strip_suffix(['Z', 'z']) {
        return Some((body, 0));
    }
    let time_start = s.find(['T', 't'])? + 1;
    let time = &s[time_start..];
    let sign = time.rfind(['+', '-'])?;
    let split = time_start + sign;
    let minutes = parse_offset_minutes(&s[split..])?;
    Some((&s[..split], minutes))
}

fn parse_offset_minutes(offset: &str) -> Option<i64> {
    let sign = match offset.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits = &offset[1..];
    let (hours, minutes) = match digits.len() {
        4 => (digits.get(..2)?, digits.get(2..)?),
        5 if digits.as_bytes()[2] == b':' => (digits.get(..2)?, digits.get(3..)?),
        _ => return None,
    };
    let hours: i64 = hours.parse().ok()?;
    let minutes: i64 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 60 + minutes))
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 3] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}
