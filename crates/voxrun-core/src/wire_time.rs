//! Lenient timestamp decoding.
//!
//! The queue service emits ISO-8601 timestamps without an offset
//! (`2025-01-01T12:00:00.123456`), which are UTC. RFC 3339 values are
//! accepted as well.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::task::DEFAULT_RETENTION_DAYS;

fn parse(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn decode<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{s}'"))),
    }
}

pub fn optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    decode(deserializer)
}

pub fn or_now<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(decode(deserializer)?.unwrap_or_else(Utc::now))
}

pub fn or_retention<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(decode(deserializer)?.unwrap_or_else(default_expiry))
}

pub fn default_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::days(DEFAULT_RETENTION_DAYS)
}
