// src/ingest/normalize.rs
//! Raw backend document -> [`AlertRecord`].
//!
//! Sensor types disagree on field names, so every field has an ordered list
//! of places to look. Documents that lack a required field are rejected with
//! a reason; rejection is a value, never an error, and the ingest loop only
//! counts it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::ingest::types::RawEvent;
use crate::store::{AlertRecord, UNKNOWN_SENSOR};

const SOURCE_IP_FIELDS: [&str; 3] = ["src_ip", "src_ipaddr", "ip"];
const SENSOR_PATHS: [&[&str]; 3] = [&["sensor"], &["host", "name"], &["beat", "hostname"]];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rejection {
    MissingEventId,
    MissingSourceIp,
    MissingTimestamp,
    BadTimestamp,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingEventId => "missing_eventid",
            Self::MissingSourceIp => "missing_src_ip",
            Self::MissingTimestamp => "missing_timestamp",
            Self::BadTimestamp => "bad_timestamp",
        }
    }
}

pub fn normalize(raw: &RawEvent) -> Result<AlertRecord, Rejection> {
    let alert_type = text_at(raw, &["eventid"]).ok_or(Rejection::MissingEventId)?;

    let src_ip = SOURCE_IP_FIELDS
        .iter()
        .find_map(|f| text_at(raw, &[*f]))
        .ok_or(Rejection::MissingSourceIp)?;

    let ts = raw
        .get("@timestamp")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(Rejection::MissingTimestamp)?;
    let attack_time = parse_timestamp(ts).ok_or(Rejection::BadTimestamp)?;

    let sensor = SENSOR_PATHS
        .iter()
        .find_map(|path| text_at(raw, path))
        .unwrap_or_else(|| UNKNOWN_SENSOR.to_string());

    Ok(AlertRecord {
        alert_type,
        src_ip,
        sensor,
        attack_time,
    })
}

/// Parse an ISO-8601 date-time into UTC.
///
/// A trailing `Z` is rewritten to `+00:00` first. Values without an offset
/// are taken as UTC, and a bare date is midnight UTC. Anything else
/// unparseable yields `None`.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let fixed = match s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => s.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&fixed) {
        return Some(dt.with_timezone(&Utc));
    }
    // Space separator and compact offsets (`+0000`) show up in some shippers.
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M%:z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(&fixed, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&fixed, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(&fixed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Non-empty text at a nested object path. Numbers are rendered as text;
/// other JSON types count as absent.
fn text_at(raw: &Value, path: &[&str]) -> Option<String> {
    let mut cur = raw;
    for key in path {
        cur = cur.as_object()?.get(*key)?;
    }
    match cur {
        // blank values fall through; anything else is kept as sent
        Value::String(s) => (!s.trim().is_empty()).then(|| s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn full_cowrie_event() {
        let raw = json!({
            "eventid": "cowrie.login.failed",
            "src_ip": "203.0.113.7",
            "@timestamp": "2024-05-01T12:00:00.250Z",
            "host": { "name": "hive-01" }
        });
        let r = normalize(&raw).unwrap();
        assert_eq!(r.alert_type, "cowrie.login.failed");
        assert_eq!(r.src_ip, "203.0.113.7");
        assert_eq!(r.sensor, "hive-01");
        assert_eq!(r.attack_time_text(), "2024-05-01T12:00:00.250000+00:00");
    }

    #[test]
    fn ip_field_fallback_order() {
        let raw = json!({
            "eventid": "x", "@timestamp": "2024-05-01T12:00:00Z",
            "src_ipaddr": "198.51.100.2", "ip": "198.51.100.3"
        });
        assert_eq!(normalize(&raw).unwrap().src_ip, "198.51.100.2");

        let raw = json!({ "eventid": "x", "@timestamp": "2024-05-01T12:00:00Z", "ip": "198.51.100.3" });
        assert_eq!(normalize(&raw).unwrap().src_ip, "198.51.100.3");

        // empty string falls through to the next field
        let raw = json!({
            "eventid": "x", "@timestamp": "2024-05-01T12:00:00Z",
            "src_ip": "", "ip": "198.51.100.3"
        });
        assert_eq!(normalize(&raw).unwrap().src_ip, "198.51.100.3");
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        let t = parse_timestamp("2024-05-01T14:00:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn naive_timestamp_is_utc() {
        let t = parse_timestamp("2024-05-01T12:00:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn date_only_is_midnight_utc() {
        let t = parse_timestamp("2024-05-01").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

        let raw = json!({ "eventid": "x", "src_ip": "1.2.3.4", "@timestamp": "2024-05-01" });
        assert_eq!(
            normalize(&raw).unwrap().attack_time_text(),
            "2024-05-01T00:00:00.000000+00:00"
        );
    }

    #[test]
    fn padded_values_are_stored_as_sent() {
        let raw = json!({
            "eventid": " cowrie.login.failed",
            "src_ip": "203.0.113.7 ",
            "@timestamp": "2024-05-01T12:00:00Z",
            "sensor": "  ",
            "host": { "name": "hive-01\t" }
        });
        let r = normalize(&raw).unwrap();
        assert_eq!(r.alert_type, " cowrie.login.failed");
        assert_eq!(r.src_ip, "203.0.113.7 ");
        // whitespace-only sensor still falls through
        assert_eq!(r.sensor, "hive-01\t");
    }

    #[test]
    fn garbage_timestamps_rejected() {
        for s in ["yesterday", "2024-13-01T00:00:00Z", "2024-02-30", "1714564800", ""] {
            assert!(parse_timestamp(s).is_none(), "{s:?} should not parse");
        }
    }

    #[test]
    fn non_string_timestamp_is_missing() {
        let raw = json!({ "eventid": "x", "src_ip": "1.2.3.4", "@timestamp": 1714564800 });
        assert_eq!(normalize(&raw), Err(Rejection::MissingTimestamp));
    }

    #[test]
    fn rejection_labels_are_stable() {
        assert_eq!(Rejection::BadTimestamp.as_str(), "bad_timestamp");
        assert_eq!(Rejection::MissingSourceIp.as_str(), "missing_src_ip");
    }
}
