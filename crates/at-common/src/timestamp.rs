//! Canonical timestamp text
//!
//! Every timestamp the audit trail writes (document entries, canonical field
//! values, summary projections) uses the same UTC ISO-8601 form:
//! `2024-12-11T10:30:00Z`, with fractional seconds only when non-zero.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Format a timestamp in canonical form.
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 timestamp (any offset) into UTC.
pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s.trim()).map(|dt| dt.with_timezone(&Utc))
}

pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(ts))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

/// Serde helpers for `Option<DateTime<Utc>>`.
pub mod option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => serializer.serialize_some(&super::format(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_whole_seconds_have_no_fraction() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap();
        assert_eq!(format(&ts), "2024-12-11T10:30:00Z");
    }

    #[test]
    fn test_fraction_is_preserved() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let text = format(&ts);
        assert_eq!(text, "2024-12-11T10:30:00.123456Z");
        assert_eq!(parse(&text).unwrap(), ts);
    }

    #[test]
    fn test_parse_normalizes_offset_to_utc() {
        let parsed = parse("2024-12-11T12:30:00+02:00").unwrap();
        assert_eq!(format(&parsed), "2024-12-11T10:30:00Z");
    }
}
