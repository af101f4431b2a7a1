//! Serde helpers for persisted timestamps
//!
//! Timestamps are written as RFC 3339 UTC with second precision. A job that
//! never rotated stores the zero instant `0001-01-01T00:00:00Z`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Wire form of "never"
pub(crate) const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

pub(crate) fn format(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse<E: serde::de::Error>(raw: &str) -> Result<DateTime<Utc>, E> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| E::custom(format_args!("invalid timestamp `{raw}`: {e}")))
}

/// Required timestamp
pub(crate) mod seconds {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(instant: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(*instant))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw)
    }
}

/// Optional timestamp, `None` written as the zero instant
pub(crate) mod zero_or_seconds {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        instant: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match instant {
            Some(t) => s.serialize_str(&format(*t)),
            None => s.serialize_str(ZERO_TIME),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref() {
            None | Some("" | ZERO_TIME) => Ok(None),
            Some(raw) => parse(raw).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stamp {
        #[serde(with = "super::seconds")]
        at: chrono::DateTime<chrono::Utc>,
        #[serde(with = "super::zero_or_seconds")]
        last: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[test]
    fn test_zero_instant_means_never() {
        let at = chrono::Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap();
        let json = serde_json::to_string(&Stamp { at, last: None }).unwrap();
        assert_eq!(
            json,
            r#"{"at":"2025-01-01T12:05:00Z","last":"0001-01-01T00:00:00Z"}"#
        );
        let back: Stamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back.last, None);
    }

    #[test]
    fn test_offsets_are_normalized_to_utc() {
        let back: Stamp = serde_json::from_str(
            r#"{"at":"2025-01-01T14:05:00+02:00","last":"2025-01-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(back.at, chrono::Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap());
        assert!(back.last.is_some());
    }
}
