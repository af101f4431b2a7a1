//! Cron schedules
//!
//! Six-field expressions: `second minute hour day-of-month month day-of-week`.
//! Day-of-week is numbered `0-6` starting on Sunday, or `SUN`-`SAT`.
//! A leading `TZ=<zone>` (or `CRON_TZ=<zone>`) is accepted and validated but
//! the fields are always evaluated in UTC so every node computes the same
//! next fire time.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tumbler_core::{add_duration, truncate_to_second};

use crate::error::FieldError;

const FIELD_COUNT: usize = 6;
const DOW_FIELD: usize = 5;

/// Parsed cron schedule
///
/// Serializes as the source string; the parsed form never reaches storage.
#[derive(Clone)]
pub struct Schedule {
    source: String,
    timezone: Option<Tz>,
    inner: cron::Schedule,
}

impl Schedule {
    /// Parse a six-field expression
    ///
    /// # Errors
    ///
    /// [`FieldError::InvalidSchedule`] when the expression is malformed, names
    /// an unknown timezone, or can never fire.
    pub fn parse(expression: &str) -> Result<Self, FieldError> {
        let source = expression.trim();
        let invalid = |reason: String| FieldError::InvalidSchedule {
            expression: source.to_string(),
            reason,
        };

        let (timezone, fields) = split_timezone(source).map_err(&invalid)?;
        let fields: Vec<&str> = fields.split_whitespace().collect();
        if fields.len() != FIELD_COUNT {
            return Err(invalid(format!(
                "expected {FIELD_COUNT} fields (second minute hour day-of-month month day-of-week), found {}",
                fields.len()
            )));
        }

        let mut translated: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
        translated[DOW_FIELD] = translate_day_of_week(fields[DOW_FIELD]).map_err(&invalid)?;

        let inner = cron::Schedule::from_str(&translated.join(" "))
            .map_err(|e| invalid(e.to_string()))?;
        if inner.after(&DateTime::<Utc>::UNIX_EPOCH).next().is_none() {
            return Err(invalid("expression never matches".to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            timezone,
            inner,
        })
    }

    /// Source expression as supplied
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Timezone named by a `TZ=` prefix; informational only
    pub fn declared_timezone(&self) -> Option<Tz> {
        self.timezone
    }

    /// Smallest matching UTC instant strictly after `after`
    ///
    /// `None` once the schedule is exhausted.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&truncate_to_second(after)).next()
    }

    /// First occurrence after `missed` that is still inside `window` at `now`
    ///
    /// Used to reschedule a fire that was skipped because its window closed.
    pub fn next_inside_window(
        &self,
        missed: DateTime<Utc>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if window.is_zero() {
            return self.next(missed);
        }
        // occurrence + window > now  <=>  occurrence > now - window
        let earliest = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.next(missed.max(earliest))
    }
}

/// Whether a fire at `next_fire` may still run at `now`
///
/// A zero window never closes.
pub fn inside_window(next_fire: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    window.is_zero() || now < add_duration(next_fire, window)
}

/// Whether a fire at `next_fire` is due and still inside its window
pub fn should_fire(next_fire: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    now >= next_fire && inside_window(next_fire, window, now)
}

fn split_timezone(source: &str) -> Result<(Option<Tz>, &str), String> {
    let Some(rest) = source
        .strip_prefix("TZ=")
        .or_else(|| source.strip_prefix("CRON_TZ="))
    else {
        return Ok((None, source));
    };
    let (name, fields) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| "timezone prefix without fields".to_string())?;
    let tz = Tz::from_str(name).map_err(|_| format!("unknown timezone `{name}`"))?;
    Ok((Some(tz), fields))
}

/// Shift numeric day-of-week values from `0-6` (Sunday first) to the
/// `1-7` numbering of the cron parser. Step values are left alone.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let shift = |value: &str| -> Result<String, String> {
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(value.to_string());
        }
        let day: u8 = value
            .parse()
            .map_err(|_| format!("invalid day-of-week `{value}`"))?;
        if day > 6 {
            return Err(format!("day-of-week `{day}` out of range 0-6"));
        }
        Ok((day + 1).to_string())
    };

    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let mut range = match range.split_once('-') {
            Some((start, end)) => format!("{}-{}", shift(start)?, shift(end)?),
            None => shift(range)?,
        };
        if let Some(step) = step {
            range.push('/');
            range.push_str(step);
        }
        parts.push(range);
    }
    Ok(parts.join(","))
}

impl FromStr for Schedule {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Schedule {}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.source).finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::parse(&source).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_next_every_five_minutes() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        assert_eq!(
            schedule.next(utc(2025, 1, 1, 12, 0, 3)),
            Some(utc(2025, 1, 1, 12, 5, 0))
        );
    }

    #[test]
    fn test_next_is_strictly_after_a_match() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        assert_eq!(
            schedule.next(utc(2025, 1, 1, 12, 5, 0)),
            Some(utc(2025, 1, 1, 12, 10, 0))
        );
    }

    #[test]
    fn test_next_ignores_subseconds_past_a_match() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        let after = utc(2025, 1, 1, 12, 5, 0) + chrono::Duration::milliseconds(500);
        assert_eq!(schedule.next(after), Some(utc(2025, 1, 1, 12, 10, 0)));
    }

    #[rstest]
    #[case::five_fields("0 * * * *")]
    #[case::seven_fields("0 0 * * * * 2030")]
    #[case::garbage("every day")]
    #[case::never_matches("0 0 0 30 2 *")]
    #[case::bad_timezone("TZ=Mars/Olympus 0 0 * * * *")]
    #[case::dow_out_of_range("0 0 0 * * 7")]
    fn test_parse_rejects(#[case] expression: &str) {
        let err = Schedule::parse(expression).unwrap_err();
        assert!(matches!(err, FieldError::InvalidSchedule { .. }), "{err}");
        assert!(err.to_string().starts_with("could not parse rotation_schedule"));
    }

    #[test]
    fn test_timezone_prefix_is_evaluated_in_utc() {
        let zoned = Schedule::parse("TZ=America/New_York 0 0 9 * * *").unwrap();
        let plain = Schedule::parse("0 0 9 * * *").unwrap();
        let after = utc(2025, 6, 1, 0, 0, 0);

        assert_eq!(zoned.declared_timezone(), Some(chrono_tz::America::New_York));
        assert_eq!(zoned.next(after), plain.next(after));
        assert_eq!(zoned.as_str(), "TZ=America/New_York 0 0 9 * * *");
    }

    #[rstest]
    // 2025-01-05 is a Sunday
    #[case("0 0 0 * * 0", utc(2025, 1, 5, 0, 0, 0))]
    #[case("0 0 0 * * 1-5", utc(2025, 1, 6, 0, 0, 0))]
    #[case("0 0 0 * * 6", utc(2025, 1, 11, 0, 0, 0))]
    #[case("0 0 0 * * SUN", utc(2025, 1, 5, 0, 0, 0))]
    fn test_day_of_week_starts_on_sunday(#[case] expression: &str, #[case] expected: DateTime<Utc>) {
        let schedule = Schedule::parse(expression).unwrap();
        assert_eq!(schedule.next(utc(2025, 1, 4, 12, 0, 0)), Some(expected));
    }

    #[test]
    fn test_translate_day_of_week_keeps_steps() {
        assert_eq!(translate_day_of_week("*/2").unwrap(), "*/2");
        assert_eq!(translate_day_of_week("1-5/2,0").unwrap(), "2-6/2,1");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
    }

    #[rstest]
    #[case::zero_window_never_closes(0, 100_000, true)]
    #[case::late_by_3599s(3600, 3599, true)]
    #[case::late_by_exactly_the_window(3600, 3600, false)]
    #[case::late_by_3601s(3600, 3601, false)]
    fn test_inside_window(#[case] window: u64, #[case] late_by: i64, #[case] expected: bool) {
        let fire = utc(2025, 1, 1, 13, 0, 0);
        let now = fire + chrono::Duration::seconds(late_by);
        assert_eq!(inside_window(fire, Duration::from_secs(window), now), expected);
    }

    #[test]
    fn test_should_fire_requires_due() {
        let fire = utc(2025, 1, 1, 13, 0, 0);
        let window = Duration::from_secs(3600);
        assert!(!should_fire(fire, window, fire - chrono::Duration::seconds(1)));
        assert!(should_fire(fire, window, fire));
    }

    #[test]
    fn test_next_inside_window_skips_closed_fires() {
        let schedule = Schedule::parse("0 0 * * * *").unwrap();
        let window = Duration::from_secs(3600);
        let missed = utc(2025, 1, 1, 13, 0, 0);

        assert_eq!(
            schedule.next_inside_window(missed, window, utc(2025, 1, 1, 14, 0, 1)),
            Some(utc(2025, 1, 1, 14, 0, 0))
        );
        assert_eq!(
            schedule.next_inside_window(missed, window, utc(2025, 1, 1, 17, 30, 0)),
            Some(utc(2025, 1, 1, 17, 0, 0))
        );
    }

    #[test]
    fn test_serializes_as_source_string() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, r#""0 */5 * * * *""#);

        let back: Schedule = serde_json::from_str(&json).unwrap();
        let from = utc(2025, 3, 1, 7, 31, 12);
        assert_eq!(back, schedule);
        assert_eq!(back.next(from), schedule.next(from));
    }

    proptest::proptest! {
        #[test]
        fn prop_next_is_strictly_later(secs in 0i64..3_000_000_000) {
            let schedule = Schedule::parse("*/7 3 * * * *").unwrap();
            let after = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            let next = schedule.next(after).unwrap();
            proptest::prop_assert!(next > after);
            proptest::prop_assert_eq!(schedule.next(next - chrono::Duration::seconds(1)), Some(next));
        }
    }
}
