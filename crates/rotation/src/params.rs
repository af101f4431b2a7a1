//! Rotation parameters
//!
//! [`ParsedFields`] is the raw, typed view of a backend's write request.
//! [`ParsedFields::validate`] turns it into an immutable [`RotationParams`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tumbler_core::{add_duration, truncate_to_second};

use crate::error::{FieldError, MIN_ROTATION_WINDOW_SECS};
use crate::policy::RotationPolicy;
use crate::schedule::Schedule;

/// Field names recognised on a backend's write path
pub const FIELD_SCHEDULE: &str = "rotation_schedule";
/// See [`FIELD_SCHEDULE`]
pub const FIELD_WINDOW: &str = "rotation_window";
/// See [`FIELD_SCHEDULE`]
pub const FIELD_PERIOD: &str = "rotation_period";
/// See [`FIELD_SCHEDULE`]
pub const FIELD_POLICY: &str = "rotation_policy";
/// See [`FIELD_SCHEDULE`]
pub const FIELD_DISABLE: &str = "disable_automated_rotation";

/// Rotation fields as supplied by a caller, each with explicit presence
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tumbler_rotation::ParsedFields;
///
/// let params = ParsedFields::new()
///     .period(Duration::from_secs(3600))
///     .policy("retry")
///     .validate()
///     .unwrap();
/// assert!(params.uses_period());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFields {
    /// Cron expression; empty clears the schedule
    pub rotation_schedule: Option<String>,
    /// Window after each scheduled instant
    pub rotation_window: Option<Duration>,
    /// Fixed interval between rotations
    pub rotation_period: Option<Duration>,
    /// `default`, `retry` or `fail`
    pub rotation_policy: Option<String>,
    /// Refuse registration and remove any existing job
    pub disable_automated_rotation: Option<bool>,
}

impl ParsedFields {
    /// No fields present
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `rotation_schedule`
    pub fn schedule(mut self, expression: impl Into<String>) -> Self {
        self.rotation_schedule = Some(expression.into());
        self
    }

    /// Set `rotation_window`
    pub fn window(mut self, window: Duration) -> Self {
        self.rotation_window = Some(window);
        self
    }

    /// Set `rotation_period`
    pub fn period(mut self, period: Duration) -> Self {
        self.rotation_period = Some(period);
        self
    }

    /// Set `rotation_policy`
    pub fn policy(mut self, policy: impl Into<String>) -> Self {
        self.rotation_policy = Some(policy.into());
        self
    }

    /// Set `disable_automated_rotation`
    pub fn disable(mut self, disable: bool) -> Self {
        self.disable_automated_rotation = Some(disable);
        self
    }

    /// Read the rotation fields out of a JSON request body
    ///
    /// Durations may be integers (seconds) or strings holding either digits
    /// or a humantime expression such as `"1h"`. Unknown keys are ignored.
    pub fn from_json(body: &Map<String, Value>) -> Result<Self, FieldError> {
        let mut fields = Self::new();
        if let Some(value) = present(body, FIELD_SCHEDULE) {
            fields.rotation_schedule = Some(string_field(FIELD_SCHEDULE, value)?);
        }
        if let Some(value) = present(body, FIELD_WINDOW) {
            fields.rotation_window = Some(duration_field(FIELD_WINDOW, value)?);
        }
        if let Some(value) = present(body, FIELD_PERIOD) {
            fields.rotation_period = Some(duration_field(FIELD_PERIOD, value)?);
        }
        if let Some(value) = present(body, FIELD_POLICY) {
            fields.rotation_policy = Some(string_field(FIELD_POLICY, value)?);
        }
        if let Some(value) = present(body, FIELD_DISABLE) {
            fields.disable_automated_rotation = Some(bool_field(FIELD_DISABLE, value)?);
        }
        Ok(fields)
    }

    /// Validate and normalize into [`RotationParams`]
    ///
    /// Checks run in a fixed order so the first violated rule is reported:
    /// mutual exclusion, window with period, window without schedule,
    /// schedule syntax, window minimum, policy name.
    pub fn validate(&self) -> Result<RotationParams, FieldError> {
        let expression = self
            .rotation_schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let window = whole_seconds(FIELD_WINDOW, self.rotation_window)?;
        let period = whole_seconds(FIELD_PERIOD, self.rotation_period)?;

        if expression.is_some() && !period.is_zero() {
            return Err(FieldError::MutuallyExclusiveFields);
        }
        if !window.is_zero() && !period.is_zero() {
            return Err(FieldError::WindowWithPeriod);
        }
        if !window.is_zero() && expression.is_none() {
            return Err(FieldError::WindowWithoutSchedule);
        }
        let schedule = expression.map(Schedule::parse).transpose()?;
        if !window.is_zero() && window.as_secs() < MIN_ROTATION_WINDOW_SECS {
            return Err(FieldError::WindowTooSmall {
                minimum_secs: MIN_ROTATION_WINDOW_SECS,
            });
        }
        let policy = self
            .rotation_policy
            .as_deref()
            .unwrap_or_default()
            .parse::<RotationPolicy>()?;

        Ok(RotationParams {
            schedule,
            window,
            period,
            policy,
            disable_automated_rotation: self.disable_automated_rotation.unwrap_or(false),
        })
    }
}

fn present<'a>(body: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    body.get(key).filter(|v| !v.is_null())
}

fn string_field(field: &'static str, value: &Value) -> Result<String, FieldError> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| FieldError::InvalidValue {
            field,
            reason: format!("expected a string, got {value}"),
        })
}

fn bool_field(field: &'static str, value: &Value) -> Result<bool, FieldError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => s.trim().parse().map_err(|_| FieldError::InvalidValue {
            field,
            reason: format!("expected a boolean, got `{s}`"),
        }),
        other => Err(FieldError::InvalidValue {
            field,
            reason: format!("expected a boolean, got {other}"),
        }),
    }
}

fn duration_field(field: &'static str, value: &Value) -> Result<Duration, FieldError> {
    let invalid = |reason: String| FieldError::InvalidValue { field, reason };
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| invalid(format!("expected non-negative whole seconds, got {n}"))),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Duration::ZERO);
            }
            if s.bytes().all(|b| b.is_ascii_digit()) {
                return s
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|e| invalid(format!("`{s}`: {e}")));
            }
            humantime_serde::re::humantime::parse_duration(s)
                .map_err(|e| invalid(format!("`{s}`: {e}")))
        }
        other => Err(invalid(format!("expected seconds or a duration string, got {other}"))),
    }
}

/// Reject sub-second remainders so stored values are exact whole seconds
fn whole_seconds(field: &'static str, value: Option<Duration>) -> Result<Duration, FieldError> {
    let value = value.unwrap_or_default();
    if value.subsec_nanos() != 0 {
        return Err(FieldError::InvalidValue {
            field,
            reason: format!("{value:?} is not a whole number of seconds"),
        });
    }
    Ok(value)
}

/// Validated rotation configuration of one credential
///
/// At most one of schedule and period is set. Both unset means the
/// credential does not rotate automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationParams {
    schedule: Option<Schedule>,
    window: Duration,
    period: Duration,
    policy: RotationPolicy,
    disable_automated_rotation: bool,
}

impl RotationParams {
    /// Cron schedule, if this credential rotates on one
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// Window after each scheduled instant; zero when unset
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Fixed rotation period; zero when unset
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Failure policy
    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Whether `disable_automated_rotation` was set
    pub fn is_disabled(&self) -> bool {
        self.disable_automated_rotation
    }

    /// Either a schedule or a period is set
    pub fn has_nonzero(&self) -> bool {
        self.uses_schedule() || self.uses_period()
    }

    /// The credential should have a rotation job
    pub fn should_register(&self) -> bool {
        self.has_nonzero() && !self.disable_automated_rotation
    }

    /// Any existing rotation job should be removed
    pub fn should_deregister(&self) -> bool {
        self.disable_automated_rotation || !self.has_nonzero()
    }

    /// Rotation is driven by a cron schedule
    pub fn uses_schedule(&self) -> bool {
        self.schedule.is_some()
    }

    /// Rotation is driven by a fixed period
    pub fn uses_period(&self) -> bool {
        !self.period.is_zero()
    }

    /// Next regular rotation after `from`, truncated to the second
    ///
    /// `None` when neither a schedule nor a period is set, or the schedule
    /// has no further occurrences.
    pub fn next_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = truncate_to_second(from);
        if let Some(schedule) = &self.schedule {
            return schedule.next(from);
        }
        if self.uses_period() {
            return Some(add_duration(from, self.period));
        }
        None
    }

    /// Whether `other` changes when this credential fires
    pub fn timing_differs(&self, other: &Self) -> bool {
        self.schedule != other.schedule || self.window != other.window || self.period != other.period
    }

    /// Back to the field representation; validating the result yields `self`
    pub fn to_fields(&self) -> ParsedFields {
        ParsedFields {
            rotation_schedule: self.schedule.as_ref().map(|s| s.as_str().to_string()),
            rotation_window: (!self.window.is_zero()).then_some(self.window),
            rotation_period: (!self.period.is_zero()).then_some(self.period),
            rotation_policy: Some(self.policy.as_str().to_string()),
            disable_automated_rotation: Some(self.disable_automated_rotation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[rstest]
    #[case::both_timings(
        ParsedFields::new().schedule("*/15 * * * * *").period(secs(15)),
        FieldError::MutuallyExclusiveFields
    )]
    #[case::window_with_period(
        ParsedFields::new().period(secs(60)).window(secs(3600)),
        FieldError::WindowWithPeriod
    )]
    #[case::window_alone(ParsedFields::new().window(secs(3600)), FieldError::WindowWithoutSchedule)]
    #[case::window_with_empty_schedule(
        ParsedFields::new().schedule("  ").window(secs(3600)),
        FieldError::WindowWithoutSchedule
    )]
    #[case::small_window(
        ParsedFields::new().schedule("0 0 * * * *").window(secs(3599)),
        FieldError::WindowTooSmall { minimum_secs: 3600 }
    )]
    #[case::bad_policy(
        ParsedFields::new().period(secs(60)).policy("later"),
        FieldError::InvalidPolicy { value: "later".into() }
    )]
    fn test_validation_errors(#[case] fields: ParsedFields, #[case] expected: FieldError) {
        assert_eq!(fields.validate().unwrap_err(), expected);
    }

    #[test]
    fn test_schedule_syntax_checked_before_window_minimum() {
        let err = ParsedFields::new()
            .schedule("not cron")
            .window(secs(10))
            .validate()
            .unwrap_err();
        assert!(matches!(err, FieldError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_sub_second_period_is_rejected() {
        let err = ParsedFields::new()
            .period(Duration::from_millis(1500))
            .validate()
            .unwrap_err();
        assert!(matches!(err, FieldError::InvalidValue { field: FIELD_PERIOD, .. }));
    }

    #[test]
    fn test_register_and_deregister_predicates() {
        let none = ParsedFields::new().validate().unwrap();
        assert!(!none.has_nonzero());
        assert!(none.should_deregister());
        assert!(!none.should_register());

        let period = ParsedFields::new().period(secs(60)).validate().unwrap();
        assert!(period.should_register());
        assert!(!period.should_deregister());

        let disabled = ParsedFields::new()
            .period(secs(60))
            .disable(true)
            .validate()
            .unwrap();
        assert!(!disabled.should_register());
        assert!(disabled.should_deregister());
    }

    #[test]
    fn test_next_from() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 3).unwrap() + chrono::Duration::milliseconds(700);

        let cron = ParsedFields::new().schedule("0 */5 * * * *").validate().unwrap();
        assert_eq!(
            cron.next_from(t),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap())
        );

        let period = ParsedFields::new().period(secs(60)).validate().unwrap();
        assert_eq!(
            period.next_from(t),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 1, 3).unwrap())
        );

        assert_eq!(ParsedFields::new().validate().unwrap().next_from(t), None);
    }

    #[test]
    fn test_fields_round_trip() {
        let params = ParsedFields::new()
            .schedule("0 0 * * * *")
            .window(secs(7200))
            .policy("fail")
            .validate()
            .unwrap();
        assert_eq!(params.to_fields().validate().unwrap(), params);
    }

    #[test]
    fn test_from_json_accepts_integers_and_strings() {
        let body = json!({
            "rotation_period": "1h",
            "rotation_policy": "retry",
            "disable_automated_rotation": "false",
            "unrelated": 5,
        });
        let fields = ParsedFields::from_json(body.as_object().unwrap()).unwrap();
        assert_eq!(fields.rotation_period, Some(secs(3600)));

        let body = json!({ "rotation_schedule": "0 0 * * * *", "rotation_window": 3600 });
        let params = ParsedFields::from_json(body.as_object().unwrap())
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(params.window(), secs(3600));

        let body = json!({ "rotation_period": "90" });
        let fields = ParsedFields::from_json(body.as_object().unwrap()).unwrap();
        assert_eq!(fields.rotation_period, Some(secs(90)));
    }

    #[rstest]
    #[case(json!({ "rotation_period": -5 }))]
    #[case(json!({ "rotation_period": 1.5 }))]
    #[case(json!({ "rotation_window": "soon" }))]
    #[case(json!({ "rotation_schedule": 5 }))]
    #[case(json!({ "disable_automated_rotation": 1 }))]
    fn test_from_json_rejects_bad_types(#[case] body: Value) {
        let err = ParsedFields::from_json(body.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, FieldError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn test_timing_differs_ignores_policy() {
        let a = ParsedFields::new().period(secs(60)).validate().unwrap();
        let b = ParsedFields::new().period(secs(60)).policy("fail").validate().unwrap();
        let c = ParsedFields::new().period(secs(61)).validate().unwrap();
        assert!(!a.timing_differs(&b));
        assert!(a.timing_differs(&c));
    }
}
