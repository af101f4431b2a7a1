//! Injectable time source
//!
//! Nothing outside this module reads the wall clock or creates timers directly.
//! Production code uses [`SystemClock`]; tests drive a `ManualClock`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

/// Time source used by schedulers, sessions and workers
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Current UTC instant
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once [`Clock::now`] is at or past `deadline`
    async fn sleep_until(&self, deadline: DateTime<Utc>);

    /// Resolve after `duration` has elapsed on this clock
    async fn sleep(&self, duration: Duration) {
        let deadline = add_duration(self.now(), duration);
        self.sleep_until(deadline).await;
    }
}

/// Saturating `instant + duration`
pub fn add_duration(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Drop sub-second precision
pub fn truncate_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(0)
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        // negative remainder means the deadline already passed
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(remaining).await;
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock for deterministic tests
///
/// Sleepers wake as soon as [`ManualClock::set`] or [`ManualClock::advance`]
/// moves the clock to or past their deadline.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
pub struct ManualClock {
    now: tokio::sync::watch::Sender<DateTime<Utc>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = tokio::sync::watch::channel(start);
        Self { now }
    }

    /// Jump to an absolute instant (may move backwards)
    pub fn set(&self, instant: DateTime<Utc>) {
        self.now.send_replace(instant);
    }

    /// Move forward by `duration`
    pub fn advance(&self, duration: Duration) {
        self.now.send_modify(|now| *now = add_duration(*now, duration));
    }

    /// Number of tasks currently parked in [`Clock::sleep_until`]
    pub fn sleepers(&self) -> usize {
        self.now.receiver_count()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut rx = self.now.subscribe();
        // the sender lives in `self`, so the wait only ends on the deadline
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_truncate_to_second() {
        let t = t0() + TimeDelta::milliseconds(1_750);
        assert_eq!(truncate_to_second(t), t0() + TimeDelta::seconds(1));
    }

    #[test]
    fn test_add_duration_saturates() {
        assert_eq!(
            add_duration(t0(), Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test]
    async fn test_manual_clock_wakes_sleeper_on_advance() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move { clock.sleep(Duration::from_secs(60)).await })
        };

        while clock.sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .expect("sleeper woke")
            .unwrap();
        assert_eq!(clock.now(), t0() + TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn test_manual_clock_past_deadline_returns_immediately() {
        let clock = ManualClock::new(t0());
        clock.sleep_until(t0() - TimeDelta::seconds(1)).await;
        clock.sleep_until(t0()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleep_until_past_deadline() {
        let clock = SystemClock;
        clock.sleep_until(Utc::now() - TimeDelta::hours(1)).await;
    }
}
