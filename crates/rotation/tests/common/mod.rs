//! Shared harness: a manager on a manual clock and an in-memory store, with
//! a backend that records every rotate call.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tumbler_core::{BoxError, Clock, ManualClock, Namespace, RequestContext};
use tumbler_rotation::{
    BackendView, CredentialRotator, JobId, MemoryStore, ParsedFields, RotationConfig,
    RotationContext, RotationEvent, RotationManager, RotationParams,
};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(100);
pub const MOUNT: &str = "db";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
}

pub fn secs(s: i64) -> TimeDelta {
    TimeDelta::seconds(s)
}

pub fn schedule(expression: &str) -> RotationParams {
    ParsedFields::new().schedule(expression).validate().unwrap()
}

pub fn period(seconds: u64) -> RotationParams {
    ParsedFields::new()
        .period(Duration::from_secs(seconds))
        .validate()
        .unwrap()
}

pub fn period_with_policy(seconds: u64, policy: &str) -> RotationParams {
    ParsedFields::new()
        .period(Duration::from_secs(seconds))
        .policy(policy)
        .validate()
        .unwrap()
}

/// One observed rotate call
#[derive(Debug, Clone)]
pub struct Call {
    pub job_id: JobId,
    pub path: String,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub cancellation: CancellationToken,
}

/// Backend double: records calls, fails on demand, optionally blocks until
/// released
pub struct RecordingRotator {
    clock: Arc<ManualClock>,
    calls: mpsc::UnboundedSender<Call>,
    fail_always: AtomicBool,
    fail_next: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingRotator {
    pub fn new(clock: Arc<ManualClock>) -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        Self::build(clock, None)
    }

    /// Every call blocks until [`release`](Self::release)
    pub fn gated(clock: Arc<ManualClock>) -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        Self::build(clock, Some(Arc::new(Semaphore::new(0))))
    }

    fn build(
        clock: Arc<ManualClock>,
        gate: Option<Arc<Semaphore>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let rotator = Arc::new(Self {
            clock,
            calls,
            fail_always: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            gate,
        });
        (rotator, rx)
    }

    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Let `n` blocked calls finish
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl CredentialRotator for RecordingRotator {
    async fn rotate_credential(
        &self,
        ctx: &RotationContext,
        _mount_point: &str,
        req_path: &str,
    ) -> Result<(), BoxError> {
        let _ = self.calls.send(Call {
            job_id: ctx.job_id,
            path: req_path.to_string(),
            at: self.clock.now(),
            attempt: ctx.attempt,
            cancellation: ctx.cancellation.clone(),
        });

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }

        if self.fail_always.load(Ordering::SeqCst) {
            return Err("backend unavailable".into());
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err("backend unavailable".into());
        }
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub manager: RotationManager,
    pub events: broadcast::Receiver<RotationEvent>,
    pub rotator: Arc<RecordingRotator>,
    pub calls: mpsc::UnboundedReceiver<Call>,
    pub view: BackendView,
    pub ctx: RequestContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RotationConfig::default())
    }

    pub fn with_config(config: RotationConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let (rotator, calls) = RecordingRotator::new(clock.clone());
        Self::assemble(clock, Arc::new(MemoryStore::new()), config, rotator, calls)
    }

    pub fn gated(config: RotationConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let (rotator, calls) = RecordingRotator::gated(clock.clone());
        Self::assemble(clock, Arc::new(MemoryStore::new()), config, rotator, calls)
    }

    /// A second node on the same store and clock, as after a restart
    pub fn restart(&self) -> Self {
        let (rotator, calls) = RecordingRotator::new(self.clock.clone());
        Self::assemble(
            self.clock.clone(),
            self.store.clone(),
            self.manager.config().clone(),
            rotator,
            calls,
        )
    }

    pub fn assemble(
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        config: RotationConfig,
        rotator: Arc<RecordingRotator>,
        calls: mpsc::UnboundedReceiver<Call>,
    ) -> Self {
        tumbler_log::init_test();
        let manager = RotationManager::builder()
            .store(store.clone())
            .clock(clock.clone())
            .config(config)
            .build()
            .unwrap();
        let events = manager.subscribe();
        let view = manager.mount_backend(Namespace::root(), MOUNT, rotator.clone());
        Self {
            clock,
            store,
            manager,
            events,
            rotator,
            calls,
            view,
            ctx: RequestContext::root(),
        }
    }

    pub async fn register(&self, path: &str, params: RotationParams) -> JobId {
        self.view.register(&self.ctx, path, params).await.unwrap().0
    }

    /// Next event matching `pred`, skipping the rest
    pub async fn wait_event(&mut self, pred: impl Fn(&RotationEvent) -> bool) -> RotationEvent {
        timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("event in time")
    }

    pub async fn wait_succeeded(&mut self, id: JobId) -> (DateTime<Utc>, DateTime<Utc>) {
        match self
            .wait_event(|e| matches!(e, RotationEvent::Succeeded { id: got, .. } if *got == id))
            .await
        {
            RotationEvent::Succeeded { rotated_at, next, .. } => (rotated_at, next),
            other => unreachable!("{other:?}"),
        }
    }

    /// `(next, retrying, consecutive_failures)` of the next failure of `id`
    pub async fn wait_failed(&mut self, id: JobId) -> (DateTime<Utc>, bool, u32) {
        match self
            .wait_event(|e| matches!(e, RotationEvent::Failed { id: got, .. } if *got == id))
            .await
        {
            RotationEvent::Failed {
                next,
                retrying,
                consecutive_failures,
                ..
            } => (next, retrying, consecutive_failures),
            other => unreachable!("{other:?}"),
        }
    }

    pub async fn next_call(&mut self) -> Call {
        timeout(WAIT, self.calls.recv())
            .await
            .expect("rotate call in time")
            .expect("rotator alive")
    }

    /// Assert no rotate call arrives for a short while
    pub async fn assert_no_call(&mut self) {
        if let Ok(Some(call)) = timeout(QUIET, self.calls.recv()).await {
            panic!("unexpected rotate call {call:?}");
        }
    }
}
