//! Rotation manager
//!
//! Owns every registered job, the rotation queue and the dispatcher. Backends
//! reach it through a [`BackendView`]; hosts build one per node with
//! [`RotationManager::builder`].
//!
//! Locking: one async mutex guards the job tables, the queue and the
//! in-flight set. Job state is persisted while that lock is held so memory
//! and storage change in the same order. Backend callbacks always run
//! outside it.

mod builder;
mod dispatcher;
mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tumbler_core::{Clock, Namespace, add_duration, context::normalize_mount, truncate_to_second};
use tumbler_session::{Listener, SessionClient};

pub use builder::{No, RotationManagerBuilder, Yes};

use self::state::{State, persist};
use crate::config::RotationConfig;
use crate::error::{
    FieldError, MOUNT_POINT_REQUIRED, REQ_PATH_REQUIRED, RotationError, RotationResult,
    StorageError, TIMING_REQUIRED,
};
use crate::events::RotationEvent;
use crate::job::{
    JobId, JobKey, JobRecord, JobState, MountKey, RotationInfo, RotationJob, STORAGE_PREFIX,
};
use crate::params::RotationParams;
use crate::queue::QueueEntry;
use crate::rotator::CredentialRotator;
use crate::store::Store;
use crate::view::BackendView;

/// Capability the broker addresses for out-of-band rotation
pub const ROTATION_CAPABILITY: &str = "rotation";

/// Per-mount settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Overrides [`RotationConfig::rotation_timeout`] for this mount
    pub rotation_timeout: Option<Duration>,
}

impl MountOptions {
    /// Override the rotate deadline
    pub fn with_rotation_timeout(mut self, timeout: Duration) -> Self {
        self.rotation_timeout = Some(timeout);
        self
    }
}

/// Registration of one credential
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Namespace of the mount
    pub namespace: Namespace,
    /// Backend-relative mount point
    pub mount_point: String,
    /// Credential path
    pub req_path: String,
    /// Validated settings
    pub params: RotationParams,
}

impl RegisterRequest {
    /// Request for `req_path` under `mount_point`
    pub fn new(
        namespace: Namespace,
        mount_point: impl Into<String>,
        req_path: impl Into<String>,
        params: RotationParams,
    ) -> Self {
        Self {
            namespace,
            mount_point: mount_point.into(),
            req_path: req_path.into(),
            params,
        }
    }
}

pub(crate) struct MountEntry {
    pub(crate) rotator: Arc<dyn CredentialRotator>,
    pub(crate) options: MountOptions,
}

#[derive(Default)]
struct Tasks {
    dispatcher: Option<JoinHandle<()>>,
    bridge: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: RotationConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) state: tokio::sync::Mutex<State>,
    pub(crate) mounts: RwLock<HashMap<MountKey, MountEntry>>,
    /// Coalescing single-permit wakeup for the dispatcher
    pub(crate) wakeup: Notify,
    pub(crate) shutdown: CancellationToken,
    events: broadcast::Sender<RotationEvent>,
    session: Option<SessionClient>,
    started: AtomicBool,
    tasks: Mutex<Tasks>,
}

impl Inner {
    pub(crate) fn emit(&self, event: RotationEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Rotate deadline for a mount
    pub(crate) fn rotation_timeout(&self, options: &MountOptions) -> Duration {
        options.rotation_timeout.unwrap_or(self.config.rotation_timeout)
    }
}

/// Node-wide rotation service
///
/// Cheap to clone; clones share one set of jobs and one dispatcher.
#[derive(Clone)]
pub struct RotationManager {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for RotationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationManager")
            .field("config", &self.inner.config)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RotationManager {
    /// Start building a manager
    pub fn builder() -> RotationManagerBuilder<No> {
        RotationManagerBuilder::new()
    }

    pub(crate) fn new(
        config: RotationConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        session: Option<SessionClient>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                store,
                state: tokio::sync::Mutex::new(State::default()),
                mounts: RwLock::new(HashMap::new()),
                wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
                events,
                session,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Whether automated rotation runs on this node
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Active configuration
    pub fn config(&self) -> &RotationConfig {
        &self.inner.config
    }

    /// Broker session, if one was configured
    pub fn session(&self) -> Option<&SessionClient> {
        self.inner.session.as_ref()
    }

    /// Receive rotation events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.inner.events.subscribe()
    }

    /// Attach a backend's rotate callback to `mount` in `namespace`
    pub fn mount_backend(
        &self,
        namespace: Namespace,
        mount: &str,
        rotator: Arc<dyn CredentialRotator>,
    ) -> BackendView {
        self.mount_backend_with(namespace, mount, rotator, MountOptions::default())
    }

    /// [`mount_backend`](Self::mount_backend) with per-mount options
    pub fn mount_backend_with(
        &self,
        namespace: Namespace,
        mount: &str,
        rotator: Arc<dyn CredentialRotator>,
        options: MountOptions,
    ) -> BackendView {
        let key = MountKey::new(&namespace, mount);
        debug!(mount = %key, "backend mounted for rotation");
        self.inner
            .mounts
            .write()
            .insert(key, MountEntry { rotator, options });
        self.inner.wakeup.notify_one();
        BackendView::new(self.clone(), namespace, normalize_mount(mount))
    }

    /// Detach a mount's callback; its jobs stay registered and are deferred
    pub fn unmount_backend(&self, namespace: &Namespace, mount: &str) -> bool {
        let key = MountKey::new(namespace, mount);
        let removed = self.inner.mounts.write().remove(&key).is_some();
        if removed {
            debug!(mount = %key, "backend unmounted");
        }
        removed
    }

    /// Create or update the job for `(mount, path)`
    ///
    /// A new job first fires at `params.next_from(now)`. Updating a job only
    /// moves its next fire when the timing changed. The record is written
    /// before memory changes, so a storage error leaves no trace.
    pub async fn register(&self, request: RegisterRequest) -> RotationResult<(JobId, RotationInfo)> {
        let inner = &self.inner;
        if !inner.config.enabled {
            return Err(RotationError::UnsupportedCapability {
                reason: "automated rotation is disabled on this node".to_string(),
            });
        }
        let key = request_key(&request.namespace, &request.mount_point, &request.req_path)?;
        if request.params.is_disabled() {
            self.deregister_key(&key).await?;
            return Err(RotationError::AutomatedRotationDisabled {
                mount: key.mount.to_string(),
                path: key.path,
            });
        }
        if !request.params.has_nonzero() {
            return Err(RotationError::invalid_request(TIMING_REQUIRED));
        }
        if inner.shutdown.is_cancelled() {
            return Err(RotationError::Shutdown);
        }

        let now = inner.now();
        let mut state = inner.state.lock().await;
        let existing = state.get(&key).cloned();
        let updated = existing.is_some();
        let job = match existing {
            Some(mut job) => {
                if job.params.timing_differs(&request.params) {
                    job.next_vault_rotation = first_fire(&request.params, now)?;
                    if job.state == JobState::CoolingDown {
                        job.transition(JobState::Scheduled)?;
                    }
                }
                job.params = request.params;
                job
            }
            None => RotationJob {
                id: JobId::new(now),
                namespace: request.namespace,
                mount_point: key.mount.mount.clone(),
                req_path: key.path.clone(),
                next_vault_rotation: first_fire(&request.params, now)?,
                params: request.params,
                last_vault_rotation: None,
                consecutive_failures: 0,
                state: JobState::Scheduled,
            },
        };

        persist(inner.store.as_ref(), &job).await?;
        let info = job.info(now);
        let next = job.next_vault_rotation;
        let id = job.id;
        state.insert(job);
        drop(state);
        inner.wakeup.notify_one();

        info!(job_id = %id, mount = %key.mount, path = %key.path, %next, updated, "rotation job registered");
        inner.emit(RotationEvent::Registered {
            id,
            mount: key.mount.to_string(),
            path: key.path,
            next,
            updated,
        });
        Ok((id, info))
    }

    /// Remove the job for `(mount, path)`; unknown paths succeed
    ///
    /// If a worker is rotating the job, waits for it to finish (bounded by
    /// the rotation timeout); its result is discarded.
    pub async fn deregister(&self, namespace: &Namespace, mount: &str, path: &str) -> RotationResult<()> {
        let key = request_key(namespace, mount, path)?;
        self.deregister_key(&key).await
    }

    async fn deregister_key(&self, key: &JobKey) -> RotationResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let Some(&id) = state.by_path.get(key) else {
            return Ok(());
        };
        inner.store.delete(&key.storage_key()).await?;
        let running = state.watch_in_flight(&id);
        if let Some(mut job) = state.remove(&id) {
            let from = job.state;
            // a removed job is dropped right after; only the log sees the state
            let _ = job.transition(JobState::Disabled);
            debug!(job_id = %id, %from, to = %job.state, "rotation job disabled");
        }
        let timeout = inner
            .mounts
            .read()
            .get(&key.mount)
            .map_or(inner.config.rotation_timeout, |m| inner.rotation_timeout(&m.options));
        drop(state);

        info!(job_id = %id, mount = %key.mount, path = %key.path, "rotation job deregistered");
        inner.emit(RotationEvent::Deregistered {
            id,
            mount: key.mount.to_string(),
            path: key.path.clone(),
        });

        if let Some(mut done) = running {
            debug!(job_id = %id, "waiting for in-flight rotation");
            let deadline = add_duration(inner.now(), timeout);
            tokio::select! {
                _ = done.wait_for(|finished| *finished) => {}
                () = inner.clock.sleep_until(deadline) => {
                    warn!(job_id = %id, ?timeout, "in-flight rotation outlived deregistration wait");
                }
            }
        }
        Ok(())
    }

    /// Rotation info for `(mount, path)`, `None` when not registered
    ///
    /// Never waits on an in-flight rotation.
    pub async fn get_info(&self, namespace: &Namespace, mount: &str, path: &str) -> Option<RotationInfo> {
        let key = JobKey::new(namespace, mount, path);
        let now = self.inner.now();
        self.inner.state.lock().await.get(&key).map(|job| job.info(now))
    }

    /// Snapshot of the job for `(mount, path)`
    pub async fn job(&self, namespace: &Namespace, mount: &str, path: &str) -> Option<RotationJob> {
        let key = JobKey::new(namespace, mount, path);
        self.inner.state.lock().await.get(&key).cloned()
    }

    /// Snapshot of every job, ordered by key
    pub async fn jobs(&self) -> Vec<RotationJob> {
        let mut jobs: Vec<_> = self.inner.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by_key(RotationJob::key);
        jobs
    }

    /// Queue contents in dispatch order
    pub async fn queued(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().await.queue.ordered()
    }

    /// Make the job due immediately
    ///
    /// A job a worker is already rotating is left alone.
    pub async fn rotate_now(&self, namespace: &Namespace, mount: &str, path: &str) -> RotationResult<RotationInfo> {
        let inner = &self.inner;
        let key = request_key(namespace, mount, path)?;
        let now = truncate_to_second(inner.now());
        let mut state = inner.state.lock().await;
        let Some(mut job) = state.get(&key).cloned() else {
            return Err(RotationError::NotRegistered {
                mount: key.mount.to_string(),
                path: key.path,
            });
        };
        if job.state != JobState::Running {
            job.transition(JobState::Scheduled)?;
            job.next_vault_rotation = now;
            persist(inner.store.as_ref(), &job).await?;
            info!(job_id = %job.id, mount = %key.mount, path = %key.path, "out-of-band rotation requested");
        }
        let info = job.info(now);
        state.insert(job);
        drop(state);
        inner.wakeup.notify_one();
        Ok(info)
    }

    /// Load persisted jobs and start the dispatcher
    ///
    /// With a broker session configured, also starts the session and serves
    /// [`ROTATION_CAPABILITY`] invocations. Calling `start` twice is a no-op.
    pub async fn start(&self) -> RotationResult<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RotationError::Shutdown);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !inner.config.enabled {
            info!("automated rotation disabled; dispatcher not started");
            return Ok(());
        }
        if let Err(e) = self.load().await {
            inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let dispatcher = tokio::spawn(dispatcher::run(Arc::clone(inner)));
        let bridge = inner.session.as_ref().map(|session| {
            session.start();
            let listener = session.listen(ROTATION_CAPABILITY);
            tokio::spawn(serve_broker(self.clone(), listener))
        });
        let mut tasks = inner.tasks.lock();
        tasks.dispatcher = Some(dispatcher);
        tasks.bridge = bridge;
        info!(workers = inner.config.workers, "rotation manager started");
        Ok(())
    }

    /// Stop dispatching and wait for in-flight rotations
    ///
    /// Waits at most [`RotationConfig::shutdown_grace`] before abandoning
    /// rotations that are still running.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let (dispatcher, bridge) = {
            let mut tasks = inner.tasks.lock();
            (tasks.dispatcher.take(), tasks.bridge.take())
        };
        if let Some(bridge) = bridge {
            bridge.abort();
        }
        if let Some(session) = &inner.session {
            session.stop().await;
        }
        if let Some(dispatcher) = dispatcher
            && let Err(e) = dispatcher.await
        {
            warn!(error = %e, "rotation dispatcher ended abnormally");
        }
        info!("rotation manager stopped");
    }

    async fn load(&self) -> RotationResult<()> {
        let inner = &self.inner;
        let keys = inner.store.list(STORAGE_PREFIX).await?;
        let mut loaded = 0usize;
        for key in keys {
            let job = match self.read_record(&key).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable rotation record");
                    continue;
                }
            };
            let mut state = inner.state.lock().await;
            if state.by_path.contains_key(&job.key()) {
                debug!(key = %key, "job already registered in memory; keeping it");
                continue;
            }
            state.insert(job);
            loaded += 1;
        }
        info!(jobs = loaded, "rotation jobs loaded");
        Ok(())
    }

    async fn read_record(&self, key: &str) -> Result<Option<RotationJob>, StorageError> {
        let Some(value) = self.inner.store.get(key).await? else {
            return Ok(None);
        };
        let record: JobRecord = serde_json::from_value(value)?;
        let job = record.into_job(key)?;
        if job.key().storage_key() != key {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("record describes {}", job.key()),
            });
        }
        Ok(Some(job))
    }
}

fn request_key(namespace: &Namespace, mount: &str, path: &str) -> RotationResult<JobKey> {
    let key = JobKey::new(namespace, mount, path);
    if key.mount.mount.is_empty() {
        return Err(RotationError::invalid_request(MOUNT_POINT_REQUIRED));
    }
    if key.path.is_empty() {
        return Err(RotationError::invalid_request(REQ_PATH_REQUIRED));
    }
    Ok(key)
}

fn first_fire(params: &RotationParams, now: DateTime<Utc>) -> RotationResult<DateTime<Utc>> {
    params.next_from(now).ok_or_else(|| {
        FieldError::InvalidSchedule {
            expression: params.schedule().map(ToString::to_string).unwrap_or_default(),
            reason: "no future occurrence".to_string(),
        }
        .into()
    })
}

/// Body of a broker `rotation` invocation
#[derive(Debug, Deserialize)]
struct BrokerRotateRequest {
    #[serde(default)]
    namespace: Option<String>,
    mount_point: String,
    req_path: String,
}

/// Serve out-of-band rotation requests routed by the broker
async fn serve_broker(manager: RotationManager, mut listener: Listener) {
    let shutdown = manager.inner.shutdown.clone();
    loop {
        let invocation = tokio::select! {
            () = shutdown.cancelled() => break,
            invocation = listener.accept() => match invocation {
                Some(invocation) => invocation,
                None => break,
            },
        };
        let request = match serde_json::from_str::<BrokerRotateRequest>(&invocation.message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, severity = %invocation.severity, "malformed broker rotation request");
                continue;
            }
        };
        let namespace = match Namespace::new(request.namespace.unwrap_or_default()) {
            Ok(namespace) => namespace,
            Err(e) => {
                warn!(error = %e, "broker rotation request names an invalid namespace");
                continue;
            }
        };
        match manager
            .rotate_now(&namespace, &request.mount_point, &request.req_path)
            .await
        {
            Ok(info) => debug!(job_id = %info.rotation_id, "broker requested rotation"),
            Err(e) => warn!(
                mount = %request.mount_point,
                path = %request.req_path,
                kind = ?e.kind(),
                error = %e,
                "broker rotation request refused"
            ),
        }
    }
    debug!("broker rotation bridge stopped");
}
