//! Session client handle

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tumbler_core::Clock;

use crate::config::SessionConfig;
use crate::driver::{self, Action};
use crate::error::SessionError;
use crate::frame::{Connect, Handshake, HandshakeAck};
use crate::listener::{Invocation, Listener};
use crate::status::{LastError, SessionStatus};
use crate::transport::Connector;

struct ListenerSlot {
    id: u64,
    tx: mpsc::Sender<Invocation>,
}

struct ActionSlot {
    generation: u64,
    tx: mpsc::Sender<Action>,
}

/// State shared between the handle, the driver task and listeners
pub(crate) struct Shared {
    pub(crate) config: SessionConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) clock: Arc<dyn Clock>,
    meta: RwLock<BTreeMap<String, String>>,
    listeners: RwLock<BTreeMap<String, ListenerSlot>>,
    status: watch::Sender<SessionStatus>,
    last_error: RwLock<Option<LastError>>,
    session_id: RwLock<Option<String>>,
    actions: Mutex<Option<ActionSlot>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_listener_id: AtomicU64,
    next_generation: AtomicU64,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("service", &self.config.service)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!(from = %current, to = %status, "session status changed");
                *current = status;
                true
            }
        });
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub(crate) fn record_error(&self, error: &SessionError) {
        *self.last_error.write() = Some(LastError {
            at: self.clock.now(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    pub(crate) fn on_established(&self, ack: &HandshakeAck) {
        *self.session_id.write() = Some(ack.session_id.clone());
        *self.last_error.write() = None;
    }

    /// Called by a driver on exit so a later `start` spawns a fresh one
    pub(crate) fn detach(&self, generation: u64) {
        let mut actions = self.actions.lock();
        if actions.as_ref().is_some_and(|slot| slot.generation == generation) {
            *actions = None;
        }
    }

    pub(crate) fn clear_session(&self) {
        *self.session_id.write() = None;
    }

    pub(crate) fn handshake_frame(&self) -> Handshake {
        Handshake {
            service: self.config.service.clone(),
            resource: self.config.resource.clone(),
            access_token: self.config.access_token.expose_secret().to_string(),
            capabilities: self.listeners.read().keys().cloned().collect(),
            meta: self.meta.read().clone(),
        }
    }

    /// Hand an inbound frame to the listener of its capability
    pub(crate) fn route(&self, connect: Connect) {
        let slot = self
            .listeners
            .read()
            .get(&connect.capability)
            .map(|slot| (slot.id, slot.tx.clone()));

        let Some((id, tx)) = slot else {
            warn!(capability = %connect.capability, "no listener for inbound invocation");
            return;
        };

        let invocation = Invocation {
            capability: connect.capability,
            meta: connect.meta,
            severity: connect.severity,
            message: connect.message,
            received_at: self.clock.now(),
        };
        match tx.try_send(invocation) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(inv)) => {
                warn!(capability = %inv.capability, "listener queue full; invocation dropped");
            }
            Err(mpsc::error::TrySendError::Closed(inv)) => {
                debug!(capability = %inv.capability, "listener dropped; removing");
                self.remove_listener(&inv.capability, id);
            }
        }
    }

    pub(crate) fn unlisten(&self, capability: &str, id: u64) {
        if self.remove_listener(capability, id) {
            info!(capability, "listener closed");
            self.request(Action::Rehandshake);
        }
    }

    fn remove_listener(&self, capability: &str, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.get(capability).is_some_and(|slot| slot.id == id) {
            listeners.remove(capability);
            true
        } else {
            false
        }
    }

    /// Post an action to the driver; a full channel coalesces the request
    pub(crate) fn request(&self, action: Action) {
        let actions = self.actions.lock();
        let Some(slot) = actions.as_ref() else {
            return;
        };
        match slot.tx.try_send(action) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(action)) => {
                debug!(?action, "driver busy; action coalesced");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Client for the broker session
///
/// Cheap to clone; every clone drives the same session.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use tumbler_core::SystemClock;
/// use tumbler_session::{SessionClient, SessionConfig, TcpConnector};
///
/// # async fn run() {
/// let client = SessionClient::new(
///     SessionConfig::new("vault", "node-1", "token"),
///     Arc::new(TcpConnector::new("broker.internal:7300")),
///     Arc::new(SystemClock),
/// );
/// let mut rotations = client.listen("rotation");
/// client.start();
/// while let Some(invocation) = rotations.accept().await {
///     println!("{}", invocation.message);
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

impl SessionClient {
    /// Create a stopped client
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config: config.normalized(),
                connector,
                clock,
                meta: RwLock::new(BTreeMap::new()),
                listeners: RwLock::new(BTreeMap::new()),
                status,
                last_error: RwLock::new(None),
                session_id: RwLock::new(None),
                actions: Mutex::new(None),
                driver: Mutex::new(None),
                next_listener_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn the driver task. No-op while a driver is running; after a stop
    /// or a no-retry disconnect this starts a fresh driver.
    pub fn start(&self) {
        let mut actions = self.shared.actions.lock();
        if actions.is_some() {
            return;
        }
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.action_buffer);
        *actions = Some(ActionSlot { generation, tx });
        let handle = tokio::spawn(driver::run(Arc::clone(&self.shared), rx, generation));
        *self.shared.driver.lock() = Some(handle);
        info!(service = %self.shared.config.service, "session client started");
    }

    /// Stop the driver and wait for it to exit. Status ends `disconnected`.
    pub async fn stop(&self) {
        let slot = self.shared.actions.lock().take();
        if let Some(slot) = slot {
            let _ = slot.tx.send(Action::Stop).await;
        }
        let handle = self.shared.driver.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "session driver ended abnormally");
        }
        self.shared.clear_session();
        self.shared.set_status(SessionStatus::Disconnected);
        info!(service = %self.shared.config.service, "session client stopped");
    }

    /// Drop the current connection and reconnect after the usual backoff
    pub fn reconnect(&self) {
        self.shared.request(Action::Disconnect);
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Watch lifecycle changes
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Most recent failure, `None` after a successful handshake
    pub fn last_error(&self) -> Option<LastError> {
        self.shared.last_error.read().clone()
    }

    /// Broker-assigned id of the live session
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().clone()
    }

    /// Replace all metadata and re-handshake
    pub fn update_meta(&self, meta: BTreeMap<String, String>) {
        *self.shared.meta.write() = meta;
        self.shared.request(Action::Rehandshake);
    }

    /// Set one metadata entry and re-handshake
    pub fn add_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.shared.meta.write().insert(key.into(), value.into());
        self.shared.request(Action::Rehandshake);
    }

    /// Remove one metadata entry; re-handshakes only when it existed
    pub fn delete_meta(&self, key: &str) {
        let removed = self.shared.meta.write().remove(key).is_some();
        if removed {
            self.shared.request(Action::Rehandshake);
        }
    }

    /// Snapshot of the metadata announced to the broker
    pub fn get_meta(&self) -> BTreeMap<String, String> {
        self.shared.meta.read().clone()
    }

    /// Listen for invocations on `capability` and announce it to the broker.
    /// A second call for the same capability replaces the previous listener.
    pub fn listen(&self, capability: impl Into<String>) -> Listener {
        let capability = capability.into();
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.listener_buffer);
        self.shared
            .listeners
            .write()
            .insert(capability.clone(), ListenerSlot { id, tx });
        info!(capability = %capability, "listening for broker invocations");
        self.shared.request(Action::Rehandshake);
        Listener::new(capability, id, rx, Arc::clone(&self.shared))
    }
}
