//! Session state machine
//!
//! One task owns the transport. It reacts to three inputs: frames from the
//! broker, the refresh timer and the action channel (`Rehandshake`,
//! `Disconnect`, `Stop`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tumbler_core::add_duration;

use crate::client::Shared;
use crate::error::{SessionError, SessionErrorKind};
use crate::frame::{Disconnect, Frame, HandshakeAck};
use crate::status::SessionStatus;
use crate::transport::Transport;

/// Consecutive identical failures logged at WARN before dropping to DEBUG
const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Floor for the refresh timer so an already-expired ack cannot spin the loop
const MIN_REFRESH_DELAY: TimeDelta = TimeDelta::seconds(1);

/// Requests posted to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Re-send the handshake (meta or capabilities changed)
    Rehandshake,
    /// Drop the transport and reconnect after backoff
    Disconnect,
    /// Exit the driver
    Stop,
}

/// Why a connection attempt ended
enum Exit {
    Stop,
    Terminal,
    Retry { backoff: Option<Duration> },
}

/// Something that cut a handshake short
enum Interrupt {
    Error(SessionError),
    Directive(Disconnect),
}

impl From<SessionError> for Interrupt {
    fn from(error: SessionError) -> Self {
        Self::Error(error)
    }
}

/// Tracks repeated failures of the same kind to keep reconnect loops quiet
struct ErrorTracker {
    last_kind: Option<SessionErrorKind>,
    consecutive: u32,
}

impl ErrorTracker {
    fn new() -> Self {
        Self {
            last_kind: None,
            consecutive: 0,
        }
    }

    fn record(&mut self, kind: SessionErrorKind) -> bool {
        let should_warn =
            self.last_kind != Some(kind) || self.consecutive < MAX_CONSECUTIVE_SAME_ERROR;
        if self.last_kind == Some(kind) {
            self.consecutive += 1;
        } else {
            self.last_kind = Some(kind);
            self.consecutive = 1;
        }
        should_warn
    }

    fn reset(&mut self) {
        if self.consecutive > 0 {
            info!(
                consecutive_failures = self.consecutive,
                "broker session recovered"
            );
        }
        self.last_kind = None;
        self.consecutive = 0;
    }
}

/// Driver entry point; returns when stopped or terminally disconnected
pub(crate) async fn run(shared: Arc<Shared>, mut actions: mpsc::Receiver<Action>, generation: u64) {
    let mut tracker = ErrorTracker::new();

    loop {
        shared.set_status(SessionStatus::Connecting);
        match session(&shared, &mut actions, &mut tracker).await {
            Exit::Stop | Exit::Terminal => break,
            Exit::Retry { backoff } => {
                let delay = backoff.unwrap_or_else(|| reconnect_delay(&shared));
                let deadline = add_duration(shared.clock.now(), delay);
                shared.set_status(SessionStatus::Waiting);
                debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                if !wait_until(&shared, &mut actions, deadline).await {
                    break;
                }
            }
        }
    }

    shared.detach(generation);
    shared.clear_session();
    shared.set_status(SessionStatus::Disconnected);
    debug!("session driver exited");
}

/// One connection: connect, handshake, then serve until something ends it
async fn session(
    shared: &Shared,
    actions: &mut mpsc::Receiver<Action>,
    tracker: &mut ErrorTracker,
) -> Exit {
    let mut rehandshake_pending = false;

    let established = {
        let attempt = with_timeout(shared, establish(shared));
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => break result,
                action = actions.recv() => match action {
                    Some(Action::Rehandshake) => rehandshake_pending = true,
                    Some(Action::Disconnect) => return Exit::Retry { backoff: None },
                    Some(Action::Stop) | None => return Exit::Stop,
                },
            }
        }
    };

    let (mut transport, ack) = match established {
        Ok(established) => established,
        Err(Interrupt::Error(e)) => {
            fail(shared, tracker, &e);
            return Exit::Retry { backoff: None };
        }
        Err(Interrupt::Directive(directive)) => {
            return obey(shared, actions, directive).await;
        }
    };

    tracker.reset();
    let mut refresh_at = accept(shared, &ack);
    info!(session_id = %ack.session_id, "broker session established");

    let mut renew_now = rehandshake_pending;
    loop {
        if renew_now {
            match renew(shared, transport.as_mut(), actions).await {
                Renewal::Renewed(next) => refresh_at = next,
                Renewal::Failed(interrupt) => {
                    return abandon(shared, transport, tracker, actions, interrupt).await;
                }
                Renewal::Reconnect => {
                    let _ = transport.close().await;
                    return Exit::Retry { backoff: None };
                }
                Renewal::Stopped => {
                    let _ = transport.close().await;
                    return Exit::Stop;
                }
            }
        }

        renew_now = tokio::select! {
            frame = transport.recv() => match frame {
                Ok(Some(Frame::Connect(connect))) => {
                    shared.route(connect);
                    false
                }
                Ok(Some(Frame::Disconnect(directive))) => {
                    let _ = transport.close().await;
                    return obey(shared, actions, directive).await;
                }
                Ok(Some(other)) => {
                    debug!(frame = other.kind(), "ignoring unexpected frame");
                    false
                }
                Ok(None) => {
                    fail(shared, tracker, &SessionError::transport("broker closed the connection", None));
                    return Exit::Retry { backoff: None };
                }
                Err(e) => {
                    fail(shared, tracker, &e);
                    let _ = transport.close().await;
                    return Exit::Retry { backoff: None };
                }
            },
            () = shared.clock.sleep_until(refresh_at) => {
                debug!("session refresh due");
                true
            }
            action = actions.recv() => match action {
                Some(Action::Rehandshake) => true,
                Some(Action::Disconnect) => {
                    info!("reconnect requested");
                    let _ = transport.close().await;
                    return Exit::Retry { backoff: None };
                }
                Some(Action::Stop) | None => {
                    let _ = transport.close().await;
                    return Exit::Stop;
                }
            },
        };
    }
}

/// Outcome of a re-handshake on the live transport
enum Renewal {
    Renewed(DateTime<Utc>),
    Failed(Interrupt),
    Reconnect,
    Stopped,
}

/// Re-handshake while still honoring actions. Rehandshake requests that
/// arrive mid-flight are folded into one more round.
async fn renew(
    shared: &Shared,
    transport: &mut (dyn Transport + 'static),
    actions: &mut mpsc::Receiver<Action>,
) -> Renewal {
    loop {
        let mut again = false;
        let outcome = {
            let attempt = rehandshake(shared, &mut *transport);
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    action = actions.recv() => match action {
                        Some(Action::Rehandshake) => again = true,
                        Some(Action::Disconnect) => return Renewal::Reconnect,
                        Some(Action::Stop) | None => return Renewal::Stopped,
                    },
                }
            }
        };
        match outcome {
            Ok(next) if !again => return Renewal::Renewed(next),
            Ok(_) => {}
            Err(interrupt) => return Renewal::Failed(interrupt),
        }
    }
}

/// Open a transport and perform the first handshake
async fn establish(shared: &Shared) -> Result<(Box<dyn Transport>, HandshakeAck), Interrupt> {
    let mut transport = shared.connector.connect().await?;
    let ack = handshake(shared, transport.as_mut()).await?;
    Ok((transport, ack))
}

/// Send a handshake and wait for its acknowledgement
async fn handshake(
    shared: &Shared,
    transport: &mut (dyn Transport + 'static),
) -> Result<HandshakeAck, Interrupt> {
    transport.send(Frame::Handshake(shared.handshake_frame())).await?;
    loop {
        match transport.recv().await? {
            Some(Frame::HandshakeAck(ack)) if ack.authenticated => return Ok(ack),
            Some(Frame::HandshakeAck(ack)) => {
                return Err(Interrupt::Error(SessionError::InvalidCredentials {
                    reason: ack
                        .reason
                        .unwrap_or_else(|| "authentication failed".to_string()),
                }));
            }
            Some(Frame::Connect(connect)) => shared.route(connect),
            Some(Frame::Disconnect(directive)) => return Err(Interrupt::Directive(directive)),
            Some(Frame::Handshake(_)) => debug!("ignoring handshake frame from broker"),
            None => {
                return Err(Interrupt::Error(SessionError::transport(
                    "broker closed the connection during handshake",
                    None,
                )));
            }
        }
    }
}

/// Re-handshake on the live transport; returns the next refresh deadline
async fn rehandshake(
    shared: &Shared,
    transport: &mut (dyn Transport + 'static),
) -> Result<DateTime<Utc>, Interrupt> {
    let ack = with_timeout(shared, handshake(shared, transport)).await?;
    debug!(session_id = %ack.session_id, "session renewed");
    Ok(accept(shared, &ack))
}

/// Tear down the transport after a failed re-handshake
async fn abandon(
    shared: &Shared,
    mut transport: Box<dyn Transport>,
    tracker: &mut ErrorTracker,
    actions: &mut mpsc::Receiver<Action>,
    interrupt: Interrupt,
) -> Exit {
    let _ = transport.close().await;
    match interrupt {
        Interrupt::Error(e) => {
            fail(shared, tracker, &e);
            Exit::Retry { backoff: None }
        }
        Interrupt::Directive(directive) => obey(shared, actions, directive).await,
    }
}

/// How the driver continues after a directive
fn directive_exit(directive: Disconnect) -> Exit {
    if directive.no_retry {
        Exit::Terminal
    } else {
        Exit::Retry {
            backoff: (directive.backoff_seconds > 0)
                .then(|| Duration::from_secs(directive.backoff_seconds)),
        }
    }
}

/// Apply a `disconnect` directive received outside a re-handshake
async fn obey(shared: &Shared, actions: &mut mpsc::Receiver<Action>, directive: Disconnect) -> Exit {
    record_directive(shared, &directive);
    if directive.no_retry {
        let deadline = add_duration(shared.clock.now(), shared.config.disconnect_delay);
        shared.set_status(SessionStatus::Waiting);
        let _ = wait_until(shared, actions, deadline).await;
        return Exit::Terminal;
    }
    directive_exit(directive)
}

fn record_directive(shared: &Shared, directive: &Disconnect) {
    let error = if directive.no_retry {
        SessionError::PermissionDenied {
            reason: directive.reason.clone(),
        }
    } else {
        SessionError::transport(
            format!("broker requested disconnect: {}", directive.reason),
            None,
        )
    };
    shared.record_error(&error);
    warn!(
        no_retry = directive.no_retry,
        backoff_seconds = directive.backoff_seconds,
        reason = %directive.reason,
        "broker disconnected the session"
    );
}

/// Store the ack and compute the refresh deadline before announcing `connected`
fn accept(shared: &Shared, ack: &HandshakeAck) -> DateTime<Utc> {
    let now = shared.clock.now();
    let expiry = DateTime::from_timestamp(ack.expiry_unix, 0).unwrap_or(now);
    let refresh_at = refresh_deadline(now, expiry, shared.config.refresh_ratio);
    shared.on_established(ack);
    shared.set_status(SessionStatus::Connected);
    refresh_at
}

fn fail(shared: &Shared, tracker: &mut ErrorTracker, error: &SessionError) {
    shared.record_error(error);
    if tracker.record(error.kind()) {
        warn!(error = %error, kind = ?error.kind(), "broker session failed; will retry");
    } else {
        debug!(
            error = %error,
            consecutive_failures = tracker.consecutive,
            "broker session failed again"
        );
    }
}

/// Sleep on the injected clock while still honoring `Stop`.
/// Returns `false` when the driver should exit.
async fn wait_until(
    shared: &Shared,
    actions: &mut mpsc::Receiver<Action>,
    deadline: DateTime<Utc>,
) -> bool {
    let sleep = shared.clock.sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            action = actions.recv() => match action {
                Some(Action::Stop) | None => return false,
                // the next connect picks up current meta and capabilities
                Some(Action::Rehandshake | Action::Disconnect) => {}
            },
        }
    }
}

async fn with_timeout<T>(
    shared: &Shared,
    fut: impl Future<Output = Result<T, Interrupt>>,
) -> Result<T, Interrupt> {
    let timeout = shared.config.handshake_timeout;
    let deadline = add_duration(shared.clock.now(), timeout);
    tokio::select! {
        result = fut => result,
        () = shared.clock.sleep_until(deadline) => Err(Interrupt::Error(SessionError::HandshakeTimeout(timeout))),
    }
}

/// `base + uniform[0, jitter)`
fn reconnect_delay(shared: &Shared) -> Duration {
    use rand::Rng;

    let base = shared.config.reconnect_backoff;
    let jitter_ms = shared.config.reconnect_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
}

/// `now + ratio * (expiry - now)`, never earlier than `now + 1s`
pub(crate) fn refresh_deadline(
    now: DateTime<Utc>,
    expiry: DateTime<Utc>,
    ratio: f64,
) -> DateTime<Utc> {
    let lifetime_ms = (expiry - now).num_milliseconds();
    let delay = TimeDelta::milliseconds((lifetime_ms as f64 * ratio) as i64);
    now + delay.max(MIN_REFRESH_DELAY)
}
