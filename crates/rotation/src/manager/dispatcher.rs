//! Dispatcher and worker pool
//!
//! The dispatcher waits for the head of the queue to become due, claims
//! every ready job under the manager lock and hands them to a fixed pool of
//! workers over a bounded channel. It never awaits a backend itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tumbler_core::{Namespace, add_duration, truncate_to_second};
use uuid::Uuid;

use super::Inner;
use super::state::{State, persist};
use crate::error::RotationError;
use crate::events::RotationEvent;
use crate::job::{JobId, JobState, RotationJob};
use crate::policy::FailureAction;
use crate::rotator::{CredentialRotator, RotationContext};
use crate::schedule::inside_window;

/// One claimed rotation on its way to a worker
#[derive(Clone)]
pub(super) struct Dispatch {
    id: JobId,
    namespace: Namespace,
    mount_point: String,
    req_path: String,
    attempt: u32,
    timeout: Duration,
    rotator: Arc<dyn CredentialRotator>,
}

pub(super) async fn run(inner: Arc<Inner>) {
    let (tx, rx) = async_channel::bounded::<Dispatch>(inner.config.workers);
    let mut workers = JoinSet::new();
    for worker_id in 0..inner.config.workers {
        workers.spawn(worker(Arc::clone(&inner), rx.clone(), worker_id));
    }
    drop(rx);

    'dispatch: loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let head = inner.state.lock().await.queue.peek();
        let Some(head) = head else {
            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => break,
                () = inner.wakeup.notified() => {}
            }
            continue;
        };

        let now = inner.now();
        if head.next_fire > now {
            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => break,
                () = inner.wakeup.notified() => {}
                () = inner.clock.sleep_until(head.next_fire) => {}
            }
            continue;
        }

        let mut ready = claim_ready(&inner, now).await.into_iter();
        while let Some(dispatch) = ready.next() {
            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => {
                    unclaim(&inner, &dispatch).await;
                    for rest in ready.by_ref() {
                        unclaim(&inner, &rest).await;
                    }
                    break 'dispatch;
                }
                sent = tx.send(dispatch.clone()) => {
                    if sent.is_err() {
                        unclaim(&inner, &dispatch).await;
                        break 'dispatch;
                    }
                }
            }
        }
    }

    tx.close();
    drain(&inner, workers).await;
    debug!("rotation dispatcher stopped");
}

/// Pop every due job; skip closed windows, defer unmounted backends,
/// claim the rest
async fn claim_ready(inner: &Inner, now: DateTime<Utc>) -> Vec<Dispatch> {
    let mut ready = Vec::new();
    let mut state = inner.state.lock().await;

    while let Some(entry) = state.queue.pop_ready(now) {
        let Some(job) = state.jobs.get_mut(&entry.id) else {
            continue;
        };

        if job.state == JobState::Scheduled
            && let Some(schedule) = job.params.schedule()
            && !inside_window(job.next_vault_rotation, job.params.window(), now)
        {
            let missed = job.next_vault_rotation;
            let Some(next) = schedule.next_inside_window(missed, job.params.window(), now) else {
                error!(job_id = %job.id, "schedule has no further occurrences; job parked");
                continue;
            };
            job.next_vault_rotation = next;
            let job = job.clone();
            info!(job_id = %job.id, %missed, %next, "rotation window closed; fire skipped");
            inner.emit(RotationEvent::WindowSkipped {
                id: job.id,
                missed,
                next,
            });
            save(inner, &mut state, job).await;
            continue;
        }

        let mount_key = job.key().mount;
        let mount = inner
            .mounts
            .read()
            .get(&mount_key)
            .map(|m| (Arc::clone(&m.rotator), inner.rotation_timeout(&m.options)));
        let Some((rotator, timeout)) = mount else {
            let next = truncate_to_second(add_duration(now, inner.config.retry_base));
            job.next_vault_rotation = next;
            let job = job.clone();
            debug!(job_id = %job.id, mount = %mount_key, %next, "no backend mounted; rotation deferred");
            inner.emit(RotationEvent::Deferred {
                id: job.id,
                mount: mount_key.to_string(),
                next,
            });
            save(inner, &mut state, job).await;
            continue;
        };

        let dispatch = Dispatch {
            id: job.id,
            namespace: job.namespace.clone(),
            mount_point: job.mount_point.clone(),
            req_path: job.req_path.clone(),
            attempt: job.consecutive_failures + 1,
            timeout,
            rotator,
        };
        if let Err(e) = state.claim(dispatch.id) {
            warn!(job_id = %dispatch.id, error = %e, "job not claimable");
            continue;
        }
        ready.push(dispatch);
    }
    ready
}

/// Persist, then re-queue; a failed write leaves memory authoritative
async fn save(inner: &Inner, state: &mut State, job: RotationJob) {
    if let Err(e) = persist(inner.store.as_ref(), &job).await {
        warn!(job_id = %job.id, error = %e, "failed to persist rotation job");
        inner.emit(RotationEvent::PersistFailed {
            id: job.id,
            error: e.to_string(),
        });
    }
    state.insert(job);
}

/// Give a claimed job back to the queue without running it
async fn unclaim(inner: &Inner, dispatch: &Dispatch) {
    let mut state = inner.state.lock().await;
    state.release(&dispatch.id);
    if let Some(mut job) = state.jobs.get(&dispatch.id).cloned() {
        let back = if job.consecutive_failures == 0 {
            JobState::Scheduled
        } else {
            JobState::CoolingDown
        };
        if let Err(e) = job.transition(back) {
            warn!(job_id = %job.id, error = %e, "could not return job to the queue");
        }
        state.insert(job);
    }
}

async fn worker(inner: Arc<Inner>, rx: async_channel::Receiver<Dispatch>, worker_id: usize) {
    while let Ok(dispatch) = rx.recv().await {
        if inner.shutdown.is_cancelled() {
            unclaim(&inner, &dispatch).await;
            continue;
        }
        let outcome = rotate(&inner, &dispatch).await;
        complete(&inner, &dispatch, outcome).await;
    }
    debug!(worker_id, "rotation worker stopped");
}

async fn rotate(inner: &Inner, dispatch: &Dispatch) -> Result<(), RotationError> {
    let ctx = RotationContext {
        namespace: dispatch.namespace.clone(),
        mount_point: dispatch.mount_point.clone(),
        req_path: dispatch.req_path.clone(),
        job_id: dispatch.id,
        trace_id: Uuid::new_v4(),
        attempt: dispatch.attempt,
        cancellation: inner.shutdown.child_token(),
    };
    debug!(
        job_id = %dispatch.id,
        namespace = %ctx.namespace,
        mount = %ctx.mount_point,
        path = %ctx.req_path,
        attempt = ctx.attempt,
        trace_id = %ctx.trace_id,
        "rotating credential"
    );
    let deadline = add_duration(inner.now(), dispatch.timeout);
    inner.emit(RotationEvent::Started {
        id: dispatch.id,
        attempt: dispatch.attempt,
    });

    tokio::select! {
        biased;
        result = dispatch.rotator.rotate_credential(&ctx, &dispatch.mount_point, &dispatch.req_path) => {
            result.map_err(|source| RotationError::TransientBackend { source })
        }
        () = inner.clock.sleep_until(deadline) => {
            ctx.cancellation.cancel();
            Err(RotationError::Timeout { timeout: dispatch.timeout })
        }
    }
}

/// Record a finished rotation and put the job back in the queue
async fn complete(inner: &Inner, dispatch: &Dispatch, outcome: Result<(), RotationError>) {
    let now = inner.now();
    let mut state = inner.state.lock().await;

    let Some(mut job) = state.jobs.get(&dispatch.id).cloned() else {
        state.release(&dispatch.id);
        debug!(job_id = %dispatch.id, "job deregistered during rotation; result discarded");
        inner.emit(RotationEvent::Discarded { id: dispatch.id });
        return;
    };

    let event = match outcome {
        Ok(()) => {
            let rotated_at = truncate_to_second(now);
            let next = job.params.next_from(rotated_at).unwrap_or(rotated_at);
            job.last_vault_rotation = Some(rotated_at);
            job.next_vault_rotation = next;
            job.consecutive_failures = 0;
            set_state(&mut job, JobState::Scheduled);
            info!(job_id = %job.id, %rotated_at, %next, "credential rotated");
            RotationEvent::Succeeded {
                id: job.id,
                rotated_at,
                next,
            }
        }
        Err(e) => {
            job.consecutive_failures = job.consecutive_failures.saturating_add(1);
            let failures = job.consecutive_failures;
            let action = job
                .params
                .policy()
                .on_failure(failures, inner.config.default_policy_retries);
            let retrying = action == FailureAction::Retry;
            let next = if retrying {
                set_state(&mut job, JobState::CoolingDown);
                truncate_to_second(add_duration(now, inner.config.backoff().jittered(failures)))
            } else {
                set_state(&mut job, JobState::Scheduled);
                job.params.next_from(now).unwrap_or_else(|| truncate_to_second(now))
            };
            job.next_vault_rotation = next;
            warn!(
                job_id = %job.id,
                policy = %job.params.policy(),
                consecutive_failures = failures,
                retrying,
                %next,
                kind = ?e.kind(),
                error = %e,
                "credential rotation failed"
            );
            RotationEvent::Failed {
                id: job.id,
                kind: e.kind(),
                error: e.to_string(),
                consecutive_failures: failures,
                next,
                retrying,
            }
        }
    };

    save(inner, &mut state, job).await;
    state.release(&dispatch.id);
    drop(state);
    inner.emit(event);
    inner.wakeup.notify_one();
}

fn set_state(job: &mut RotationJob, next: JobState) {
    if let Err(e) = job.transition(next) {
        warn!(job_id = %job.id, error = %e, "refusing job state change");
    }
}

/// Wait for workers to drain, abandoning them after the grace period
async fn drain(inner: &Inner, mut workers: JoinSet<()>) {
    let grace = inner.config.shutdown_grace;
    let deadline = add_duration(inner.now(), grace);
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => return,
                Some(Err(e)) if e.is_panic() => error!(error = %e, "rotation worker panicked"),
                Some(_) => {}
            },
            () = inner.clock.sleep_until(deadline) => {
                warn!(?grace, remaining = workers.len(), "shutdown grace elapsed; abandoning rotations");
                workers.abort_all();
                return;
            }
        }
    }
}
