//! Job tables guarded by the manager lock

use std::collections::HashMap;

use tokio::sync::watch;

use crate::error::{RotationError, StorageResult};
use crate::job::{JobId, JobKey, JobRecord, JobState, RotationJob};
use crate::queue::RotationQueue;
use crate::store::Store;

/// Everything the dispatcher and the public calls mutate together
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) jobs: HashMap<JobId, RotationJob>,
    pub(crate) by_path: HashMap<JobKey, JobId>,
    pub(crate) queue: RotationQueue,
    /// Jobs a worker is rotating; the sender flips to `true` when it is done
    pub(crate) in_flight: HashMap<JobId, watch::Sender<bool>>,
}

impl State {
    pub(crate) fn get(&self, key: &JobKey) -> Option<&RotationJob> {
        self.by_path.get(key).and_then(|id| self.jobs.get(id))
    }

    /// Insert or replace a job; queued unless a worker holds it
    pub(crate) fn insert(&mut self, job: RotationJob) {
        let id = job.id;
        if job.state == JobState::Running {
            self.queue.remove(&id);
        } else {
            self.queue.push(id, job.next_vault_rotation);
        }
        self.by_path.insert(job.key(), id);
        self.jobs.insert(id, job);
    }

    /// Drop a job from every table
    pub(crate) fn remove(&mut self, id: &JobId) -> Option<RotationJob> {
        let job = self.jobs.remove(id)?;
        let key = job.key();
        if self.by_path.get(&key) == Some(id) {
            self.by_path.remove(&key);
        }
        self.queue.remove(id);
        Some(job)
    }

    /// Move a job to `running` and track it as held by a worker
    pub(crate) fn claim(&mut self, id: JobId) -> Result<(), RotationError> {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.transition(JobState::Running)?;
            self.in_flight.insert(id, watch::Sender::new(false));
        }
        Ok(())
    }

    /// Release a worker's hold and wake anyone waiting on it
    pub(crate) fn release(&mut self, id: &JobId) {
        if let Some(done) = self.in_flight.remove(id) {
            done.send_replace(true);
        }
    }

    /// Waiter for an in-flight rotation of `id`
    pub(crate) fn watch_in_flight(&self, id: &JobId) -> Option<watch::Receiver<bool>> {
        self.in_flight.get(id).map(watch::Sender::subscribe)
    }
}

/// Write the job's record at its storage key
pub(crate) async fn persist(store: &dyn Store, job: &RotationJob) -> StorageResult<()> {
    let value = serde_json::to_value(JobRecord::from(job))?;
    store.put(&job.key().storage_key(), &value).await
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tumbler_core::Namespace;

    use super::*;
    use crate::params::ParsedFields;

    fn job(path: &str) -> RotationJob {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        RotationJob {
            id: JobId::new(now),
            namespace: Namespace::root(),
            mount_point: "db".into(),
            req_path: path.into(),
            params: ParsedFields::new()
                .period(std::time::Duration::from_secs(60))
                .validate()
                .unwrap(),
            last_vault_rotation: None,
            next_vault_rotation: now,
            consecutive_failures: 0,
            state: JobState::Scheduled,
        }
    }

    #[test]
    fn test_insert_remove_keeps_tables_in_step() {
        let mut state = State::default();
        let job = job("a");
        let id = job.id;
        state.insert(job.clone());

        assert!(state.queue.contains(&id));
        assert_eq!(state.get(&job.key()).map(|j| j.id), Some(id));

        assert!(state.remove(&id).is_some());
        assert!(state.jobs.is_empty() && state.by_path.is_empty() && state.queue.is_empty());
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let mut state = State::default();
        let job = job("a");
        let id = job.id;
        state.insert(job);
        state.queue.remove(&id);

        state.claim(id).unwrap();
        assert_eq!(state.jobs[&id].state, JobState::Running);

        let mut waiter = state.watch_in_flight(&id).unwrap();
        state.release(&id);
        assert!(waiter.wait_for(|done| *done).await.is_ok());
        assert!(state.watch_in_flight(&id).is_none());

        // re-inserting a running job keeps it out of the queue
        let running = state.jobs[&id].clone();
        state.insert(running);
        assert!(!state.queue.contains(&id));
    }
}
