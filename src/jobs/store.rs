//! Node-local job persistence

use super::{Job, JobStatus};
use crate::error::{BridgeError, BridgeResult};
use crate::state::{KvStore, PrefixedStore};

use std::sync::Arc;
use tracing::debug;

pub struct JobStore {
    store: PrefixedStore,
}

impl JobStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            store: PrefixedStore::new(backend, "job/"),
        }
    }

    /// Persist a job unless one with the same id exists. Returns whether it was stored.
    pub fn save_new_job(&self, job: &Job) -> BridgeResult<bool> {
        if self.store.exists(&job.job_id)? {
            debug!("Job {} already scheduled", job.job_id);
            return Ok(false);
        }
        self.write(job)?;
        debug!("Scheduled job {}", job.job_id);
        Ok(true)
    }

    /// Overwrite an existing job; a deleted job stays deleted. Returns whether it was written.
    pub fn update_job(&self, job: &Job) -> BridgeResult<bool> {
        if !self.store.exists(&job.job_id)? {
            return Ok(false);
        }
        self.write(job)?;
        Ok(true)
    }

    fn write(&self, job: &Job) -> BridgeResult<()> {
        let bytes = serde_json::to_vec(job)?;
        self.store.set(&job.job_id, &bytes)
    }

    pub fn get_job(&self, job_id: &str) -> BridgeResult<Job> {
        let bytes = self
            .store
            .get(job_id)?
            .ok_or_else(|| BridgeError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn delete_job(&self, job_id: &str) -> BridgeResult<bool> {
        self.store.delete(job_id)
    }

    /// Remove every job of a tracker; returns how many were deleted
    pub fn delete_jobs_for_tracker(&self, tracker_name: &str) -> BridgeResult<usize> {
        let mut deleted = 0;
        for job in self.jobs_for_tracker(tracker_name)? {
            if self.delete_job(&job.job_id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Job ids start with `{tracker}#`, so the prefix scan can also match
    /// trackers whose names extend this one; keep exact owners only.
    pub fn jobs_for_tracker(&self, tracker_name: &str) -> BridgeResult<Vec<Job>> {
        Ok(self
            .decode_all(&format!("{}#", tracker_name))?
            .into_iter()
            .filter(|job| job.tracker_name == tracker_name)
            .collect())
    }

    pub fn list(&self) -> BridgeResult<Vec<Job>> {
        self.decode_all("")
    }

    /// Jobs not yet completed or abandoned
    pub fn pending_jobs(&self) -> BridgeResult<Vec<Job>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|j| matches!(j.status, JobStatus::New | JobStatus::InProgress))
            .collect())
    }

    fn decode_all(&self, prefix: &str) -> BridgeResult<Vec<Job>> {
        self.store
            .values(prefix)?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(BridgeError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::state::MemoryStore;

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_at_most_one_job_per_step() {
        let jobs = store();
        let mut first = Job::eth_broadcast("0xaa");
        assert!(jobs.save_new_job(&first).unwrap());

        first.retry_count = 3;
        let duplicate = Job::eth_broadcast("0xaa");
        assert!(!jobs.save_new_job(&duplicate).unwrap());
        assert!(jobs.update_job(&first).unwrap());
        assert_eq!(jobs.get_job(&first.job_id).unwrap().retry_count, 3);
    }

    #[test]
    fn test_update_does_not_resurrect_deleted_job() {
        let jobs = store();
        let job = Job::btc_broadcast("tracker_1");
        jobs.save_new_job(&job).unwrap();
        assert!(jobs.delete_job(&job.job_id).unwrap());

        assert!(!jobs.update_job(&job).unwrap());
        assert!(matches!(
            jobs.get_job(&job.job_id),
            Err(BridgeError::JobNotFound { .. })
        ));
    }

    #[test]
    fn test_jobs_grouped_by_tracker() {
        let jobs = store();
        let config = JobsConfig::default();
        jobs.save_new_job(&Job::eth_broadcast("0xaa")).unwrap();
        jobs.save_new_job(&Job::eth_check_finality("0xaa", &config)).unwrap();
        jobs.save_new_job(&Job::eth_broadcast("0xaab")).unwrap();

        assert_eq!(jobs.jobs_for_tracker("0xaa").unwrap().len(), 2);

        let mut done = Job::eth_broadcast("0xaab");
        done.status = JobStatus::Completed;
        jobs.update_job(&done).unwrap();
        assert_eq!(jobs.pending_jobs().unwrap().len(), 2);

        assert_eq!(jobs.delete_jobs_for_tracker("0xaa").unwrap(), 2);
        assert_eq!(jobs.list().unwrap().len(), 1);
        assert_eq!(jobs.delete_jobs_for_tracker("0xaa").unwrap(), 0);
    }

    #[test]
    fn test_tracker_jobs_do_not_leak_across_name_prefixes() {
        let jobs = store();
        jobs.save_new_job(&Job::btc_broadcast("a")).unwrap();
        jobs.save_new_job(&Job::btc_broadcast("a#b")).unwrap();

        let owned = jobs.jobs_for_tracker("a").unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].tracker_name, "a");

        assert_eq!(jobs.delete_jobs_for_tracker("a").unwrap(), 1);
        let left = jobs.list().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].tracker_name, "a#b");
    }
}
