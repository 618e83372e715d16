//! Live set of jobs currently inside `queue_job`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    WaitingForCapacity,
    WaitingForModel,
    Processing,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub queued_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub current_model_id: Option<String>,
    pub tried_models: Vec<String>,
    pub wait_started_at_ms: Option<u64>,
    pub max_wait_ms: Option<u64>,
    pub timeout_at_ms: Option<u64>,
}

impl ActiveJob {
    pub fn new(job_id: String, job_type: String, queued_at_ms: u64) -> Self {
        Self {
            job_id,
            job_type,
            status: JobStatus::WaitingForCapacity,
            queued_at_ms,
            started_at_ms: None,
            current_model_id: None,
            tried_models: Vec::new(),
            wait_started_at_ms: None,
            max_wait_ms: None,
            timeout_at_ms: None,
        }
    }
}

/// Mutated only through this interface; snapshots are cheap clones.
#[derive(Default)]
pub struct ActiveJobs {
    inner: Mutex<HashMap<String, ActiveJob>>,
}

impl ActiveJobs {
    pub fn insert(&self, job: ActiveJob) {
        self.inner.lock().insert(job.job_id.clone(), job);
    }

    pub fn update(&self, job_id: &str, f: impl FnOnce(&mut ActiveJob)) {
        if let Some(job) = self.inner.lock().get_mut(job_id) {
            f(job);
        }
    }

    pub fn remove(&self, job_id: &str) -> Option<ActiveJob> {
        self.inner.lock().remove(job_id)
    }

    pub fn snapshot(&self) -> Vec<ActiveJob> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Jobs not yet processing, counted per job type. This is the demand
    /// signal the ratio controller samples.
    pub fn waiting_depth_by_type(&self) -> HashMap<String, usize> {
        let guard = self.inner.lock();
        let mut out: HashMap<String, usize> = HashMap::new();
        for job in guard.values() {
            if job.status != JobStatus::Processing {
                *out.entry(job.job_type.clone()).or_default() += 1;
            }
        }
        out
    }

    /// Jobs currently waiting (the scheduler's queue depth).
    pub fn queue_depth(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|j| j.status != JobStatus::Processing)
            .count()
    }
}
