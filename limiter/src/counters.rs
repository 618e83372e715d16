use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub jobs_queued: Arc<AtomicU64>,
    pub jobs_completed: Arc<AtomicU64>,
    pub jobs_failed: Arc<AtomicU64>,

    // escalation reasons
    pub escalations: Arc<AtomicU64>,
    pub wait_timeouts: Arc<AtomicU64>,
    pub quota_rejections: Arc<AtomicU64>,
    pub coordinator_errors: Arc<AtomicU64>,

    pub heartbeats_missed: Arc<AtomicU64>,
}
