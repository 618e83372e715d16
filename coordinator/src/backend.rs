//! Backend driver seam: the atomic scripts every coordinator implementation
//! must expose. Each call maps to one server-side script and is atomic with
//! respect to every other call.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{
    AllocationSnapshot, AllocationUpdate, CostVector, InstanceId, JobType, ModelId,
    ModelUsageSnapshot, QuotaKind,
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("instance not registered: {0}")]
    NotRegistered(InstanceId),

    #[error("unknown model: {0}")]
    UnknownModel(ModelId),

    /// Transport-level failure talking to the coordinator. The scheduler
    /// treats this like quota exhaustion on the current model and escalates.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

/// Result of the admission script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    /// Every partial increment was rolled back; `kind` is the quota that
    /// refused the cost.
    Rejected {
        kind: QuotaKind,
        current: u64,
        limit: u64,
    },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<InstanceId>,
    pub surviving: u32,
}

/// The coordinator protocol.
///
/// `RELEASE` from the protocol's point of view is `reconcile` (refund or
/// overage against the decaying windows) followed by `release_concurrent`
/// (in-flight decrement); the concurrent kind never participates in refunds.
#[async_trait]
pub trait CoordinatorBackend: Send + Sync {
    /// Register (or re-register) an instance, recompute the allocation and
    /// publish it. Returns the caller's own slot table.
    async fn register(
        &self,
        instance_id: &str,
        ratios: HashMap<JobType, f64>,
        now_ms: u64,
    ) -> Result<AllocationSnapshot, CoordinatorError>;

    /// Remove an instance and reallocate. Idempotent; once the last instance
    /// leaves, all per-model usage is purged.
    async fn unregister(&self, instance_id: &str, now_ms: u64)
    -> Result<(), CoordinatorError>;

    /// Refresh liveness. Fails with [`CoordinatorError::NotRegistered`] when
    /// the instance has been purged, in which case the caller must
    /// re-register.
    async fn heartbeat(&self, instance_id: &str, now_ms: u64) -> Result<(), CoordinatorError>;

    /// Purge instances whose heartbeat expired and reallocate.
    async fn cleanup(&self, now_ms: u64) -> Result<CleanupReport, CoordinatorError>;

    /// All-or-nothing admission of `cost` against every quota kind the model
    /// configures.
    async fn acquire(
        &self,
        model_id: &str,
        cost: &CostVector,
        now_ms: u64,
    ) -> Result<AcquireOutcome, CoordinatorError>;

    /// Adjust the decaying windows from estimated to actual usage: refunds
    /// are taken only from still-live window entries, overages are appended
    /// at `now_ms` and may push usage past the nominal limit.
    async fn reconcile(
        &self,
        model_id: &str,
        actual: &CostVector,
        estimated: &CostVector,
        now_ms: u64,
    ) -> Result<(), CoordinatorError>;

    /// Drop one in-flight request from the model's concurrent gauge.
    async fn release_concurrent(
        &self,
        model_id: &str,
        now_ms: u64,
    ) -> Result<(), CoordinatorError>;

    /// REGISTER-style ratio write; recomputes and publishes the allocation.
    async fn update_ratios(
        &self,
        instance_id: &str,
        ratios: HashMap<JobType, f64>,
        now_ms: u64,
    ) -> Result<(), CoordinatorError>;

    /// Observer query used by stats.
    async fn model_usage(
        &self,
        model_id: &str,
        now_ms: u64,
    ) -> Result<ModelUsageSnapshot, CoordinatorError>;

    /// Allocation-change feed. Subscribers apply updates in version order
    /// and ignore anything at or below their cached version.
    fn subscribe(&self) -> broadcast::Receiver<AllocationUpdate>;
}
