//! Observer surface: current counters and remaining budgets.

use serde::Serialize;

use coordinator::types::ModelUsageSnapshot;

use crate::jobs::ActiveJob;
use crate::pool::PairSlotsView;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub active_jobs: Vec<ActiveJob>,
    pub queue_depth: usize,
    /// Local slot table: capacity, in-use and waiting per (jobType, model).
    pub slots: Vec<PairSlotsView>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub instance_id: String,
    pub instance_count: u32,
    pub allocation_version: u64,
    pub models: Vec<ModelUsageSnapshot>,
    pub scheduler: SchedulerStats,
}
