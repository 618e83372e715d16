use std::collections::HashMap;
use std::sync::Arc;

use coordinator::types::{AllocationSnapshot, JobType, ModelConfig, ModelId, ResourceEstimation};

use crate::error::LimiterError;

/// Observer hook fired whenever the cached allocation changes.
pub type SlotsChangeHook = Arc<dyn Fn(&AllocationSnapshot) + Send + Sync>;

/// Demand-driven ratio adjustment.
#[derive(Clone, Debug)]
pub struct RatioAdjustmentConfig {
    pub enabled: bool,

    /// Lower bound a non-fixed ratio may be driven down to. Kept strictly
    /// positive so the adjuster alone can never zero an instance's share.
    pub min_ratio: f64,

    /// Upper bound a non-fixed ratio may be driven up to.
    pub max_ratio: f64,

    /// How often demand is sampled and ratios are republished.
    pub adjust_interval_ms: u64,
}

impl Default for RatioAdjustmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_ratio: 0.1,
            max_ratio: 10.0,
            adjust_interval_ms: 5_000,
        }
    }
}

/// Instance-wide memory budget; each job type's `memory_mb` estimation caps
/// its slots by `total_mb / memory_mb`.
#[derive(Clone, Copy, Debug)]
pub struct MemoryBudget {
    pub total_mb: u64,
}

/// Limiter configuration. Immutable after `start()`.
#[derive(Clone)]
pub struct LimiterConfig {
    /// Quotas and pricing per model.
    pub models: HashMap<ModelId, ModelConfig>,

    /// Default ordered list of models a job walks through. A job request may
    /// override it; an empty effective list fails the job with
    /// `NoModelsAvailable`.
    pub escalation_order: Vec<ModelId>,

    /// Per-job-type cost estimations and ratio weights.
    pub resource_estimations_per_job: HashMap<JobType, ResourceEstimation>,

    pub ratio_adjustment: RatioAdjustmentConfig,

    pub memory: Option<MemoryBudget>,

    /// Per-model wait budget when the job request does not carry one.
    pub default_max_wait_ms: u64,

    /// Cadence of liveness pings to the coordinator. Must be comfortably
    /// below `heartbeat_timeout_ms` or other instances will reap us between
    /// pings.
    pub heartbeat_interval_ms: u64,

    /// How stale a heartbeat may be before an instance counts as dead.
    pub heartbeat_timeout_ms: u64,

    /// Cadence of the dead-instance sweep. Whichever instance's timer fires
    /// first does the work; the script is idempotent.
    pub cleanup_interval_ms: u64,

    pub on_available_slots_change: Option<SlotsChangeHook>,
}

impl std::fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("escalation_order", &self.escalation_order)
            .field(
                "job_types",
                &self.resource_estimations_per_job.keys().collect::<Vec<_>>(),
            )
            .field("default_max_wait_ms", &self.default_max_wait_ms)
            .finish_non_exhaustive()
    }
}

impl LimiterConfig {
    pub fn new(
        models: HashMap<ModelId, ModelConfig>,
        escalation_order: Vec<ModelId>,
        resource_estimations_per_job: HashMap<JobType, ResourceEstimation>,
    ) -> Self {
        Self {
            models,
            escalation_order,
            resource_estimations_per_job,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            memory: None,
            default_max_wait_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            cleanup_interval_ms: 10_000,
            on_available_slots_change: None,
        }
    }

    /// Reject configurations that cannot produce a working instance.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.models.is_empty() {
            return Err(LimiterError::InvalidConfig("no models configured".into()));
        }
        if self.resource_estimations_per_job.is_empty() {
            return Err(LimiterError::InvalidConfig(
                "no job type estimations configured".into(),
            ));
        }

        for (model_id, model) in &self.models {
            if model.quota_limits().is_empty() {
                return Err(LimiterError::InvalidConfig(format!(
                    "model {model_id} configures no quota kinds"
                )));
            }
        }

        for model_id in &self.escalation_order {
            if !self.models.contains_key(model_id) {
                return Err(LimiterError::InvalidConfig(format!(
                    "escalation order references unknown model {model_id}"
                )));
            }
        }

        for (job_type, est) in &self.resource_estimations_per_job {
            if let Some(ratio) = est.ratio {
                if ratio.initial_value < 0.0 {
                    return Err(LimiterError::InvalidConfig(format!(
                        "job type {job_type} has a negative initial ratio"
                    )));
                }
                let min = ratio.min.unwrap_or(self.ratio_adjustment.min_ratio);
                let max = ratio.max.unwrap_or(self.ratio_adjustment.max_ratio);
                if min > max {
                    return Err(LimiterError::InvalidConfig(format!(
                        "job type {job_type} ratio bounds are inverted (min > max)"
                    )));
                }
            }
            if self.memory.is_some() && est.memory_mb == Some(0) {
                return Err(LimiterError::InvalidConfig(format!(
                    "job type {job_type} estimates zero memory under a memory budget"
                )));
            }
        }

        if self.ratio_adjustment.enabled {
            if self.ratio_adjustment.min_ratio <= 0.0 {
                return Err(LimiterError::InvalidConfig(
                    "ratio adjustment requires a positive min_ratio".into(),
                ));
            }
            if self.ratio_adjustment.min_ratio > self.ratio_adjustment.max_ratio {
                return Err(LimiterError::InvalidConfig(
                    "ratio adjustment bounds are inverted".into(),
                ));
            }
            if self.ratio_adjustment.adjust_interval_ms == 0 {
                return Err(LimiterError::InvalidConfig(
                    "ratio adjustment interval must be positive".into(),
                ));
            }
        }

        if let Some(memory) = self.memory {
            if memory.total_mb == 0 {
                return Err(LimiterError::InvalidConfig(
                    "memory budget must be positive".into(),
                ));
            }
        }

        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.heartbeat_timeout_ms
        {
            return Err(LimiterError::InvalidConfig(
                "heartbeat interval must be positive and below the timeout".into(),
            ));
        }

        Ok(())
    }
}
