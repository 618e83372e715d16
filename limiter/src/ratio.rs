//! Per-instance ratio weights and their demand-driven adjustment.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use coordinator::types::{JobType, ResourceEstimation};

use crate::config::RatioAdjustmentConfig;

/// Queue depth at which a job type counts as under sustained demand.
const DEMAND_THRESHOLD: usize = 1;

/// Additive step applied per adjustment tick.
const ADJUST_STEP: f64 = 0.1;

struct RatioState {
    value: f64,
    min: f64,
    max: f64,
    fixed: bool,
}

/// Holds each job type's weight within its configured bounds. Job types
/// with recent waiting depth gain weight, idle ones lose it; `fixed` pins.
pub struct RatioController {
    state: Mutex<HashMap<JobType, RatioState>>,
}

impl RatioController {
    pub fn from_estimations(
        estimations: &HashMap<JobType, ResourceEstimation>,
        adjustment: &RatioAdjustmentConfig,
    ) -> Self {
        let state = estimations
            .iter()
            .map(|(job_type, est)| {
                let ratio = est.ratio;
                let value = est.initial_ratio();
                let min = ratio
                    .and_then(|r| r.min)
                    .unwrap_or(adjustment.min_ratio)
                    .max(0.0);
                let max = ratio.and_then(|r| r.max).unwrap_or(adjustment.max_ratio);
                let fixed = ratio.map(|r| r.fixed).unwrap_or(false);
                (
                    job_type.clone(),
                    RatioState {
                        value,
                        min,
                        max,
                        fixed,
                    },
                )
            })
            .collect();

        Self {
            state: Mutex::new(state),
        }
    }

    pub fn current(&self) -> HashMap<JobType, f64> {
        self.state
            .lock()
            .iter()
            .map(|(job, rs)| (job.clone(), rs.value))
            .collect()
    }

    /// One adjustment tick against the sampled waiting depths. Returns the
    /// new ratio map when anything moved, `None` otherwise.
    pub fn adjust(&self, waiting_depth: &HashMap<JobType, usize>) -> Option<HashMap<JobType, f64>> {
        let mut state = self.state.lock();
        let mut changed = false;

        for (job_type, rs) in state.iter_mut() {
            if rs.fixed {
                continue;
            }
            let depth = waiting_depth.get(job_type).copied().unwrap_or(0);
            let next = if depth >= DEMAND_THRESHOLD {
                (rs.value + ADJUST_STEP).min(rs.max)
            } else {
                (rs.value - ADJUST_STEP).max(rs.min)
            };
            if (next - rs.value).abs() > f64::EPSILON {
                debug!(job_type = %job_type, depth, from = rs.value, to = next, "ratio adjusted");
                rs.value = next;
                changed = true;
            }
        }

        changed.then(|| {
            state
                .iter()
                .map(|(job, rs)| (job.clone(), rs.value))
                .collect()
        })
    }
}
