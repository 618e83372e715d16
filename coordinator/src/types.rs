//! Shared data model for models, quotas, estimations and allocations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type ModelId = String;
pub type JobType = String;
pub type InstanceId = String;

/// One enforced quota dimension on a model.
///
/// Per-minute kinds decay over a sliding 60 s window, per-day kinds over a
/// sliding 24 h window; `Concurrent` tracks in-flight requests and does not
/// decay. The declaration order of [`QuotaKind::ALL`] is the order in which
/// the binding-quota minimum is taken, so equal binding counts need no
/// further tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaKind {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
    Concurrent,
}

impl QuotaKind {
    pub const ALL: [QuotaKind; 5] = [
        QuotaKind::RequestsPerMinute,
        QuotaKind::RequestsPerDay,
        QuotaKind::TokensPerMinute,
        QuotaKind::TokensPerDay,
        QuotaKind::Concurrent,
    ];

    /// Sliding-window length, `None` for the non-decaying concurrent kind.
    pub fn window_ms(self) -> Option<u64> {
        match self {
            QuotaKind::RequestsPerMinute | QuotaKind::TokensPerMinute => Some(60_000),
            QuotaKind::RequestsPerDay | QuotaKind::TokensPerDay => Some(86_400_000),
            QuotaKind::Concurrent => None,
        }
    }

    pub fn decays(self) -> bool {
        self.window_ms().is_some()
    }
}

/// Cost per unit of input, cached and output tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input: f64,
    pub cached: f64,
    pub output: f64,
}

/// Quota limits and pricing for one model. Any subset of the quota kinds may
/// be configured; a model with none is rejected at validation time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
    /// Per-model slot wait budget before a job escalates past this model.
    pub max_wait_ms: Option<u64>,
    pub pricing: Option<Pricing>,
}

impl ModelConfig {
    pub fn limit_for(&self, kind: QuotaKind) -> Option<u64> {
        match kind {
            QuotaKind::RequestsPerMinute => self.requests_per_minute,
            QuotaKind::RequestsPerDay => self.requests_per_day,
            QuotaKind::TokensPerMinute => self.tokens_per_minute,
            QuotaKind::TokensPerDay => self.tokens_per_day,
            QuotaKind::Concurrent => self.max_concurrent_requests,
        }
    }

    /// Configured `(kind, limit)` pairs in binding-order.
    pub fn quota_limits(&self) -> Vec<(QuotaKind, u64)> {
        QuotaKind::ALL
            .into_iter()
            .filter_map(|k| self.limit_for(k).map(|limit| (k, limit)))
            .collect()
    }
}

/// Weight bounds for one job type's share of capacity on an instance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatioConfig {
    pub initial_value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub fixed: bool,
}

/// Per-job-type cost estimation used to translate quota limits into slots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEstimation {
    pub estimated_used_tokens: Option<u64>,
    pub estimated_number_of_requests: Option<u64>,
    pub ratio: Option<RatioConfig>,
    pub memory_mb: Option<u64>,
}

impl ResourceEstimation {
    pub fn cost_vector(&self) -> CostVector {
        CostVector {
            tokens: self.estimated_used_tokens.unwrap_or(0),
            requests: self.estimated_number_of_requests.unwrap_or(0),
        }
    }

    /// Starting weight; an absent ratio config means weight 1.0.
    pub fn initial_ratio(&self) -> f64 {
        self.ratio.map(|r| r.initial_value).unwrap_or(1.0)
    }
}

/// Estimated or actual consumption projected onto the quota kinds: tokens
/// feed TPM/TPD, requests feed RPM/RPD, and every job occupies one
/// concurrent slot while in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CostVector {
    pub tokens: u64,
    pub requests: u64,
}

impl CostVector {
    pub const ZERO: CostVector = CostVector {
        tokens: 0,
        requests: 0,
    };

    pub fn cost_for(&self, kind: QuotaKind) -> u64 {
        match kind {
            QuotaKind::RequestsPerMinute | QuotaKind::RequestsPerDay => self.requests,
            QuotaKind::TokensPerMinute | QuotaKind::TokensPerDay => self.tokens,
            QuotaKind::Concurrent => 1,
        }
    }
}

/// Token consumption split by pricing class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub cached: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.cached + self.output
    }
}

/// What a finished (or early-resolved) job actually consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActualUsage {
    pub usage: TokenUsage,
    pub request_count: u64,
}

impl ActualUsage {
    pub fn cost_vector(&self) -> CostVector {
        CostVector {
            tokens: self.usage.total(),
            requests: self.request_count,
        }
    }
}

/// A registered limiter instance as the coordinator sees it.
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub registered_at_ms: u64,
    pub last_heartbeat_at_ms: u64,
    pub ratios: HashMap<JobType, f64>,
}

impl InstanceRecord {
    pub fn is_alive(&self, now_ms: u64, heartbeat_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_at_ms) <= heartbeat_timeout_ms
    }
}

/// jobType -> modelId -> slot count.
pub type SlotTable = HashMap<JobType, HashMap<ModelId, u32>>;

/// One instance's view of the authoritative allocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSnapshot {
    pub version: u64,
    pub instance_count: u32,
    pub slots_by_job_type_and_model: SlotTable,
}

impl AllocationSnapshot {
    pub fn slots_for(&self, job_type: &str, model_id: &str) -> u32 {
        self.slots_by_job_type_and_model
            .get(job_type)
            .and_then(|m| m.get(model_id))
            .copied()
            .unwrap_or(0)
    }
}

/// Published on every allocation change. An instance missing from `tables`
/// has been purged and must re-register before it holds any slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationUpdate {
    pub version: u64,
    pub instance_count: u32,
    pub tables: HashMap<InstanceId, SlotTable>,
}

impl AllocationUpdate {
    pub fn snapshot_for(&self, instance_id: &str) -> AllocationSnapshot {
        AllocationSnapshot {
            version: self.version,
            instance_count: self.instance_count,
            slots_by_job_type_and_model: self
                .tables
                .get(instance_id)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Point-in-time usage of one quota kind on a model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub kind: QuotaKind,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the oldest in-window entry expires; `None` when the window
    /// is empty or the kind does not decay.
    pub resets_in_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyUsage {
    pub active: u64,
    pub limit: Option<u64>,
}

/// Observer view of one model's counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsageSnapshot {
    pub model_id: ModelId,
    pub quotas: Vec<QuotaUsage>,
    pub concurrency: ConcurrencyUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_limits_follow_binding_order() {
        let mc = ModelConfig {
            requests_per_minute: Some(100),
            tokens_per_minute: Some(1_000),
            max_concurrent_requests: Some(5),
            ..Default::default()
        };

        let kinds: Vec<QuotaKind> = mc.quota_limits().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![
                QuotaKind::RequestsPerMinute,
                QuotaKind::TokensPerMinute,
                QuotaKind::Concurrent
            ]
        );
    }

    #[test]
    fn cost_vector_projects_per_kind() {
        let cost = CostVector {
            tokens: 500,
            requests: 3,
        };

        assert_eq!(cost.cost_for(QuotaKind::TokensPerMinute), 500);
        assert_eq!(cost.cost_for(QuotaKind::TokensPerDay), 500);
        assert_eq!(cost.cost_for(QuotaKind::RequestsPerMinute), 3);
        assert_eq!(cost.cost_for(QuotaKind::RequestsPerDay), 3);
        assert_eq!(cost.cost_for(QuotaKind::Concurrent), 1);
    }

    #[test]
    fn snapshot_for_unknown_instance_is_empty() {
        let update = AllocationUpdate {
            version: 3,
            instance_count: 1,
            tables: HashMap::new(),
        };

        let snap = update.snapshot_for("gone");
        assert_eq!(snap.version, 3);
        assert!(snap.slots_by_job_type_and_model.is_empty());
        assert_eq!(snap.slots_for("chat", "m1"), 0);
    }
}
