//! In-memory coordinator driver.
//!
//! Every script body runs under one mutex, which models the real
//! coordinator's single-threaded script execution: callers observe each
//! script as atomic. Admission checks every quota kind before applying any
//! increment, which is observationally identical to the
//! increment-then-rollback wire protocol.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::alloc::{AllocationInputs, compute_allocation};
use crate::backend::{
    AcquireOutcome, CleanupReport, CoordinatorBackend, CoordinatorError,
};
use crate::reconcile::usage_deltas;
use crate::types::{
    AllocationSnapshot, AllocationUpdate, ConcurrencyUsage, CostVector, InstanceId,
    InstanceRecord, JobType, ModelConfig, ModelId, ModelUsageSnapshot, QuotaKind, QuotaUsage,
    ResourceEstimation,
};
use crate::window::SlidingWindow;

pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Authoritative quota/estimation inputs the driver enforces.
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    pub models: HashMap<ModelId, ModelConfig>,
    pub estimations: HashMap<JobType, ResourceEstimation>,
    pub memory_total_mb: Option<u64>,
    pub heartbeat_timeout_ms: u64,
}

impl CoordinatorSettings {
    pub fn new(
        models: HashMap<ModelId, ModelConfig>,
        estimations: HashMap<JobType, ResourceEstimation>,
    ) -> Self {
        Self {
            models,
            estimations,
            memory_total_mb: None,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

struct ModelUsage {
    windows: HashMap<QuotaKind, SlidingWindow>,
    concurrent: u64,
}

impl ModelUsage {
    fn for_model(config: &ModelConfig) -> Self {
        let windows = config
            .quota_limits()
            .into_iter()
            .filter_map(|(kind, _)| kind.window_ms().map(|w| (kind, SlidingWindow::new(w))))
            .collect();
        Self {
            windows,
            concurrent: 0,
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    version: u64,
    instances: HashMap<InstanceId, InstanceRecord>,
    usage: HashMap<ModelId, ModelUsage>,
}

/// Single-process [`CoordinatorBackend`].
pub struct MemoryCoordinator {
    settings: CoordinatorSettings,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<AllocationUpdate>,
}

impl MemoryCoordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            state: Mutex::new(CoordinatorState::default()),
            events,
        }
    }

    /// Recompute every instance's slot table, bump the version and publish.
    /// Returns the update so script bodies can answer from it directly.
    fn reallocate(&self, state: &mut CoordinatorState) -> AllocationUpdate {
        let instances: Vec<InstanceRecord> = state.instances.values().cloned().collect();
        let tables = compute_allocation(&AllocationInputs {
            models: &self.settings.models,
            estimations: &self.settings.estimations,
            instances: &instances,
            memory_total_mb: self.settings.memory_total_mb,
        });

        state.version += 1;
        let update = AllocationUpdate {
            version: state.version,
            instance_count: state.instances.len() as u32,
            tables,
        };

        // No receivers is fine; instances that come up later re-sync via
        // register().
        let _ = self.events.send(update.clone());

        debug!(
            version = update.version,
            instances = update.instance_count,
            "allocation published"
        );
        update
    }

    fn usage_entry<'a>(
        state: &'a mut CoordinatorState,
        settings: &CoordinatorSettings,
        model_id: &str,
    ) -> Result<&'a mut ModelUsage, CoordinatorError> {
        let config = settings
            .models
            .get(model_id)
            .ok_or_else(|| CoordinatorError::UnknownModel(model_id.to_string()))?;
        Ok(state
            .usage
            .entry(model_id.to_string())
            .or_insert_with(|| ModelUsage::for_model(config)))
    }
}

#[async_trait::async_trait]
impl CoordinatorBackend for MemoryCoordinator {
    async fn register(
        &self,
        instance_id: &str,
        ratios: HashMap<JobType, f64>,
        now_ms: u64,
    ) -> Result<AllocationSnapshot, CoordinatorError> {
        let mut state = self.state.lock();

        let record = state
            .instances
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceRecord {
                instance_id: instance_id.to_string(),
                registered_at_ms: now_ms,
                last_heartbeat_at_ms: now_ms,
                ratios: HashMap::new(),
            });
        record.last_heartbeat_at_ms = now_ms;
        record.ratios = ratios;

        let update = self.reallocate(&mut state);
        info!(instance_id, instances = update.instance_count, "instance registered");
        Ok(update.snapshot_for(instance_id))
    }

    async fn unregister(
        &self,
        instance_id: &str,
        _now_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();

        if state.instances.remove(instance_id).is_none() {
            return Ok(());
        }
        if state.instances.is_empty() {
            // Last instance gone: purge stale usage so a fresh fleet starts
            // from clean counters.
            state.usage.clear();
        }

        let update = self.reallocate(&mut state);
        info!(instance_id, instances = update.instance_count, "instance unregistered");
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, now_ms: u64) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        match state.instances.get_mut(instance_id) {
            Some(record) => {
                record.last_heartbeat_at_ms = now_ms;
                Ok(())
            }
            None => Err(CoordinatorError::NotRegistered(instance_id.to_string())),
        }
    }

    async fn cleanup(&self, now_ms: u64) -> Result<CleanupReport, CoordinatorError> {
        let mut state = self.state.lock();
        let timeout = self.settings.heartbeat_timeout_ms;

        let removed: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|r| !r.is_alive(now_ms, timeout))
            .map(|r| r.instance_id.clone())
            .collect();

        if removed.is_empty() {
            return Ok(CleanupReport {
                removed,
                surviving: state.instances.len() as u32,
            });
        }

        for id in &removed {
            state.instances.remove(id);
        }
        if state.instances.is_empty() {
            state.usage.clear();
        }

        let update = self.reallocate(&mut state);
        warn!(removed = removed.len(), surviving = update.instance_count, "dead instances purged");
        Ok(CleanupReport {
            removed,
            surviving: update.instance_count,
        })
    }

    async fn acquire(
        &self,
        model_id: &str,
        cost: &CostVector,
        now_ms: u64,
    ) -> Result<AcquireOutcome, CoordinatorError> {
        let mut state = self.state.lock();
        let config = self
            .settings
            .models
            .get(model_id)
            .ok_or_else(|| CoordinatorError::UnknownModel(model_id.to_string()))?;
        let limits = config.quota_limits();
        let usage = Self::usage_entry(&mut state, &self.settings, model_id)?;

        // Check every kind before touching any counter; the lock makes the
        // combined check-and-apply atomic.
        for (kind, limit) in &limits {
            let kind_cost = cost.cost_for(*kind);
            if kind_cost == 0 {
                continue;
            }
            let current = match usage.windows.get_mut(kind) {
                Some(w) => w.total(now_ms),
                None => usage.concurrent,
            };
            if current + kind_cost > *limit {
                debug!(model_id, ?kind, current, limit, "acquire rejected");
                return Ok(AcquireOutcome::Rejected {
                    kind: *kind,
                    current,
                    limit: *limit,
                });
            }
        }

        for (kind, _) in &limits {
            let kind_cost = cost.cost_for(*kind);
            if kind_cost == 0 {
                continue;
            }
            match usage.windows.get_mut(kind) {
                Some(w) => w.push(now_ms, kind_cost),
                None => usage.concurrent += kind_cost,
            }
        }

        Ok(AcquireOutcome::Granted)
    }

    async fn reconcile(
        &self,
        model_id: &str,
        actual: &CostVector,
        estimated: &CostVector,
        now_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        let usage = Self::usage_entry(&mut state, &self.settings, model_id)?;

        for delta in usage_deltas(estimated, actual) {
            // Kinds the model does not configure have no window to adjust.
            let Some(window) = usage.windows.get_mut(&delta.kind) else {
                continue;
            };
            if delta.refund > 0 {
                window.refund(delta.refund);
            }
            if delta.overage > 0 {
                window.push(now_ms, delta.overage);
            }
        }
        Ok(())
    }

    async fn release_concurrent(
        &self,
        model_id: &str,
        _now_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        let usage = Self::usage_entry(&mut state, &self.settings, model_id)?;
        usage.concurrent = usage.concurrent.saturating_sub(1);
        Ok(())
    }

    async fn update_ratios(
        &self,
        instance_id: &str,
        ratios: HashMap<JobType, f64>,
        _now_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        match state.instances.get_mut(instance_id) {
            Some(record) => record.ratios = ratios,
            None => return Err(CoordinatorError::NotRegistered(instance_id.to_string())),
        }
        self.reallocate(&mut state);
        Ok(())
    }

    async fn model_usage(
        &self,
        model_id: &str,
        now_ms: u64,
    ) -> Result<ModelUsageSnapshot, CoordinatorError> {
        let mut state = self.state.lock();
        let config = self
            .settings
            .models
            .get(model_id)
            .ok_or_else(|| CoordinatorError::UnknownModel(model_id.to_string()))?;
        let limits = config.quota_limits();
        let concurrent_limit = config.max_concurrent_requests;
        let usage = Self::usage_entry(&mut state, &self.settings, model_id)?;

        let quotas = limits
            .into_iter()
            .map(|(kind, limit)| {
                let (current, resets_in_ms) = match usage.windows.get_mut(&kind) {
                    Some(w) => (w.total(now_ms), w.resets_in_ms(now_ms)),
                    None => (usage.concurrent, None),
                };
                QuotaUsage {
                    kind,
                    current,
                    limit,
                    remaining: limit.saturating_sub(current),
                    resets_in_ms,
                }
            })
            .collect();

        Ok(ModelUsageSnapshot {
            model_id: model_id.to_string(),
            quotas,
            concurrency: ConcurrencyUsage {
                active: usage.concurrent,
                limit: concurrent_limit,
            },
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<AllocationUpdate> {
        self.events.subscribe()
    }
}
