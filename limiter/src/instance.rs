//! The per-process limiter instance: public API plus the background loops
//! (heartbeat, cleanup timer, allocation feed consumer, ratio adjuster).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::time::now_ms;
use coordinator::backend::{CoordinatorBackend, CoordinatorError};
use coordinator::types::{AllocationSnapshot, AllocationUpdate};

use crate::config::LimiterConfig;
use crate::counters::Counters;
use crate::error::LimiterError;
use crate::jobs::{ActiveJob, ActiveJobs};
use crate::pool::SlotPool;
use crate::ratio::RatioController;
use crate::scheduler::{JobRequest, JobResult, JobRunner};
use crate::stats::{LimiterStats, SchedulerStats};

/// Consecutive heartbeat transport failures before the instance zeroes its
/// local slots and falls back to re-registration.
const SELF_EJECT_AFTER: u32 = 3;

/// One limiter instance. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<Inner>,
}

struct Inner {
    instance_id: String,
    config: Arc<LimiterConfig>,
    backend: Arc<dyn CoordinatorBackend>,
    pool: Arc<SlotPool>,
    active: Arc<ActiveJobs>,
    alloc: RwLock<AllocationSnapshot>,
    ratios: RatioController,
    counters: Counters,
    runner: JobRunner,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Validate the config and assemble a limiter bound to `backend`.
pub fn create_limiter(
    config: LimiterConfig,
    backend: Arc<dyn CoordinatorBackend>,
) -> Result<Limiter, LimiterError> {
    Limiter::new(config, backend)
}

impl Limiter {
    pub fn new(
        config: LimiterConfig,
        backend: Arc<dyn CoordinatorBackend>,
    ) -> Result<Self, LimiterError> {
        config.validate()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let concurrent_limits = config
            .models
            .iter()
            .filter_map(|(id, m)| m.max_concurrent_requests.map(|l| (id.clone(), l)))
            .collect();
        let pool = Arc::new(SlotPool::new(concurrent_limits, stop_rx));
        let active = Arc::new(ActiveJobs::default());
        let counters = Counters::default();
        let ratios = RatioController::from_estimations(
            &config.resource_estimations_per_job,
            &config.ratio_adjustment,
        );
        let config = Arc::new(config);
        let runner = JobRunner {
            backend: backend.clone(),
            pool: pool.clone(),
            active: active.clone(),
            config: config.clone(),
            counters: counters.clone(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                instance_id: Uuid::new_v4().to_string(),
                config,
                backend,
                pool,
                active,
                alloc: RwLock::new(AllocationSnapshot::default()),
                ratios,
                counters,
                runner,
                stop_tx,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn counters(&self) -> Counters {
        self.inner.counters.clone()
    }

    /// Register with the coordinator and start the background loops.
    /// Idempotent while running.
    pub async fn start(&self) -> Result<(), LimiterError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(LimiterError::Stopped);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Subscribe before registering so no update published after our
        // registration can slip past the consumer.
        let updates = inner.backend.subscribe();

        let snapshot = match inner
            .backend
            .register(&inner.instance_id, inner.ratios.current(), now_ms())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(LimiterError::CoordinatorUnavailable(e.to_string()));
            }
        };
        inner.apply_snapshot(&snapshot);

        let mut tasks = vec![
            spawn_allocation_consumer(inner.clone(), updates),
            spawn_heartbeat(inner.clone()),
            spawn_cleanup(inner.clone()),
        ];
        if inner.config.ratio_adjustment.enabled {
            tasks.push(spawn_ratio_adjuster(inner.clone()));
        }
        inner.tasks.lock().extend(tasks.drain(..));

        info!(instance_id = %inner.instance_id, "limiter started");
        Ok(())
    }

    /// Cancel every pending wait, stop the background loops and unregister.
    /// In-flight user callbacks are not interrupted; their release still
    /// runs. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = inner.stop_tx.send(true);
        inner.pool.cancel_all();

        let handles: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }

        if inner.started.load(Ordering::SeqCst) {
            if let Err(e) = inner.backend.unregister(&inner.instance_id, now_ms()).await {
                warn!(error = %e, "unregister failed during stop");
            }
        }

        info!(instance_id = %inner.instance_id, "limiter stopped");
    }

    /// Run one job through escalation. Resolves once the user callback has
    /// returned and reconciliation settled.
    pub async fn queue_job<T>(&self, request: JobRequest<T>) -> Result<JobResult<T>, LimiterError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(LimiterError::Stopped);
        }
        self.inner.runner.run(request).await
    }

    pub async fn get_stats(&self) -> Result<LimiterStats, LimiterError> {
        let inner = &self.inner;
        let now = now_ms();

        let mut model_ids: Vec<&String> = inner.config.models.keys().collect();
        model_ids.sort();

        let mut models = Vec::with_capacity(model_ids.len());
        for model_id in model_ids {
            let snapshot = inner
                .backend
                .model_usage(model_id, now)
                .await
                .map_err(|e| LimiterError::CoordinatorUnavailable(e.to_string()))?;
            models.push(snapshot);
        }

        let (allocation_version, instance_count) = {
            let alloc = inner.alloc.read();
            (alloc.version, alloc.instance_count)
        };

        Ok(LimiterStats {
            instance_id: inner.instance_id.clone(),
            instance_count,
            allocation_version,
            models,
            scheduler: SchedulerStats {
                active_jobs: inner.active.snapshot(),
                queue_depth: inner.active.queue_depth(),
                slots: inner.pool.table(),
            },
        })
    }

    pub fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.inner.active.snapshot()
    }
}

impl Inner {
    /// Apply an allocation snapshot in version order; stale versions are
    /// dropped.
    fn apply_snapshot(&self, snapshot: &AllocationSnapshot) {
        {
            let mut cached = self.alloc.write();
            if snapshot.version <= cached.version {
                debug!(
                    version = snapshot.version,
                    cached = cached.version,
                    "stale allocation update ignored"
                );
                return;
            }
            *cached = snapshot.clone();
        }
        self.pool.apply_allocation(snapshot);
        if let Some(hook) = &self.config.on_available_slots_change {
            hook(snapshot);
        }
        debug!(version = snapshot.version, "allocation applied");
    }

    /// Drop every local slot without touching the cached version; the next
    /// real update (or re-registration) restores capacity.
    fn zero_slots(&self) {
        let cleared = {
            let mut cached = self.alloc.write();
            cached.slots_by_job_type_and_model.clear();
            cached.clone()
        };
        self.pool.apply_allocation(&cleared);
        if let Some(hook) = &self.config.on_available_slots_change {
            hook(&cleared);
        }
    }

    async fn try_register(&self) -> bool {
        match self
            .backend
            .register(&self.instance_id, self.ratios.current(), now_ms())
            .await
        {
            Ok(snapshot) => {
                self.apply_snapshot(&snapshot);
                info!(instance_id = %self.instance_id, "re-registered with coordinator");
                true
            }
            Err(e) => {
                warn!(error = %e, "re-registration failed");
                false
            }
        }
    }
}

/// Single consumer of the allocation feed; many job paths read the cached
/// snapshot.
fn spawn_allocation_consumer(
    inner: Arc<Inner>,
    mut updates: broadcast::Receiver<AllocationUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stop = inner.stop_tx.subscribe();
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(update) => {
                        let snapshot = update.snapshot_for(&inner.instance_id);
                        inner.apply_snapshot(&snapshot);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The next update carries the full table, so a lag
                        // only delays convergence.
                        warn!(skipped, "allocation feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_heartbeat(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(inner.config.heartbeat_interval_ms));
        let mut stop = inner.stop_tx.subscribe();
        let mut misses: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match inner.backend.heartbeat(&inner.instance_id, now_ms()).await {
                        Ok(()) => misses = 0,
                        Err(CoordinatorError::NotRegistered(_)) => {
                            // Another instance reaped us; come back with a
                            // fresh registration.
                            warn!("heartbeat rejected as unregistered");
                            misses = 0;
                            inner.try_register().await;
                        }
                        Err(e) => {
                            misses += 1;
                            inner.counters.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, misses, "heartbeat failed");
                            if misses == SELF_EJECT_AFTER {
                                warn!("self-ejecting after repeated heartbeat failures");
                                inner.zero_slots();
                            }
                            if misses >= SELF_EJECT_AFTER && inner.try_register().await {
                                misses = 0;
                            }
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_cleanup(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(inner.config.cleanup_interval_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut stop = inner.stop_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match inner.backend.cleanup(now_ms()).await {
                        Ok(report) if !report.removed.is_empty() => {
                            info!(
                                removed = report.removed.len(),
                                surviving = report.surviving,
                                "cleaned up dead instances"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "cleanup sweep failed"),
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_ratio_adjuster(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(inner.config.ratio_adjustment.adjust_interval_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut stop = inner.stop_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let depths = inner.active.waiting_depth_by_type();
                    if let Some(ratios) = inner.ratios.adjust(&depths) {
                        if let Err(e) = inner
                            .backend
                            .update_ratios(&inner.instance_id, ratios, now_ms())
                            .await
                        {
                            warn!(error = %e, "ratio publish failed");
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
