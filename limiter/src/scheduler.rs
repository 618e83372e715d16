//! Job runner: walks the escalation list, gates each attempt on a local
//! slot and coordinator admission, runs the user callback, and reconciles
//! estimated against actual usage.
//!
//! Ordering properties:
//! - jobs waiting on the same (jobType, model) acquire in FIFO order
//!   (delegated to the slot pool);
//! - a job never retries a model already in its tried list;
//! - reconciliation for a job happens-after its admission.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{Span, debug, field, info, instrument, warn};
use uuid::Uuid;

use common::time::now_ms;
use coordinator::backend::{AcquireOutcome, CoordinatorBackend};
use coordinator::types::{ActualUsage, CostVector, TokenUsage};

use crate::config::LimiterConfig;
use crate::counters::Counters;
use crate::error::{LimiterError, SkipReason, TriedModel};
use crate::jobs::{ActiveJob, ActiveJobs, JobStatus};
use crate::pool::{SlotAcquire, SlotPool};
use crate::reconcile;

/// Passed to the user callback. The resolver may be used to report actual
/// usage before the callback returns, which reconciles the quota windows
/// early; the concurrent gauge and local slot stay held until the callback
/// finishes.
pub struct JobContext {
    pub model_id: String,
    resolver: UsageResolver,
}

impl JobContext {
    pub fn resolver(&self) -> UsageResolver {
        self.resolver.clone()
    }

    pub fn resolve_usage(&self, usage: ActualUsage) {
        self.resolver.resolve(usage);
    }
}

/// Early-reconciliation handle; cheap to clone into spawned work. Only the
/// first `resolve` counts.
#[derive(Clone)]
pub struct UsageResolver {
    tx: Arc<Mutex<Option<oneshot::Sender<ActualUsage>>>>,
}

impl UsageResolver {
    fn new(tx: oneshot::Sender<ActualUsage>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn resolve(&self, usage: ActualUsage) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(usage);
        }
    }
}

/// What the user callback reports back.
pub struct JobOutput<T> {
    pub request_count: u64,
    pub usage: TokenUsage,
    pub data: T,
}

pub type JobFn<T> = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, anyhow::Result<JobOutput<T>>> + Send>;

/// Fired after reconciliation with the priced completion context.
pub type CompletionHook<T> = Box<dyn FnOnce(&T, &CompletionInfo) + Send>;

pub struct JobRequest<T> {
    pub job_id: Option<String>,
    pub job_type: String,
    pub max_wait_ms: Option<u64>,
    /// Overrides the configured escalation order for this job.
    pub escalation_order: Option<Vec<String>>,
    pub job: JobFn<T>,
    pub on_complete: Option<CompletionHook<T>>,
}

impl<T> JobRequest<T> {
    pub fn new<F, Fut>(job_type: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<JobOutput<T>>> + Send + 'static,
    {
        let job: JobFn<T> = Box::new(move |ctx| Box::pin(job(ctx)) as BoxFuture<'static, _>);
        Self {
            job_id: None,
            job_type: job_type.into(),
            max_wait_ms: None,
            escalation_order: None,
            job,
            on_complete: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompletionInfo {
    pub job_id: String,
    pub model_id: String,
    pub request_count: u64,
    pub usage: TokenUsage,
    pub total_cost: f64,
}

pub struct JobResult<T> {
    pub job_id: String,
    pub model_id: String,
    pub data: T,
    pub request_count: u64,
    pub usage: TokenUsage,
    pub total_cost: f64,
    /// Models skipped before this one served the job.
    pub tried_models: Vec<TriedModel>,
}

pub(crate) struct JobRunner {
    pub backend: Arc<dyn CoordinatorBackend>,
    pub pool: Arc<SlotPool>,
    pub active: Arc<ActiveJobs>,
    pub config: Arc<LimiterConfig>,
    pub counters: Counters,
}

impl JobRunner {
    #[instrument(
        skip(self, request),
        target = "scheduler",
        fields(job_type = %request.job_type, job_id = field::Empty)
    )]
    pub async fn run<T>(&self, request: JobRequest<T>) -> Result<JobResult<T>, LimiterError> {
        self.counters.jobs_queued.fetch_add(1, Ordering::Relaxed);

        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Span::current().record("job_id", field::display(&job_id));

        let outcome = self.run_inner(&job_id, request).await;

        self.active.remove(&job_id);
        match &outcome {
            Ok(_) => self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.jobs_failed.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    async fn run_inner<T>(
        &self,
        job_id: &str,
        request: JobRequest<T>,
    ) -> Result<JobResult<T>, LimiterError> {
        let JobRequest {
            job_type,
            max_wait_ms,
            escalation_order,
            job,
            mut on_complete,
            ..
        } = request;

        let estimation = self
            .config
            .resource_estimations_per_job
            .get(&job_type)
            .ok_or_else(|| LimiterError::UnknownJobType(job_type.clone()))?;
        let estimated = estimation.cost_vector();

        let escalation =
            escalation_order.unwrap_or_else(|| self.config.escalation_order.clone());
        if escalation.is_empty() {
            return Err(LimiterError::NoModelsAvailable);
        }

        self.active
            .insert(ActiveJob::new(job_id.to_string(), job_type.clone(), now_ms()));

        let mut tried: Vec<TriedModel> = Vec::new();
        let mut job = Some(job);

        for model_id in &escalation {
            if tried.iter().any(|t| t.model_id == *model_id) {
                continue;
            }

            // Request override, then the model's own budget, then the default.
            let wait_ms = max_wait_ms
                .or_else(|| {
                    self.config
                        .models
                        .get(model_id)
                        .and_then(|m| m.max_wait_ms)
                })
                .unwrap_or(self.config.default_max_wait_ms);

            let wait_started = now_ms();
            self.active.update(job_id, |j| {
                j.status = JobStatus::WaitingForModel;
                j.current_model_id = Some(model_id.clone());
                j.wait_started_at_ms = Some(wait_started);
                j.max_wait_ms = Some(wait_ms);
                j.timeout_at_ms = Some(wait_started + wait_ms);
            });

            match self.pool.acquire(&job_type, model_id, wait_ms).await {
                SlotAcquire::Acquired => {}
                SlotAcquire::Timeout => {
                    self.counters.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                    self.skip(job_id, &mut tried, model_id, SkipReason::WaitTimeout);
                    continue;
                }
                SlotAcquire::Canceled => return Err(LimiterError::Stopped),
            }

            match self.backend.acquire(model_id, &estimated, now_ms()).await {
                Ok(AcquireOutcome::Granted) => {}
                Ok(AcquireOutcome::Rejected { kind, current, limit }) => {
                    debug!(model_id = %model_id, ?kind, current, limit, "admission rejected");
                    self.counters
                        .quota_rejections
                        .fetch_add(1, Ordering::Relaxed);
                    self.pool.release(&job_type, model_id);
                    self.skip(job_id, &mut tried, model_id, SkipReason::QuotaExhausted(kind));
                    continue;
                }
                Err(e) => {
                    warn!(model_id = %model_id, error = %e, "coordinator acquire failed; escalating");
                    self.counters
                        .coordinator_errors
                        .fetch_add(1, Ordering::Relaxed);
                    self.pool.release(&job_type, model_id);
                    self.skip(job_id, &mut tried, model_id, SkipReason::Coordinator(e.to_string()));
                    continue;
                }
            }

            self.active.update(job_id, |j| {
                j.status = JobStatus::Processing;
                j.started_at_ms = Some(now_ms());
            });

            // The job closure runs at most once: nothing after this point
            // escalates to another model.
            let job = job.take().expect("job not yet run");
            return self
                .execute(job_id, &job_type, model_id, estimated, job, on_complete.take(), tried)
                .await;
        }

        Err(LimiterError::AllModelsExhausted { tried })
    }

    /// Run the user callback on an admitted model and settle the counters.
    async fn execute<T>(
        &self,
        job_id: &str,
        job_type: &str,
        model_id: &str,
        estimated: CostVector,
        job: JobFn<T>,
        on_complete: Option<CompletionHook<T>>,
        tried: Vec<TriedModel>,
    ) -> Result<JobResult<T>, LimiterError> {
        let (tx, mut rx) = oneshot::channel::<ActualUsage>();
        let context = JobContext {
            model_id: model_id.to_string(),
            resolver: UsageResolver::new(tx),
        };

        let mut fut = job(context);
        let mut early: Option<ActualUsage> = None;
        let mut resolver_open = true;

        let outcome = loop {
            tokio::select! {
                result = &mut fut => break result,
                resolved = &mut rx, if resolver_open => {
                    resolver_open = false;
                    if let Ok(usage) = resolved {
                        // Reconcile the windows now; the slot and the
                        // concurrent gauge stay held until the callback
                        // returns.
                        self.reconcile_windows(model_id, &usage.cost_vector(), &estimated)
                            .await;
                        early = Some(usage);
                    }
                }
            }
        };

        match outcome {
            Ok(output) => {
                let (usage, request_count) = match early {
                    Some(resolved) => (resolved.usage, resolved.request_count),
                    None => {
                        let actual = ActualUsage {
                            usage: output.usage,
                            request_count: output.request_count,
                        };
                        self.reconcile_windows(model_id, &actual.cost_vector(), &estimated)
                            .await;
                        (output.usage, output.request_count)
                    }
                };

                self.finish_release(job_type, model_id).await;

                let pricing = self
                    .config
                    .models
                    .get(model_id)
                    .and_then(|m| m.pricing.as_ref());
                let total_cost = reconcile::total_cost(&usage, pricing);

                let info = CompletionInfo {
                    job_id: job_id.to_string(),
                    model_id: model_id.to_string(),
                    request_count,
                    usage,
                    total_cost,
                };
                if let Some(hook) = on_complete {
                    hook(&output.data, &info);
                }

                info!(model_id = %model_id, total_cost, "job completed");
                Ok(JobResult {
                    job_id: job_id.to_string(),
                    model_id: model_id.to_string(),
                    data: output.data,
                    request_count,
                    usage,
                    total_cost,
                    tried_models: tried,
                })
            }
            Err(error) => {
                // Failed user code consumed nothing we can bill: refund the
                // full estimate unless an early resolve already settled it.
                if early.is_none() {
                    self.reconcile_windows(model_id, &CostVector::ZERO, &estimated)
                        .await;
                }
                self.finish_release(job_type, model_id).await;

                warn!(model_id = %model_id, error = %error, "user job failed");
                Err(LimiterError::JobFailed(error))
            }
        }
    }

    fn skip(
        &self,
        job_id: &str,
        tried: &mut Vec<TriedModel>,
        model_id: &str,
        reason: SkipReason,
    ) {
        self.counters.escalations.fetch_add(1, Ordering::Relaxed);
        self.active
            .update(job_id, |j| j.tried_models.push(model_id.to_string()));
        tried.push(TriedModel {
            model_id: model_id.to_string(),
            reason,
        });
    }

    async fn reconcile_windows(&self, model_id: &str, actual: &CostVector, estimated: &CostVector) {
        if let Err(e) = self
            .backend
            .reconcile(model_id, actual, estimated, now_ms())
            .await
        {
            self.counters
                .coordinator_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!(model_id = %model_id, error = %e, "usage reconciliation failed");
        }
    }

    async fn finish_release(&self, job_type: &str, model_id: &str) {
        if let Err(e) = self.backend.release_concurrent(model_id, now_ms()).await {
            self.counters
                .coordinator_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!(model_id = %model_id, error = %e, "concurrent release failed");
        }
        self.pool.release(job_type, model_id);
    }
}
