//! Distributed, multi-model, multi-resource rate limiter for LLM-style job
//! execution.
//!
//! A fleet of limiter instances shares a coordinator so that each model's
//! global quotas (tokens/minute, requests/minute, tokens/day, requests/day,
//! max concurrent) are partitioned into local execution slots. Jobs queue on
//! one instance, escalate across fallback models within per-model wait
//! budgets, and reconcile estimated against actual usage on completion.

pub mod config;
pub mod counters;
pub mod error;
pub mod instance;
pub mod jobs;
pub mod pool;
pub mod ratio;
pub mod reconcile;
pub mod scheduler;
pub mod stats;

pub use config::{LimiterConfig, MemoryBudget, RatioAdjustmentConfig, SlotsChangeHook};
pub use error::{LimiterError, SkipReason, TriedModel};
pub use instance::{Limiter, create_limiter};
pub use jobs::{ActiveJob, JobStatus};
pub use scheduler::{
    CompletionInfo, JobContext, JobOutput, JobRequest, JobResult, UsageResolver,
};
pub use stats::{LimiterStats, SchedulerStats};

pub use coordinator::backend::{AcquireOutcome, CoordinatorBackend, CoordinatorError};
pub use coordinator::memory::{CoordinatorSettings, MemoryCoordinator};
pub use coordinator::types::{
    ActualUsage, AllocationSnapshot, ModelConfig, Pricing, QuotaKind, RatioConfig,
    ResourceEstimation, TokenUsage,
};
