use coordinator::types::QuotaKind;
use thiserror::Error;

/// Why one model in the escalation list was skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The per-model wait budget elapsed before a local slot freed up.
    WaitTimeout,
    /// The coordinator refused admission on this quota kind.
    QuotaExhausted(QuotaKind),
    /// The coordinator could not be reached.
    Coordinator(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::WaitTimeout => write!(f, "wait timeout"),
            SkipReason::QuotaExhausted(kind) => write!(f, "quota exhausted: {kind:?}"),
            SkipReason::Coordinator(msg) => write!(f, "coordinator error: {msg}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriedModel {
    pub model_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("no models available for escalation")]
    NoModelsAvailable,

    #[error("all models exhausted ({} tried)", .tried.len())]
    AllModelsExhausted { tried: Vec<TriedModel> },

    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The user callback returned an error. The coordinator counters were
    /// fully refunded before this surfaced.
    #[error("job failed: {0}")]
    JobFailed(anyhow::Error),

    #[error("limiter stopped")]
    Stopped,
}
