//! Estimated-vs-actual usage deltas. Every backend's RELEASE path applies
//! these, so the refund/overage rule lives here once.

use crate::types::{CostVector, QuotaKind};

/// Refund/overage for one decaying quota kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageDelta {
    pub kind: QuotaKind,
    pub refund: u64,
    pub overage: u64,
}

/// Deltas for every decaying kind. Refunds are unconditional; overages are
/// applied as-is even when they push a quota past its nominal limit — that
/// is the honest accounting of what actually ran. The concurrent kind is
/// settled by release, not here.
pub fn usage_deltas(estimated: &CostVector, actual: &CostVector) -> Vec<UsageDelta> {
    QuotaKind::ALL
        .into_iter()
        .filter(|k| k.decays())
        .map(|kind| {
            let est = estimated.cost_for(kind);
            let act = actual.cost_for(kind);
            UsageDelta {
                kind,
                refund: est.saturating_sub(act),
                overage: act.saturating_sub(est),
            }
        })
        .collect()
}
