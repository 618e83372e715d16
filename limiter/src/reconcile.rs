//! Post-completion accounting.
//!
//! The refund/overage rule itself lives in [`coordinator::reconcile`] so the
//! backend that applies it and the scheduler that reasons about it share one
//! implementation; this module adds the pricing side.

pub use coordinator::reconcile::{UsageDelta, usage_deltas};

use coordinator::types::{Pricing, TokenUsage};

/// Job cost under the model's pricing; absent pricing costs nothing.
pub fn total_cost(usage: &TokenUsage, pricing: Option<&Pricing>) -> f64 {
    match pricing {
        Some(p) => {
            usage.input as f64 * p.input
                + usage.cached as f64 * p.cached
                + usage.output as f64 * p.output
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_applies_per_class() {
        let usage = TokenUsage {
            input: 100,
            cached: 50,
            output: 10,
        };
        let pricing = Pricing {
            input: 0.01,
            cached: 0.001,
            output: 0.03,
        };

        let cost = total_cost(&usage, Some(&pricing));
        assert!((cost - (1.0 + 0.05 + 0.3)).abs() < 1e-9);
    }

    #[test]
    fn missing_pricing_costs_nothing() {
        let usage = TokenUsage {
            input: 100,
            cached: 0,
            output: 100,
        };
        assert_eq!(total_cost(&usage, None), 0.0);
    }
}
