//! Allocation calculator: quota limits + per-job estimations + live
//! instances in, per-instance slot tables out.
//!
//! Pure function so the invariants (never over-commit a quota, equal ratios
//! get equal slots) can be exercised directly.

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::types::{
    InstanceId, InstanceRecord, JobType, ModelConfig, ModelId, ResourceEstimation, SlotTable,
};

pub struct AllocationInputs<'a> {
    pub models: &'a HashMap<ModelId, ModelConfig>,
    pub estimations: &'a HashMap<JobType, ResourceEstimation>,
    pub instances: &'a [InstanceRecord],
    /// Per-instance memory budget in MB, when configured.
    pub memory_total_mb: Option<u64>,
}

/// Compute every live instance's slot table.
///
/// For each (jobType, model):
/// - each configured quota kind contributes `floor(limit/N · share / cost)`
///   slots, where `share` is the job type's ratio weight normalized within
///   the instance and `cost` is the estimated per-job cost for that kind;
/// - kinds the job type has no cost for do not participate;
/// - the binding quota is the participating minimum; no participating kind
///   means zero slots;
/// - a configured memory budget additionally caps by
///   `floor(total_mb / memory_mb)`.
///
/// Zero slots are legal: that pair simply cannot run until allocation
/// changes.
#[instrument(skip_all, target = "alloc", fields(instances = inputs.instances.len()))]
pub fn compute_allocation(inputs: &AllocationInputs<'_>) -> HashMap<InstanceId, SlotTable> {
    let n = inputs.instances.len() as u64;
    let mut out = HashMap::new();
    if n == 0 {
        return out;
    }

    for instance in inputs.instances {
        let ratio_sum: f64 = inputs
            .estimations
            .iter()
            .map(|(job, est)| instance_ratio(instance, job, est))
            .sum();

        let mut table: SlotTable = HashMap::new();

        for (job_type, est) in inputs.estimations {
            let ratio = instance_ratio(instance, job_type, est);
            let cost = est.cost_vector();

            for (model_id, model) in inputs.models {
                let mut binding: Option<u64> = None;

                for (kind, limit) in model.quota_limits() {
                    let kind_cost = cost.cost_for(kind);
                    if kind_cost == 0 {
                        continue;
                    }
                    let per_instance = limit / n;
                    // Single division keeps exact ratios (e.g. 1:2 splits)
                    // from floor-rounding a slot away.
                    let slots = if ratio_sum > 0.0 {
                        (per_instance as f64 * ratio / (ratio_sum * kind_cost as f64)).floor()
                            as u64
                    } else {
                        0
                    };
                    binding = Some(binding.map_or(slots, |b| b.min(slots)));
                }

                let mut slots = binding.unwrap_or(0);

                if let (Some(budget_mb), Some(mem_mb)) = (inputs.memory_total_mb, est.memory_mb)
                {
                    if mem_mb > 0 {
                        slots = slots.min(budget_mb / mem_mb);
                    }
                }

                table
                    .entry(job_type.clone())
                    .or_default()
                    .insert(model_id.clone(), slots.min(u32::MAX as u64) as u32);
            }
        }

        out.insert(instance.instance_id.clone(), table);
    }

    debug!(instances = out.len(), "allocation computed");
    out
}

fn instance_ratio(instance: &InstanceRecord, job_type: &str, est: &ResourceEstimation) -> f64 {
    instance
        .ratios
        .get(job_type)
        .copied()
        .unwrap_or_else(|| est.initial_ratio())
        .max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CostVector, QuotaKind, RatioConfig};

    fn mk_instance(id: &str, ratios: &[(&str, f64)]) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            registered_at_ms: 0,
            last_heartbeat_at_ms: 0,
            ratios: ratios
                .iter()
                .map(|(j, r)| (j.to_string(), *r))
                .collect(),
        }
    }

    fn mk_estimation(tokens: Option<u64>, requests: Option<u64>) -> ResourceEstimation {
        ResourceEstimation {
            estimated_used_tokens: tokens,
            estimated_number_of_requests: requests,
            ratio: None,
            memory_mb: None,
        }
    }

    fn single(models: &[(&str, ModelConfig)], jobs: &[(&str, ResourceEstimation)]) -> AllocationInputs<'static> {
        // Tests keep inputs alive via Box::leak for brevity.
        let models: &'static _ = Box::leak(Box::new(
            models
                .iter()
                .map(|(id, m)| (id.to_string(), m.clone()))
                .collect::<HashMap<_, _>>(),
        ));
        let estimations: &'static _ = Box::leak(Box::new(
            jobs.iter()
                .map(|(j, e)| (j.to_string(), e.clone()))
                .collect::<HashMap<_, _>>(),
        ));
        let instances: &'static _ = Box::leak(Box::new(vec![mk_instance("a", &[])]));
        AllocationInputs {
            models,
            estimations,
            instances,
            memory_total_mb: None,
        }
    }

    #[test]
    fn tokens_per_minute_divided_by_estimate() {
        let inputs = single(
            &[(
                "m1",
                ModelConfig {
                    tokens_per_minute: Some(100_000),
                    ..Default::default()
                },
            )],
            &[("chat", mk_estimation(Some(10_000), None))],
        );

        let alloc = compute_allocation(&inputs);
        assert_eq!(alloc["a"]["chat"]["m1"], 10);
    }

    #[test]
    fn binding_quota_is_the_minimum() {
        // RPM allows 20 jobs, TPM only 4.
        let inputs = single(
            &[(
                "m1",
                ModelConfig {
                    requests_per_minute: Some(100),
                    tokens_per_minute: Some(40_000),
                    ..Default::default()
                },
            )],
            &[("chat", mk_estimation(Some(10_000), Some(5)))],
        );

        let alloc = compute_allocation(&inputs);
        assert_eq!(alloc["a"]["chat"]["m1"], 4);
    }

    #[test]
    fn no_participating_kind_means_zero_slots() {
        // Model only bounds tokens; the job type estimates no tokens.
        let inputs = single(
            &[(
                "m1",
                ModelConfig {
                    tokens_per_minute: Some(100_000),
                    ..Default::default()
                },
            )],
            &[("ping", mk_estimation(None, Some(1)))],
        );

        let alloc = compute_allocation(&inputs);
        assert_eq!(alloc["a"]["ping"]["m1"], 0);
    }

    #[test]
    fn quota_split_across_instances() {
        let models: HashMap<ModelId, ModelConfig> = [(
            "m1".to_string(),
            ModelConfig {
                tokens_per_minute: Some(100_000),
                ..Default::default()
            },
        )]
        .into();
        let estimations: HashMap<JobType, ResourceEstimation> =
            [("chat".to_string(), mk_estimation(Some(10_000), None))].into();
        let instances = vec![mk_instance("a", &[]), mk_instance("b", &[])];

        let alloc = compute_allocation(&AllocationInputs {
            models: &models,
            estimations: &estimations,
            instances: &instances,
            memory_total_mb: None,
        });

        assert_eq!(alloc["a"]["chat"]["m1"], 5);
        assert_eq!(alloc["b"]["chat"]["m1"], 5);
    }

    #[test]
    fn ratios_split_capacity_within_instance() {
        let models: HashMap<ModelId, ModelConfig> = [(
            "m1".to_string(),
            ModelConfig {
                tokens_per_minute: Some(120_000),
                ..Default::default()
            },
        )]
        .into();
        let estimations: HashMap<JobType, ResourceEstimation> = [
            ("heavy".to_string(), mk_estimation(Some(10_000), None)),
            ("light".to_string(), mk_estimation(Some(10_000), None)),
        ]
        .into();
        let instances = vec![mk_instance("a", &[("heavy", 2.0), ("light", 1.0)])];

        let alloc = compute_allocation(&AllocationInputs {
            models: &models,
            estimations: &estimations,
            instances: &instances,
            memory_total_mb: None,
        });

        assert_eq!(alloc["a"]["heavy"]["m1"], 8);
        assert_eq!(alloc["a"]["light"]["m1"], 4);
    }

    #[test]
    fn zero_ratio_sum_zeroes_the_instance() {
        let models: HashMap<ModelId, ModelConfig> = [(
            "m1".to_string(),
            ModelConfig {
                tokens_per_minute: Some(100_000),
                ..Default::default()
            },
        )]
        .into();
        let estimations: HashMap<JobType, ResourceEstimation> =
            [("chat".to_string(), mk_estimation(Some(10_000), None))].into();
        let instances = vec![mk_instance("a", &[("chat", 0.0)])];

        let alloc = compute_allocation(&AllocationInputs {
            models: &models,
            estimations: &estimations,
            instances: &instances,
            memory_total_mb: None,
        });

        assert_eq!(alloc["a"]["chat"]["m1"], 0);
    }

    #[test]
    fn memory_budget_caps_slots() {
        let models: HashMap<ModelId, ModelConfig> = [(
            "m1".to_string(),
            ModelConfig {
                tokens_per_minute: Some(100_000),
                ..Default::default()
            },
        )]
        .into();
        let estimations: HashMap<JobType, ResourceEstimation> = [(
            "chat".to_string(),
            ResourceEstimation {
                estimated_used_tokens: Some(10_000),
                memory_mb: Some(512),
                ..Default::default()
            },
        )]
        .into();
        let instances = vec![mk_instance("a", &[])];

        let alloc = compute_allocation(&AllocationInputs {
            models: &models,
            estimations: &estimations,
            instances: &instances,
            memory_total_mb: Some(2_048),
        });

        // Quota would allow 10, memory allows 4.
        assert_eq!(alloc["a"]["chat"]["m1"], 4);
    }

    #[test]
    fn ratio_config_initial_value_is_used_when_instance_has_none() {
        let models: HashMap<ModelId, ModelConfig> = [(
            "m1".to_string(),
            ModelConfig {
                tokens_per_minute: Some(100_000),
                ..Default::default()
            },
        )]
        .into();
        let estimations: HashMap<JobType, ResourceEstimation> = [
            (
                "a".to_string(),
                ResourceEstimation {
                    estimated_used_tokens: Some(10_000),
                    ratio: Some(RatioConfig {
                        initial_value: 3.0,
                        min: None,
                        max: None,
                        fixed: false,
                    }),
                    ..Default::default()
                },
            ),
            ("b".to_string(), mk_estimation(Some(10_000), None)),
        ]
        .into();
        let instances = vec![mk_instance("i", &[])];

        let alloc = compute_allocation(&AllocationInputs {
            models: &models,
            estimations: &estimations,
            instances: &instances,
            memory_total_mb: None,
        });

        // Shares are 0.75 / 0.25 of 10 potential slots.
        assert_eq!(alloc["i"]["a"]["m1"], 7);
        assert_eq!(alloc["i"]["b"]["m1"], 2);
    }

    #[test]
    fn concurrent_kind_costs_one_per_slot() {
        let inputs = single(
            &[(
                "m1",
                ModelConfig {
                    max_concurrent_requests: Some(5),
                    tokens_per_minute: Some(1_000_000),
                    ..Default::default()
                },
            )],
            &[("chat", mk_estimation(Some(10), None))],
        );

        let alloc = compute_allocation(&inputs);
        assert_eq!(alloc["a"]["chat"]["m1"], 5);
    }

    // Projection used by the safety proptest below.
    fn committed_cost(
        alloc: &HashMap<InstanceId, SlotTable>,
        estimations: &HashMap<JobType, ResourceEstimation>,
        model_id: &str,
        kind: QuotaKind,
    ) -> u64 {
        alloc
            .values()
            .flat_map(|table| table.iter())
            .map(|(job, models)| {
                let cost: CostVector = estimations[job].cost_vector();
                models.get(model_id).copied().unwrap_or(0) as u64 * cost.cost_for(kind)
            })
            .sum()
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(500))]
            #[test]
            fn allocation_invariants(
                tpm in 1..=1_000_000u64,
                rpm in 1..=10_000u64,
                concurrent in 1..=64u64,
                tokens in 1..=50_000u64,
                requests in 1..=50u64,
                instance_count in 1..=8usize,
                ratio_a in 0.1..=10.0f64,
                ratio_b in 0.1..=10.0f64,
            ) {
                let models: HashMap<ModelId, ModelConfig> = [(
                    "m".to_string(),
                    ModelConfig {
                        tokens_per_minute: Some(tpm),
                        requests_per_minute: Some(rpm),
                        max_concurrent_requests: Some(concurrent),
                        ..Default::default()
                    },
                )]
                .into();
                let estimations: HashMap<JobType, ResourceEstimation> = [
                    ("a".to_string(), mk_estimation(Some(tokens), Some(requests))),
                    ("b".to_string(), mk_estimation(Some(tokens), Some(requests))),
                ]
                .into();
                let instances: Vec<InstanceRecord> = (0..instance_count)
                    .map(|i| mk_instance(&format!("i{i}"), &[("a", ratio_a), ("b", ratio_b)]))
                    .collect();

                let alloc = compute_allocation(&AllocationInputs {
                    models: &models,
                    estimations: &estimations,
                    instances: &instances,
                    memory_total_mb: None,
                });

                // --- Global safety: committed estimates never exceed any limit ---
                for (kind, limit) in [
                    (QuotaKind::TokensPerMinute, tpm),
                    (QuotaKind::RequestsPerMinute, rpm),
                    (QuotaKind::Concurrent, concurrent),
                ] {
                    let committed = committed_cost(&alloc, &estimations, "m", kind);
                    prop_assert!(
                        committed <= limit,
                        "over-committed {kind:?}: {committed} > {limit}"
                    );
                }

                // --- Fairness: equal ratios get slot counts within 1 ---
                if (ratio_a - ratio_b).abs() < f64::EPSILON {
                    for table in alloc.values() {
                        let sa = table["a"]["m"] as i64;
                        let sb = table["b"]["m"] as i64;
                        prop_assert!((sa - sb).abs() <= 1, "unfair split: {sa} vs {sb}");
                    }
                }
            }

            #[test]
            fn surviving_instances_never_shrink_when_fleet_shrinks(
                tpm in 1..=1_000_000u64,
                tokens in 1..=50_000u64,
                before in 2..=8usize,
            ) {
                let models: HashMap<ModelId, ModelConfig> = [(
                    "m".to_string(),
                    ModelConfig {
                        tokens_per_minute: Some(tpm),
                        ..Default::default()
                    },
                )]
                .into();
                let estimations: HashMap<JobType, ResourceEstimation> =
                    [("a".to_string(), mk_estimation(Some(tokens), None))].into();

                let instances: Vec<InstanceRecord> =
                    (0..before).map(|i| mk_instance(&format!("i{i}"), &[])).collect();
                let survivors = &instances[..before - 1];

                let full = compute_allocation(&AllocationInputs {
                    models: &models,
                    estimations: &estimations,
                    instances: &instances,
                    memory_total_mb: None,
                });
                let shrunk = compute_allocation(&AllocationInputs {
                    models: &models,
                    estimations: &estimations,
                    instances: survivors,
                    memory_total_mb: None,
                });

                for inst in survivors {
                    let was = full[&inst.instance_id]["a"]["m"];
                    let is = shrunk[&inst.instance_id]["a"]["m"];
                    prop_assert!(is >= was, "instance lost slots on shrink: {was} -> {is}");
                }
            }
        }
    }
}
