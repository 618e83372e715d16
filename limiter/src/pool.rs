//! Local slot pool: per-(jobType, modelId) counting slots sized by the
//! current allocation, plus a per-model in-flight gauge.
//!
//! Waiters on the same pair are woken strictly in enqueue order. Shrinking
//! below the in-use count never kills a running job; releases simply stop
//! granting until in-use drops back under the cap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use coordinator::types::AllocationSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotAcquire {
    Acquired,
    Timeout,
    Canceled,
}

type PairKey = (String, String);

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct PairSlots {
    capacity: u32,
    in_use: u32,
    waiters: VecDeque<Waiter>,
}

struct ModelGauge {
    limit: Option<u64>,
    active: u64,
}

impl ModelGauge {
    fn has_room(&self) -> bool {
        self.limit.is_none_or(|l| self.active < l)
    }
}

#[derive(Default)]
struct PoolState {
    next_waiter_id: u64,
    pairs: HashMap<PairKey, PairSlots>,
    gauges: HashMap<String, ModelGauge>,
}

pub struct SlotPool {
    concurrent_limits: HashMap<String, u64>,
    state: Mutex<PoolState>,
    stop_rx: watch::Receiver<bool>,
}

/// Stats view of one pair.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairSlotsView {
    pub job_type: String,
    pub model_id: String,
    pub capacity: u32,
    pub in_use: u32,
    pub waiting: usize,
}

impl SlotPool {
    pub fn new(concurrent_limits: HashMap<String, u64>, stop_rx: watch::Receiver<bool>) -> Self {
        Self {
            concurrent_limits,
            state: Mutex::new(PoolState::default()),
            stop_rx,
        }
    }

    fn ensure_entries(&self, st: &mut PoolState, key: &PairKey) {
        if !st.gauges.contains_key(&key.1) {
            st.gauges.insert(
                key.1.clone(),
                ModelGauge {
                    limit: self.concurrent_limits.get(&key.1).copied(),
                    active: 0,
                },
            );
        }
        st.pairs.entry(key.clone()).or_default();
    }

    fn can_take(st: &PoolState, key: &PairKey) -> bool {
        let Some(pair) = st.pairs.get(key) else {
            return false;
        };
        // Newcomers queue behind existing waiters.
        if pair.in_use >= pair.capacity || !pair.waiters.is_empty() {
            return false;
        }
        st.gauges.get(&key.1).map(ModelGauge::has_room).unwrap_or(true)
    }

    fn take(st: &mut PoolState, key: &PairKey) {
        if let Some(pair) = st.pairs.get_mut(key) {
            pair.in_use += 1;
        }
        if let Some(gauge) = st.gauges.get_mut(&key.1) {
            gauge.active += 1;
        }
    }

    /// Wake waiters of every pair on `model_id` while capacity and the
    /// in-flight gauge allow, strictly FIFO within each pair.
    fn grant_ready(st: &mut PoolState, model_id: &str) {
        let keys: Vec<PairKey> = st
            .pairs
            .keys()
            .filter(|k| k.1 == model_id)
            .cloned()
            .collect();

        for key in keys {
            loop {
                let gauge_room = st
                    .gauges
                    .get(model_id)
                    .map(ModelGauge::has_room)
                    .unwrap_or(true);
                if !gauge_room {
                    return;
                }

                let woken = match st.pairs.get_mut(&key) {
                    Some(pair) if pair.in_use < pair.capacity => pair.waiters.pop_front(),
                    _ => None,
                };
                let Some(waiter) = woken else {
                    break;
                };

                // A send failure means the waiting future was dropped; skip
                // it and try the next one.
                if waiter.tx.send(()).is_ok() {
                    if let Some(pair) = st.pairs.get_mut(&key) {
                        pair.in_use += 1;
                    }
                    if let Some(gauge) = st.gauges.get_mut(model_id) {
                        gauge.active += 1;
                    }
                }
            }
        }
    }

    pub fn try_acquire(&self, job_type: &str, model_id: &str) -> bool {
        let mut st = self.state.lock();
        if *self.stop_rx.borrow() {
            return false;
        }
        let key = (job_type.to_string(), model_id.to_string());
        self.ensure_entries(&mut st, &key);
        if Self::can_take(&st, &key) {
            Self::take(&mut st, &key);
            true
        } else {
            false
        }
    }

    /// Wait up to `max_wait_ms` for a slot on (job_type, model_id).
    pub async fn acquire(&self, job_type: &str, model_id: &str, max_wait_ms: u64) -> SlotAcquire {
        let key = (job_type.to_string(), model_id.to_string());

        let (waiter_id, mut rx) = {
            let mut st = self.state.lock();
            if *self.stop_rx.borrow() {
                return SlotAcquire::Canceled;
            }
            self.ensure_entries(&mut st, &key);
            if Self::can_take(&st, &key) {
                Self::take(&mut st, &key);
                return SlotAcquire::Acquired;
            }

            let id = st.next_waiter_id;
            st.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            if let Some(pair) = st.pairs.get_mut(&key) {
                pair.waiters.push_back(Waiter { id, tx });
            }
            (id, rx)
        };

        match tokio::time::timeout(Duration::from_millis(max_wait_ms), &mut rx).await {
            Ok(Ok(())) => SlotAcquire::Acquired,
            // Sender dropped: the pool canceled all waits.
            Ok(Err(_)) => SlotAcquire::Canceled,
            Err(_elapsed) => {
                let removed = {
                    let mut st = self.state.lock();
                    Self::remove_waiter(&mut st, &key, waiter_id)
                };
                if removed {
                    debug!(job_type, model_id, max_wait_ms, "slot wait timed out");
                    SlotAcquire::Timeout
                } else {
                    // A grant raced the timeout; the slot is already ours.
                    match rx.try_recv() {
                        Ok(()) => SlotAcquire::Acquired,
                        Err(_) => SlotAcquire::Canceled,
                    }
                }
            }
        }
    }

    fn remove_waiter(st: &mut PoolState, key: &PairKey, waiter_id: u64) -> bool {
        let Some(pair) = st.pairs.get_mut(key) else {
            return false;
        };
        let before = pair.waiters.len();
        pair.waiters.retain(|w| w.id != waiter_id);
        pair.waiters.len() != before
    }

    pub fn release(&self, job_type: &str, model_id: &str) {
        let mut st = self.state.lock();
        let key = (job_type.to_string(), model_id.to_string());
        if let Some(pair) = st.pairs.get_mut(&key) {
            pair.in_use = pair.in_use.saturating_sub(1);
        }
        if let Some(gauge) = st.gauges.get_mut(model_id) {
            gauge.active = gauge.active.saturating_sub(1);
        }
        Self::grant_ready(&mut st, model_id);
    }

    /// Resize every pair to the allocation; pairs absent from the snapshot
    /// drop to zero capacity. Growth wakes waiters in FIFO order.
    pub fn apply_allocation(&self, snapshot: &AllocationSnapshot) {
        let mut st = self.state.lock();

        for (job_type, models) in &snapshot.slots_by_job_type_and_model {
            for (model_id, &count) in models {
                let key = (job_type.clone(), model_id.clone());
                self.ensure_entries(&mut st, &key);
                if let Some(pair) = st.pairs.get_mut(&key) {
                    pair.capacity = count;
                }
            }
        }

        for (key, pair) in st.pairs.iter_mut() {
            let present = snapshot
                .slots_by_job_type_and_model
                .get(&key.0)
                .is_some_and(|m| m.contains_key(&key.1));
            if !present {
                pair.capacity = 0;
            }
        }

        let models: HashSet<String> = st.pairs.keys().map(|k| k.1.clone()).collect();
        for model_id in models {
            Self::grant_ready(&mut st, &model_id);
        }
    }

    /// Resolve every pending wait as canceled. In-use counts are untouched;
    /// running jobs release normally.
    pub fn cancel_all(&self) {
        let mut st = self.state.lock();
        for pair in st.pairs.values_mut() {
            // Dropping the senders resolves the receivers as canceled.
            pair.waiters.clear();
        }
    }

    pub fn table(&self) -> Vec<PairSlotsView> {
        let st = self.state.lock();
        let mut out: Vec<PairSlotsView> = st
            .pairs
            .iter()
            .map(|(key, pair)| PairSlotsView {
                job_type: key.0.clone(),
                model_id: key.1.clone(),
                capacity: pair.capacity,
                in_use: pair.in_use,
                waiting: pair.waiters.len(),
            })
            .collect();
        out.sort_by(|a, b| (&a.job_type, &a.model_id).cmp(&(&b.job_type, &b.model_id)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(entries: &[(&str, &str, u32)]) -> AllocationSnapshot {
        let mut slots: coordinator::types::SlotTable = HashMap::new();
        for (job, model, count) in entries {
            slots
                .entry(job.to_string())
                .or_default()
                .insert(model.to_string(), *count);
        }
        AllocationSnapshot {
            version: 1,
            instance_count: 1,
            slots_by_job_type_and_model: slots,
        }
    }

    fn mk_pool(limits: &[(&str, u64)]) -> (Arc<SlotPool>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let pool = SlotPool::new(
            limits.iter().map(|(m, l)| (m.to_string(), *l)).collect(),
            rx,
        );
        (Arc::new(pool), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_wake_in_fifo_order() {
        let (pool, _stop) = mk_pool(&[]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 1)]));

        assert!(pool.try_acquire("chat", "m1"));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let res = pool.acquire("chat", "m1", 60_000).await;
                assert_eq!(res, SlotAcquire::Acquired);
                order.lock().push(i);
                pool.release("chat", "m1");
            }));
            // Deterministic enqueue order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        pool.release("chat", "m1");
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_times_out() {
        let (pool, _stop) = mk_pool(&[]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 0)]));

        let res = pool.acquire("chat", "m1", 100).await;
        assert_eq!(res, SlotAcquire::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn allocation_growth_wakes_waiters() {
        let (pool, _stop) = mk_pool(&[]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 0)]));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("chat", "m1", 60_000).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.apply_allocation(&AllocationSnapshot {
            version: 2,
            ..snapshot(&[("chat", "m1", 1)])
        });

        assert_eq!(waiter.await.unwrap(), SlotAcquire::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn shrink_below_in_use_kills_nothing() {
        let (pool, _stop) = mk_pool(&[]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 2)]));

        assert!(pool.try_acquire("chat", "m1"));
        assert!(pool.try_acquire("chat", "m1"));

        pool.apply_allocation(&AllocationSnapshot {
            version: 2,
            ..snapshot(&[("chat", "m1", 1)])
        });

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("chat", "m1", 60_000).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        // First release only brings in-use back to the new cap.
        pool.release("chat", "m1");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!waiter.is_finished());

        pool.release("chat", "m1");
        assert_eq!(waiter.await.unwrap(), SlotAcquire::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_resolves_pending_waits() {
        let (pool, _stop) = mk_pool(&[]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 0)]));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("chat", "m1", 60_000).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.cancel_all();
        assert_eq!(waiter.await.unwrap(), SlotAcquire::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_gauge_spans_job_types() {
        let (pool, _stop) = mk_pool(&[("m1", 1)]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 1), ("embed", "m1", 1)]));

        assert!(pool.try_acquire("chat", "m1"));
        // Pair capacity is free but the model gauge is saturated.
        assert!(!pool.try_acquire("embed", "m1"));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("embed", "m1", 60_000).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.release("chat", "m1");
        assert_eq!(waiter.await.unwrap(), SlotAcquire::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn stress_many_waiters_all_complete() {
        let (pool, _stop) = mk_pool(&[]);
        pool.apply_allocation(&snapshot(&[("chat", "m1", 4)]));

        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                assert_eq!(
                    pool.acquire("chat", "m1", 60_000).await,
                    SlotAcquire::Acquired
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release("chat", "m1");
                done.fetch_add(1, Ordering::Relaxed);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(done.load(Ordering::Relaxed), 32);
    }
}
