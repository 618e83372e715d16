//! Sliding usage window for the decaying quota kinds.

use std::collections::VecDeque;

#[derive(Clone, Debug)]
struct WindowEntry {
    ts_ms: u64,
    amount: u64,
}

/// Timestamped usage amounts with a running total. Entries expire once they
/// are a full window old; refunds are taken from the newest entries so a
/// refund never touches usage that has already decayed away.
#[derive(Clone, Debug)]
pub struct SlidingWindow {
    window_ms: u64,
    entries: VecDeque<WindowEntry>,
    total: u64,
}

impl SlidingWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            entries: VecDeque::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, now_ms: u64, amount: u64) {
        self.evict(now_ms);
        if amount == 0 {
            return;
        }
        self.entries.push_back(WindowEntry { ts_ms: now_ms, amount });
        self.total += amount;
    }

    /// Drop entries older than the window.
    pub fn evict(&mut self, now_ms: u64) {
        while let Some(front) = self.entries.front() {
            if now_ms.saturating_sub(front.ts_ms) >= self.window_ms {
                let removed = self.entries.pop_front().expect("front checked");
                self.total -= removed.amount;
            } else {
                break;
            }
        }
    }

    /// In-window usage as of `now_ms`.
    pub fn total(&mut self, now_ms: u64) -> u64 {
        self.evict(now_ms);
        self.total
    }

    /// Subtract up to `amount` from the newest entries, never below zero.
    /// Returns how much was actually refunded.
    pub fn refund(&mut self, amount: u64) -> u64 {
        let mut remaining = amount;
        while remaining > 0 {
            let Some(back) = self.entries.back_mut() else {
                break;
            };
            let take = back.amount.min(remaining);
            back.amount -= take;
            self.total -= take;
            remaining -= take;
            if back.amount == 0 {
                self.entries.pop_back();
            }
        }
        amount - remaining
    }

    /// Time until the oldest in-window entry expires.
    pub fn resets_in_ms(&mut self, now_ms: u64) -> Option<u64> {
        self.evict(now_ms);
        self.entries
            .front()
            .map(|e| (e.ts_ms + self.window_ms).saturating_sub(now_ms))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
