//! Per-status connection counters.
//!
//! Updated exactly at each guarded transition so aggregate queries never
//! scan the registry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tarn_core::Status;

#[derive(Debug, Default)]
pub struct StatusCounters {
    counts: [AtomicUsize; 3],
    /// Bumped after every update; a recount is only comparable when it
    /// is unchanged across the whole pass.
    generation: AtomicU64,
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new connection entered the pool in `status`.
    pub fn added(&self, status: Status) {
        if let Some(i) = status.counter_index() {
            self.counts[i].fetch_add(1, Ordering::SeqCst);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// A connection moved from `from` to `to`.
    pub fn moved(&self, from: Status, to: Status) {
        if let Some(i) = from.counter_index() {
            self.counts[i].fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(i) = to.counter_index() {
            self.counts[i].fetch_add(1, Ordering::SeqCst);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, status: Status) -> usize {
        status
            .counter_index()
            .map(|i| self.counts[i].load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Connections in any counted status.
    pub fn live(&self) -> usize {
        Status::COUNTED.iter().map(|s| self.get(*s)).sum()
    }
}
