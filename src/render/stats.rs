/// Render pipeline counters
///
/// Tracks how requests were served:
/// - Cache hits and misses
/// - Compositions and snapshots performed
/// - Capacity rejections and placeholder responses
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RenderStats {
    hits: AtomicU64,
    misses: AtomicU64,
    compositions: AtomicU64,
    snapshots: AtomicU64,
    snapshot_failures: AtomicU64,
    capacity_rejections: AtomicU64,
    placeholders: AtomicU64,
    not_found: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of [`RenderStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub compositions: u64,
    pub snapshots: u64,
    pub snapshot_failures: u64,
    pub capacity_rejections: u64,
    pub placeholders: u64,
    pub not_found: u64,
    pub invalidations: u64,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_composition(&self) {
        self.compositions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, success: bool) {
        if success {
            self.snapshots.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_capacity_rejection(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_placeholder(&self) {
        self.placeholders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Composition count; tests use it to observe recomputation
    pub fn compositions(&self) -> u64 {
        self.compositions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compositions: self.compositions.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            placeholders: self.placeholders.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Hit rate over all cache lookups (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
