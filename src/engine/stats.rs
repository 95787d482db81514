// Cache statistics — hit/miss counts, network activity, worker occupancy.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStatsSnapshot {
    pub disk_hits: u64,
    pub misses: u64,
    pub network_fetches: u64,
    pub fetch_failures: u64,
    pub decode_failures: u64,
    pub cancellations: u64,
    pub deliveries: u64,
    pub writes: u64,
    pub active_workers: u32,
    pub hit_rate: f64,
}

pub struct CacheStats {
    disk_hits: AtomicU64,
    misses: AtomicU64,
    network_fetches: AtomicU64,
    fetch_failures: AtomicU64,
    decode_failures: AtomicU64,
    cancellations: AtomicU64,
    deliveries: AtomicU64,
    writes: AtomicU64,
    active_workers: AtomicU32,
}

impl CacheStats {
    pub fn new() -> Self {
        Self {
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            network_fetches: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let disk_hits = self.disk_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = disk_hits + misses;
        let hit_rate = if lookups > 0 {
            disk_hits as f64 / lookups as f64
        } else {
            0.0
        };

        CacheStatsSnapshot {
            disk_hits,
            misses,
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_fetch();
        stats.record_write();

        stats.increment_workers();
        stats.increment_workers();
        stats.decrement_workers();

        let snap = stats.snapshot();
        assert_eq!(snap.disk_hits, 3);
        assert_eq!(snap.network_fetches, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.active_workers, 1);
        assert!((snap.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        assert_eq!(CacheStats::new().snapshot().hit_rate, 0.0);
    }
}
