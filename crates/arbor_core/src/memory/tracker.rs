//! Allocation counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    device_bytes: AtomicU64,
    device_peak: AtomicU64,
    host_bytes: AtomicU64,
    host_peak: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Device bytes currently held.
    pub device_bytes: u64,
    /// Highest device bytes ever held.
    pub device_peak: u64,
    /// Host mirror bytes currently held.
    pub host_bytes: u64,
    /// Highest host mirror bytes ever held.
    pub host_peak: u64,
    /// Allocation events recorded.
    pub allocations: u64,
    /// Release events recorded.
    pub releases: u64,
}

/// Shared, cloneable allocation tracker.
///
/// Clones share counters. Updates are lock-free.
#[derive(Clone, Debug, Default)]
pub struct MemoryTracker {
    counters: Arc<Counters>,
}

fn grow(current: &AtomicU64, peak: &AtomicU64, bytes: u64) {
    let now = current.fetch_add(bytes, Ordering::AcqRel) + bytes;
    peak.fetch_max(now, Ordering::AcqRel);
}

fn shrink(current: &AtomicU64, bytes: u64) {
    // Saturate so a double report never wraps the counter.
    let _ = current.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(bytes))
    });
}

impl MemoryTracker {
    /// Creates a tracker with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a device allocation.
    pub fn record_device_alloc(&self, bytes: usize) {
        grow(&self.counters.device_bytes, &self.counters.device_peak, bytes as u64);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a device release.
    pub fn record_device_free(&self, bytes: usize) {
        shrink(&self.counters.device_bytes, bytes as u64);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a host mirror allocation.
    pub fn record_host_alloc(&self, bytes: usize) {
        grow(&self.counters.host_bytes, &self.counters.host_peak, bytes as u64);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a host mirror release.
    pub fn record_host_free(&self, bytes: usize) {
        shrink(&self.counters.host_bytes, bytes as u64);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters.
    #[must_use]
    pub fn usage(&self) -> MemoryUsage {
        let c = &self.counters;
        MemoryUsage {
            device_bytes: c.device_bytes.load(Ordering::Acquire),
            device_peak: c.device_peak.load(Ordering::Acquire),
            host_bytes: c.host_bytes.load(Ordering::Acquire),
            host_peak: c.host_peak.load(Ordering::Acquire),
            allocations: c.allocations.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.device_bytes,
            &c.device_peak,
            &c.host_bytes,
            &c.host_peak,
            &c.allocations,
            &c.releases,
        ] {
            counter.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_survives_release() {
        let tracker = MemoryTracker::new();
        tracker.record_device_alloc(100);
        tracker.record_device_alloc(50);
        tracker.record_device_free(100);

        let usage = tracker.usage();
        assert_eq!(usage.device_bytes, 50);
        assert_eq!(usage.device_peak, 150);
        assert_eq!(usage.allocations, 2);
        assert_eq!(usage.releases, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let tracker = MemoryTracker::new();
        let other = tracker.clone();
        other.record_host_alloc(64);
        assert_eq!(tracker.usage().host_bytes, 64);

        tracker.record_host_free(128);
        assert_eq!(tracker.usage().host_bytes, 0);

        tracker.reset();
        assert_eq!(other.usage(), MemoryUsage::default());
    }
}
