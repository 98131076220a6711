//! Layout manager operation counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the layout manager.
#[derive(Debug, Default)]
pub struct LayoutStats {
    layouts_granted: AtomicU64,
    layouts_returned: AtomicU64,
    layouts_committed: AtomicU64,
    layouts_revoked: AtomicU64,
    recalls_issued: AtomicU64,
    recalls_resolved: AtomicU64,
    recalls_expired: AtomicU64,
    clients_blacklisted: AtomicU64,
    stateid_rejections: AtomicU64,
    try_later: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`LayoutStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutStatsSnapshot {
    pub layouts_granted: u64,
    pub layouts_returned: u64,
    pub layouts_committed: u64,
    pub layouts_revoked: u64,
    pub recalls_issued: u64,
    pub recalls_resolved: u64,
    pub recalls_expired: u64,
    pub clients_blacklisted: u64,
    pub stateid_rejections: u64,
    pub try_later: u64,
    pub errors: u64,
}

impl LayoutStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_grant(&self) {
        self.layouts_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_return(&self) {
        self.layouts_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.layouts_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revocations(&self, n: u64) {
        self.layouts_revoked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_recalls_issued(&self, n: u64) {
        self.recalls_issued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_recalls_resolved(&self, n: u64) {
        self.recalls_resolved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_recalls_expired(&self, n: u64) {
        self.recalls_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_blacklisted(&self) {
        self.clients_blacklisted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed operation by error class.
    pub fn record_error(&self, err: &crate::error::LayoutError) {
        use crate::error::LayoutError;
        match err {
            LayoutError::BadStateid { .. } => {
                self.stateid_rejections.fetch_add(1, Ordering::Relaxed);
            }
            LayoutError::TryLater { .. } => {
                self.try_later.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> LayoutStatsSnapshot {
        LayoutStatsSnapshot {
            layouts_granted: self.layouts_granted.load(Ordering::Relaxed),
            layouts_returned: self.layouts_returned.load(Ordering::Relaxed),
            layouts_committed: self.layouts_committed.load(Ordering::Relaxed),
            layouts_revoked: self.layouts_revoked.load(Ordering::Relaxed),
            recalls_issued: self.recalls_issued.load(Ordering::Relaxed),
            recalls_resolved: self.recalls_resolved.load(Ordering::Relaxed),
            recalls_expired: self.recalls_expired.load(Ordering::Relaxed),
            clients_blacklisted: self.clients_blacklisted.load(Ordering::Relaxed),
            stateid_rejections: self.stateid_rejections.load(Ordering::Relaxed),
            try_later: self.try_later.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayoutError;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = LayoutStats::new();
        assert_eq!(stats.snapshot(), LayoutStatsSnapshot::default());
    }

    #[test]
    fn test_record_counters() {
        let stats = LayoutStats::new();
        stats.record_grant();
        stats.record_grant();
        stats.record_return();
        stats.record_commit();
        stats.record_recalls_issued(3);
        stats.record_recalls_resolved(2);
        stats.record_blacklisted();

        let snap = stats.snapshot();
        assert_eq!(snap.layouts_granted, 2);
        assert_eq!(snap.layouts_returned, 1);
        assert_eq!(snap.layouts_committed, 1);
        assert_eq!(snap.recalls_issued, 3);
        assert_eq!(snap.recalls_resolved, 2);
        assert_eq!(snap.clients_blacklisted, 1);
    }

    #[test]
    fn test_record_error_classes() {
        let stats = LayoutStats::new();
        stats.record_error(&LayoutError::bad_stateid("stale"));
        stats.record_error(&LayoutError::try_later("recall pending"));
        stats.record_error(&LayoutError::try_later("blacklisted"));
        stats.record_error(&LayoutError::bad_layout("zero components"));

        let snap = stats.snapshot();
        assert_eq!(snap.stateid_rejections, 1);
        assert_eq!(snap.try_later, 2);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = std::sync::Arc::new(LayoutStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        s.record_grant();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().layouts_granted, 4000);
    }
}
