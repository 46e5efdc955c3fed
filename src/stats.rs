//! Event-sink counters for adaptive hash activity
//!
//! The engine treats these as opaque sinks; nothing in the search system
//! reads them back.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the search system
#[derive(Debug, Default)]
pub struct SearchStats {
    /// Hash entries inserted
    pub rows_added: AtomicU64,
    /// Hash entries erased
    pub rows_removed: AtomicU64,
    /// Hash entries retargeted in place
    pub rows_updated: AtomicU64,
    /// Erase calls that found no entry
    pub rows_remove_not_found: AtomicU64,
    /// Pages that got a hash index built
    pub pages_added: AtomicU64,
    /// Pages whose hash index was dropped
    pub pages_removed: AtomicU64,
}

impl SearchStats {
    /// Record inserted hash rows
    #[inline]
    pub fn add_rows(&self, n: u64) {
        self.rows_added.fetch_add(n, Ordering::Relaxed);
    }

    /// Record erased hash rows
    #[inline]
    pub fn remove_rows(&self, n: u64) {
        self.rows_removed.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rows_added: self.rows_added.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            rows_remove_not_found: self.rows_remove_not_found.load(Ordering::Relaxed),
            pages_added: self.pages_added.load(Ordering::Relaxed),
            pages_removed: self.pages_removed.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`SearchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Hash entries inserted
    pub rows_added: u64,
    /// Hash entries erased
    pub rows_removed: u64,
    /// Hash entries retargeted in place
    pub rows_updated: u64,
    /// Erase calls that found no entry
    pub rows_remove_not_found: u64,
    /// Pages that got a hash index built
    pub pages_added: u64,
    /// Pages whose hash index was dropped
    pub pages_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let stats = SearchStats::default();
        stats.add_rows(3);
        stats.remove_rows(2);
        stats.pages_added.fetch_add(1, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.rows_added, 3);
        assert_eq!(snap.rows_removed, 2);
        assert_eq!(snap.pages_added, 1);
        assert_eq!(snap.rows_updated, 0);
    }
}
