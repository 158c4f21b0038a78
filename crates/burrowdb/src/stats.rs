//! Operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking store activity.
#[derive(Debug, Default)]
pub struct Stats {
    gets: AtomicU64,
    puts: AtomicU64,
    dels: AtomicU64,
    aborts: AtomicU64,
    recovered_logs: AtomicU64,
}

impl Stats {
    /// Creates zeroed counters.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_gets(&self, n: u64) {
        self.gets.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_puts(&self, n: u64) {
        self.puts.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dels(&self, n: u64) {
        self.dels.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_aborts(&self, n: u64) {
        self.aborts.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_recovered_logs(&self, n: u64) {
        self.recovered_logs.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            dels: self.dels.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            recovered_logs: self.recovered_logs.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the store's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Lookups served.
    pub gets: u64,
    /// Entries inserted or replaced by commits.
    pub puts: u64,
    /// Entries removed by commits.
    pub dels: u64,
    /// Batches aborted.
    pub aborts: u64,
    /// WAL records replayed at open.
    pub recovered_logs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.add_gets(2);
        stats.add_puts(3);
        stats.add_dels(1);
        stats.add_aborts(1);
        stats.add_recovered_logs(4);

        let snap = stats.snapshot();
        assert_eq!(snap.gets, 2);
        assert_eq!(snap.puts, 3);
        assert_eq!(snap.dels, 1);
        assert_eq!(snap.aborts, 1);
        assert_eq!(snap.recovered_logs, 4);
    }
}
