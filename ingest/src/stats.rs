use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-outcome counters for the lifetime of the process.
pub trait StatsRegister: Send + Sync {
    fn record_processed(&self);
    fn record_ignored(&self);
    fn snapshot(&self) -> StatsSnapshot;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub ignored: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed Items: {}\nIgnored Items: {}",
            self.processed, self.ignored
        )
    }
}

#[derive(Debug, Default)]
pub struct AtomicStats {
    processed: AtomicU64,
    ignored: AtomicU64,
}

impl AtomicStats {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsRegister for AtomicStats {
    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}
