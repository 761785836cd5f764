use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

use stackscope_types::{LogEntry, LogLevel};

/// Maximum number of retained entries
pub const MAX_LOGS: usize = 10_000;

/// Entries are shared with views and snapshots, never mutated after insertion
pub type ArcLogEntry = Arc<LogEntry>;

struct Inner {
    entries: VecDeque<ArcLogEntry>,
    counts: LevelCounts,
}

/// Bounded, ordered store of log entries with oldest-first eviction
#[derive(Clone)]
pub struct LogStore {
    /// Entries plus per-level totals, updated under one lock
    inner: Arc<RwLock<Inner>>,

    /// Maximum capacity
    capacity: usize,

    /// Bumped on every mutation; receivers use it to skip redundant work
    revision: Arc<watch::Sender<u64>>,
}

/// Consistent view of the store at one revision
#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub entries: Vec<ArcLogEntry>,
}

impl LogStore {
    /// Create a new store with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                counts: LevelCounts::default(),
            })),
            capacity,
            revision: Arc::new(revision),
        }
    }

    /// Append a batch to the tail, trimming the head back down to capacity.
    /// Returns how many entries were evicted.
    pub fn append(&self, batch: Vec<LogEntry>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut inner = self.inner.write();
        for entry in batch {
            inner.counts.add(entry.level);
            inner.entries.push_back(Arc::new(entry));
        }

        let mut evicted = 0;
        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.entries.pop_front() {
                inner.counts.remove(oldest.level);
                evicted += 1;
            }
        }
        self.revision.send_modify(|r| *r += 1);

        if evicted > 0 {
            trace!(evicted, retained = inner.entries.len(), "evicted oldest log entries");
        }
        evicted
    }

    /// Empty the store. Local only; nothing is signalled upstream.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.counts = LevelCounts::default();
        self.revision.send_modify(|r| *r += 1);
    }

    /// All entries plus the revision they belong to
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        StoreSnapshot {
            revision: *self.revision.borrow(),
            entries: inner.entries.iter().cloned().collect(),
        }
    }

    /// Current revision
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver notified whenever the store changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Get entry count per log level across the retained entries
    pub fn level_counts(&self) -> LevelCounts {
        self.inner.read().counts.clone()
    }

    /// Get the last N entries
    pub fn tail(&self, n: usize) -> Vec<ArcLogEntry> {
        let inner = self.inner.read();
        let start = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub debug: usize,
}

impl LevelCounts {
    /// Count levels over a sequence of entries
    pub fn tally<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            counts.add(entry.level);
        }
        counts
    }

    pub fn get(&self, level: LogLevel) -> usize {
        match level {
            LogLevel::Info => self.info,
            LogLevel::Warn => self.warn,
            LogLevel::Error => self.error,
            LogLevel::Debug => self.debug,
        }
    }

    pub fn total(&self) -> usize {
        self.info + self.warn + self.error + self.debug
    }

    fn add(&mut self, level: LogLevel) {
        *self.slot(level) += 1;
    }

    fn remove(&mut self, level: LogLevel) {
        let slot = self.slot(level);
        *slot = slot.saturating_sub(1);
    }

    fn slot(&mut self, level: LogLevel) -> &mut usize {
        match level {
            LogLevel::Info => &mut self.info,
            LogLevel::Warn => &mut self.warn,
            LogLevel::Error => &mut self.error,
            LogLevel::Debug => &mut self.debug,
        }
    }
}
