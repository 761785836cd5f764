use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use stackscope_types::{LogEntry, LogEvent};

/// Unbounded staging queue between the event source callback and the drain tick.
///
/// Enqueueing never blocks and never refuses an event; the drain scheduler is
/// what bounds the downstream work.
#[derive(Clone, Default)]
pub struct IngestBuffer {
    /// Entries waiting for the next drain, oldest first
    pending: Arc<Mutex<VecDeque<LogEntry>>>,

    /// Next entry ID (never reset, so IDs stay unique across clears)
    next_id: Arc<AtomicU64>,
}

impl IngestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert an event into an entry and append it to the tail.
    /// Returns the assigned entry ID.
    pub fn enqueue(&self, event: LogEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = LogEntry::from_event(id, event, Utc::now());
        self.pending.lock().push_back(entry);
        id
    }

    /// Remove up to `max` entries from the head, oldest first
    pub fn take_batch(&self, max: usize) -> Vec<LogEntry> {
        let mut pending = self.pending.lock();
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    /// Number of entries waiting to be drained
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(service: &str, line: &str) -> LogEvent {
        LogEvent::new(service, line, Utc::now())
    }

    #[test]
    fn test_ids_are_unique_within_a_burst() {
        let buffer = IngestBuffer::new();
        let a = buffer.enqueue(event("api", "same"));
        let b = buffer.enqueue(event("api", "same"));
        assert_ne!(a, b);

        let batch = buffer.take_batch(10);
        assert_eq!(batch.len(), 2);
        assert_ne!(batch[0].id, batch[1].id);
    }

    #[test]
    fn test_take_batch_is_fifo_and_partial() {
        let buffer = IngestBuffer::new();
        for i in 0..15 {
            buffer.enqueue(event("api", &format!("line {i}")));
        }

        let first = buffer.take_batch(10);
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].line, "line 0");
        assert_eq!(first[9].line, "line 9");
        assert_eq!(buffer.len(), 5);

        let rest = buffer.take_batch(10);
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[0].line, "line 10");
        assert!(buffer.is_empty());
        assert!(buffer.take_batch(10).is_empty());
    }

    #[test]
    fn test_clones_share_the_queue() {
        let buffer = IngestBuffer::new();
        let producer = buffer.clone();
        producer.enqueue(event("db", "from callback"));
        assert_eq!(buffer.len(), 1);
    }
}
