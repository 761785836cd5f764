use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use stackscope_types::{ConnectionStatus, LogEvent, Room};

use crate::drain::{DRAIN_BATCH_SIZE, DrainScheduler, Drainer, THROTTLE_INTERVAL};
use crate::filter::LogFilter;
use crate::ingest::IngestBuffer;
use crate::source::{EventSource, Subscription};
use crate::store::{LogStore, MAX_LOGS};
use crate::view::{FilterCache, FilteredView};

/// Sizing and pacing of a [`LogStream`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Maximum retained entries
    pub capacity: usize,

    /// Drain tick period
    pub throttle_interval: Duration,

    /// Entries moved per drain tick
    pub drain_batch: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_LOGS,
            throttle_interval: THROTTLE_INTERVAL,
            drain_batch: DRAIN_BATCH_SIZE,
        }
    }
}

/// Live connection to an event source
struct Attachment {
    source: Arc<dyn EventSource>,
    subscription: Subscription,
    drain: DrainScheduler,
}

/// Owns the ingest buffer, the bounded store and the filter state for one
/// consumer, plus its subscription to an event source.
///
/// The source callback is the only writer to the buffer and the drain tick the
/// only writer to the store; everything else reads snapshots.
pub struct LogStream {
    config: StreamConfig,

    /// Events waiting for the next drain tick
    buffer: IngestBuffer,

    /// Retained entries
    store: LogStore,

    /// Current filter configuration
    filter: LogFilter,

    /// Last computed view
    cache: FilterCache,

    /// Rooms currently joined on the attached source
    rooms: BTreeSet<Room>,

    attachment: Option<Attachment>,
}

impl LogStream {
    pub fn new(config: StreamConfig) -> Self {
        let store = LogStore::new(config.capacity);
        Self {
            config,
            buffer: IngestBuffer::new(),
            store,
            filter: LogFilter::default(),
            cache: FilterCache::default(),
            rooms: BTreeSet::new(),
            attachment: None,
        }
    }

    /// Subscribe to a source, join the rooms for the current service selection
    /// and start the drain tick. Any previous attachment is released first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&mut self, source: Arc<dyn EventSource>) {
        self.detach();

        let buffer = self.buffer.clone();
        let subscription = source.subscribe(Arc::new(move |event| {
            buffer.enqueue(event);
        }));
        let drain = DrainScheduler::start(self.drainer(), self.config.throttle_interval);

        self.attachment = Some(Attachment {
            source,
            subscription,
            drain,
        });
        self.sync_rooms();
        debug!(rooms = ?self.rooms, "log stream attached");
    }

    /// Leave all rooms, drop the subscription and stop the drain tick.
    /// Retained entries and pending events are kept.
    pub fn detach(&mut self) {
        let Some(Attachment {
            source,
            subscription,
            mut drain,
        }) = self.attachment.take()
        else {
            return;
        };

        for room in std::mem::take(&mut self.rooms) {
            source.leave(&subscription, &room);
        }
        subscription.unsubscribe();
        drain.stop();
        debug!("log stream detached");
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Ingest an event directly, bypassing any source
    pub fn enqueue(&self, event: LogEvent) -> u64 {
        self.buffer.enqueue(event)
    }

    /// Run one drain tick by hand while detached. Returns how many entries
    /// were moved; always 0 while attached, where the scheduled tick is the
    /// only store writer.
    pub fn drain_once(&self) -> usize {
        if self.attachment.is_some() {
            debug!("manual drain skipped, drain scheduler is running");
            return 0;
        }
        self.drainer().drain_once()
    }

    /// Replace the filter configuration, updating room membership if the
    /// service selection changed
    pub fn set_filter(&mut self, filter: LogFilter) {
        let services_changed = filter.services != self.filter.services;
        self.filter = filter;
        if services_changed {
            self.sync_rooms();
        }
    }

    /// Modify the filter configuration in place
    pub fn update_filter(&mut self, update: impl FnOnce(&mut LogFilter)) {
        let mut filter = self.filter.clone();
        update(&mut filter);
        self.set_filter(filter);
    }

    /// Select the services to show (empty = all)
    pub fn select_services<I, S>(&mut self, services: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services = services.into_iter().map(Into::into).collect();
        self.update_filter(|filter| filter.services = services);
    }

    pub fn filter(&self) -> &LogFilter {
        &self.filter
    }

    /// Filtered view of the store, recomputed only when the store or the
    /// filter changed since the last call
    pub fn view(&mut self) -> Arc<FilteredView> {
        match self.cache.get(&self.filter, self.store.revision()) {
            Some(view) => view,
            None => self.refresh_view(),
        }
    }

    /// Recompute the filtered view unconditionally (sliding time windows move
    /// even when the store does not)
    pub fn refresh_view(&mut self) -> Arc<FilteredView> {
        let view = Arc::new(FilteredView::build(
            self.store.snapshot(),
            &self.filter,
            Utc::now(),
        ));
        self.cache.update(&self.filter, Arc::clone(&view));
        view
    }

    /// Drop all retained entries. Local only: nothing is sent upstream and
    /// events still waiting in the ingest buffer are kept.
    pub fn clear(&mut self) {
        self.store.clear();
        self.cache.invalidate();
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Events waiting for the next drain tick
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Connection state of the attached source, `Disconnected` when detached
    pub fn status(&self) -> ConnectionStatus {
        self.attachment
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |a| a.source.status())
    }

    /// Receiver notified whenever the store changes
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    pub fn joined_rooms(&self) -> &BTreeSet<Room> {
        &self.rooms
    }

    fn drainer(&self) -> Drainer {
        Drainer::new(self.buffer.clone(), self.store.clone(), self.config.drain_batch)
    }

    /// Leave rooms that are no longer wanted, then join the new ones
    fn sync_rooms(&mut self) {
        let Some(attachment) = &self.attachment else {
            return;
        };

        let target = rooms_for(&self.filter.services);
        for room in self.rooms.difference(&target) {
            attachment.source.leave(&attachment.subscription, room);
        }
        for room in target.difference(&self.rooms) {
            attachment.source.join(&attachment.subscription, room);
        }
        self.rooms = target;
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.detach();
    }
}

/// `logs:all` for an empty selection, one room per service otherwise
fn rooms_for(services: &BTreeSet<String>) -> BTreeSet<Room> {
    if services.is_empty() {
        BTreeSet::from([Room::All])
    } else {
        services.iter().cloned().map(Room::Service).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LogHub;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use stackscope_types::{LevelFilter, LogLevel, TimeRange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that records every call made on it
    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<String>>,
        active: Arc<AtomicUsize>,
    }

    impl RecordingSource {
        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl EventSource for RecordingSource {
        fn subscribe(&self, _callback: crate::source::EventCallback) -> Subscription {
            self.calls.lock().push("subscribe".to_string());
            self.active.fetch_add(1, Ordering::SeqCst);
            let active = Arc::clone(&self.active);
            Subscription::new(0, move || {
                active.fetch_sub(1, Ordering::SeqCst);
            })
        }

        fn join(&self, _subscription: &Subscription, room: &Room) {
            self.calls.lock().push(format!("join {room}"));
        }

        fn leave(&self, _subscription: &Subscription, room: &Room) {
            self.calls.lock().push(format!("leave {room}"));
        }

        fn status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
    }

    fn small_stream(capacity: usize) -> LogStream {
        LogStream::new(StreamConfig {
            capacity,
            ..StreamConfig::default()
        })
    }

    #[tokio::test]
    async fn test_room_membership_follows_service_selection() {
        let source = Arc::new(RecordingSource::default());
        let mut stream = LogStream::new(StreamConfig::default());

        stream.attach(source.clone());
        assert_eq!(source.take_calls(), vec!["subscribe", "join logs:all"]);

        stream.select_services(["api"]);
        assert_eq!(source.take_calls(), vec!["leave logs:all", "join logs:api"]);

        stream.select_services(["api", "db"]);
        assert_eq!(source.take_calls(), vec!["join logs:db"]);

        stream.select_services(["db", "api"]);
        assert!(source.take_calls().is_empty());

        // Non-service filter changes never touch rooms
        stream.update_filter(|f| f.level = LevelFilter::Only(LogLevel::Error));
        assert!(source.take_calls().is_empty());

        stream.select_services(Vec::<String>::new());
        assert_eq!(
            source.take_calls(),
            vec!["leave logs:api", "leave logs:db", "join logs:all"]
        );
    }

    #[tokio::test]
    async fn test_detach_releases_subscription_rooms_and_timer() {
        let source = Arc::new(RecordingSource::default());
        let mut stream = LogStream::new(StreamConfig::default());
        stream.select_services(["api"]);
        stream.attach(source.clone());
        assert_eq!(source.active.load(Ordering::SeqCst), 1);
        source.take_calls();

        stream.detach();
        assert!(!stream.is_attached());
        assert_eq!(source.active.load(Ordering::SeqCst), 0);
        assert_eq!(source.take_calls(), vec!["leave logs:api"]);
        assert!(stream.joined_rooms().is_empty());
        assert_eq!(stream.status(), ConnectionStatus::Disconnected);

        // Detaching twice is harmless
        stream.detach();
        assert!(source.take_calls().is_empty());
    }

    #[tokio::test]
    async fn test_reattach_releases_previous_subscription_first() {
        let source = Arc::new(RecordingSource::default());
        let mut stream = LogStream::new(StreamConfig::default());

        stream.attach(source.clone());
        stream.attach(source.clone());
        assert_eq!(source.active.load(Ordering::SeqCst), 1);
        assert_eq!(
            source.take_calls(),
            vec!["subscribe", "join logs:all", "leave logs:all", "subscribe", "join logs:all"]
        );

        drop(stream);
        assert_eq!(source.active.load(Ordering::SeqCst), 0);
        assert_eq!(source.take_calls(), vec!["leave logs:all"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_filtered_view() {
        let hub = LogHub::new();
        let mut stream = LogStream::new(StreamConfig::default());
        stream.attach(Arc::new(hub.clone()));
        hub.set_status(ConnectionStatus::Connected);
        assert_eq!(stream.status(), ConnectionStatus::Connected);

        let now = Utc::now();
        for i in 0..25i64 {
            let service = if i % 2 == 0 { "api" } else { "db" };
            let level = match i % 3 {
                0 => LogLevel::Error,
                1 => LogLevel::Warn,
                _ => LogLevel::Info,
            };
            let age = if i % 5 == 4 {
                ChronoDuration::minutes(10)
            } else {
                ChronoDuration::seconds(i)
            };
            let event = LogEvent::new(service, format!("event {i}"), now - age).with_level(level);
            assert!(hub.publish(event));
        }
        assert_eq!(stream.pending(), 25);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(stream.pending(), 0);
        assert_eq!(stream.store().len(), 25);

        stream.set_filter(
            LogFilter::default()
                .with_services(["api"])
                .with_level(LevelFilter::Only(LogLevel::Error))
                .with_time_range(TimeRange::Last5m),
        );
        let view = stream.view();
        let lines: Vec<&str> = view.entries.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["event 0", "event 6", "event 12", "event 18"]);
        assert!(view.entries.iter().all(|e| e.service == "api" && e.level == LogLevel::Error));
        assert!(view.entries.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(view.insights.error_count, 4);
        assert_eq!(view.total, 25);
    }

    #[test]
    fn test_view_is_cached_until_store_or_filter_changes() {
        let mut stream = small_stream(100);
        stream.enqueue(LogEvent::new("api", "one", Utc::now()));
        stream.drain_once();

        let first = stream.view();
        let again = stream.view();
        assert!(Arc::ptr_eq(&first, &again));

        stream.enqueue(LogEvent::new("api", "two", Utc::now()));
        stream.drain_once();
        let after_drain = stream.view();
        assert!(!Arc::ptr_eq(&first, &after_drain));
        assert_eq!(after_drain.len(), 2);

        stream.update_filter(|f| f.search = "two".to_string());
        assert_eq!(stream.view().len(), 1);
    }

    #[test]
    fn test_bounded_growth_through_stream() {
        let mut stream = small_stream(50);
        for i in 0..120 {
            stream.enqueue(LogEvent::new("api", format!("line {i}"), Utc::now()));
        }
        while stream.drain_once() > 0 {}

        assert_eq!(stream.store().len(), 50);
        let view = stream.view();
        assert_eq!(view.entries.first().unwrap().line, "line 70");
        assert_eq!(view.entries.last().unwrap().line, "line 119");
    }

    #[test]
    fn test_clear_is_local_and_keeps_pending() {
        let mut stream = small_stream(100);
        for i in 0..15 {
            stream.enqueue(LogEvent::new("db", format!("line {i}"), Utc::now()));
        }
        stream.drain_once();
        assert_eq!(stream.view().len(), 10);

        stream.clear();
        assert!(stream.store().is_empty());
        assert!(stream.view().is_empty());
        assert_eq!(stream.pending(), 5);

        stream.drain_once();
        assert_eq!(stream.view().len(), 5);
    }
    #[tokio::test(start_paused = true)]
    async fn test_streams_on_one_hub_only_receive_their_services() {
        let hub = LogHub::new();
        let mut api = LogStream::new(StreamConfig::default());
        let mut db = LogStream::new(StreamConfig::default());
        api.select_services(["api"]);
        db.select_services(["db"]);
        api.attach(Arc::new(hub.clone()));
        db.attach(Arc::new(hub.clone()));

        for i in 0..5 {
            assert!(hub.publish(LogEvent::new("db", format!("db {i}"), Utc::now())));
        }
        assert!(hub.publish(LogEvent::new("api", "api 0", Utc::now())));

        assert_eq!(api.pending(), 1);
        assert_eq!(db.pending(), 5);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let services: Vec<String> = api.view().entries.iter().map(|e| e.service.clone()).collect();
        assert_eq!(services, vec!["api"]);
        assert_eq!(db.view().len(), 5);

        // Widening one stream's selection leaves the other untouched
        api.select_services(Vec::<String>::new());
        assert!(hub.publish(LogEvent::new("cache", "hit", Utc::now())));
        assert_eq!(api.pending(), 1);
        assert_eq!(db.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_drain_is_refused_while_attached() {
        let hub = LogHub::new();
        let mut stream = LogStream::new(StreamConfig::default());
        stream.attach(Arc::new(hub.clone()));

        // Let the scheduler's immediate first tick pass on an empty buffer
        tokio::time::sleep(Duration::from_millis(1)).await;
        for i in 0..500 {
            hub.publish(LogEvent::new("api", format!("line {i}"), Utc::now()));
        }

        assert_eq!(stream.drain_once(), 0);
        assert!(stream.store().is_empty());
        assert_eq!(stream.pending(), 500);

        // Only the scheduled tick moves entries, one batch per period
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stream.store().len(), DRAIN_BATCH_SIZE);

        stream.detach();
        assert_eq!(stream.drain_once(), DRAIN_BATCH_SIZE);
    }
}
