use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace};

use stackscope_types::{ConnectionStatus, LogEvent, Room};

/// Callback invoked once per delivered event
pub type EventCallback = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// Something that pushes log events at us: a socket, a hub, a test double.
///
/// Delivery is push-only; a source never waits on the consumer. Room
/// membership belongs to a subscription, so each consumer only receives the
/// services it joined.
pub trait EventSource: Send + Sync {
    /// Register a callback. Delivery stops when the returned handle is dropped.
    fn subscribe(&self, callback: EventCallback) -> Subscription;

    /// Start receiving events for a room on this subscription
    fn join(&self, subscription: &Subscription, room: &Room);

    /// Stop receiving events for a room on this subscription
    fn leave(&self, subscription: &Subscription, room: &Room);

    /// Current connection state
    fn status(&self) -> ConnectionStatus;
}

/// Handle for a registered callback; unsubscribes on drop
pub struct Subscription {
    id: u64,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(id: u64, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    /// Source-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Release the subscription now
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// A registered callback and the rooms it joined
struct Subscriber {
    callback: EventCallback,
    rooms: BTreeSet<Room>,
}

impl Subscriber {
    fn wants(&self, service: &str) -> bool {
        self.rooms.iter().any(|room| room.covers(service))
    }
}

struct HubInner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
}

/// In-process event source with room routing.
///
/// Producers call [`LogHub::publish`]; the event reaches each subscriber that
/// joined `logs:all` or the event's own `logs:<service>` room.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<HubInner>,
}

impl LogHub {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
                status,
            }),
        }
    }

    /// Deliver an event to the subscribers whose rooms cover its service.
    /// Returns false if nobody received it.
    pub fn publish(&self, event: LogEvent) -> bool {
        // Callbacks run outside the lock so they may subscribe/unsubscribe
        let callbacks: Vec<EventCallback> = self
            .inner
            .subscribers
            .read()
            .values()
            .filter(|subscriber| subscriber.wants(&event.service))
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect();

        let Some((last, rest)) = callbacks.split_last() else {
            trace!(service = %event.service, "no room joined for event, dropping");
            return false;
        };
        for callback in rest {
            callback(event.clone());
        }
        last(event);
        true
    }

    /// Update the connection state
    pub fn set_status(&self, status: ConnectionStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            debug!(%status, "event source status changed");
        }
    }

    /// Receiver notified on connection state changes
    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Rooms joined by any subscriber
    pub fn joined_rooms(&self) -> Vec<Room> {
        let rooms: BTreeSet<Room> = self
            .inner
            .subscribers
            .read()
            .values()
            .flat_map(|subscriber| subscriber.rooms.iter().cloned())
            .collect();
        rooms.into_iter().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for LogHub {
    fn subscribe(&self, callback: EventCallback) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                callback,
                rooms: BTreeSet::new(),
            },
        );

        let hub: Weak<HubInner> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(hub) = hub.upgrade() {
                hub.subscribers.write().remove(&id);
            }
        })
    }

    fn join(&self, subscription: &Subscription, room: &Room) {
        let mut subscribers = self.inner.subscribers.write();
        if let Some(subscriber) = subscribers.get_mut(&subscription.id())
            && subscriber.rooms.insert(room.clone())
        {
            debug!(subscriber = subscription.id(), %room, "joined room");
        }
    }

    fn leave(&self, subscription: &Subscription, room: &Room) {
        let mut subscribers = self.inner.subscribers.write();
        if let Some(subscriber) = subscribers.get_mut(&subscription.id())
            && subscriber.rooms.remove(room)
        {
            debug!(subscriber = subscription.id(), %room, "left room");
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }
}
