//! Typed in-process event bus (C2).
//!
//! Every event the core can raise is unified into one tagged enum,
//! [`CoreEvent`], published on a single [`EventBus`]. Every subscriber gets
//! its own bounded queue; a slow subscriber can never stall the publisher.
//! A full queue drops its oldest entry and counts the drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// One security- or lifecycle-relevant occurrence in the core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Outcome of a credential verification attempt.
    AuthAttempt { session_id: Option<String>, result: AuthResult },
    SessionCreated { session_id: String, user_id: String },
    SessionDeleted { session_id: String },
    SessionExpired { session_id: String },
    ContextCreated { context_id: String, session_id: String },
    ContextClosed { context_id: String, session_id: String },
    PageCreated { page_id: String, context_id: String, browser_id: String },
    PageNavigated { page_id: String, url: String, ok: bool },
    PageClosed { page_id: String },
    /// A caller attempted to operate on a resource it does not own.
    OwnershipViolation { resource_id: String, session_id: String },
    BrowserLaunched { browser_id: String },
    BrowserAcquired { browser_id: String, session_id: String },
    BrowserReleased { browser_id: String, session_id: String },
    BrowserRetired { browser_id: String, reason: String },
    HealthCheckFailed { browser_id: String, reason: String },
    HealthCheckRecovered { browser_id: String },
    CircuitOpened { key: String },
    CircuitHalfOpen { key: String },
    CircuitClosed { key: String },
    ScaledUp { by: usize, new_size: usize },
    ScaledDown { by: usize, new_size: usize },
    RecycleStarted { browser_id: String },
}

/// Result of a single authentication attempt, carried on [`CoreEvent::AuthAttempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allowed,
    Denied,
}

/// An event plus the time it was published.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: CoreEvent,
    pub at: DateTime<Utc>,
}

/// A bounded ring buffer shared between one publisher-side handle and one
/// receiver. Unlike a `tokio::sync::mpsc` channel (whose `try_send` rejects
/// the *newest* item when full), `push` here evicts the oldest queued item
/// to make room, giving true drop-oldest overflow semantics.
struct RingQueue {
    queue: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl RingQueue {
    fn push(&self, envelope: Envelope) {
        let mut queue = self.queue.lock().expect("event ring queue lock poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_waiters();
    }
}

/// Receiving end handed to a subscriber.
pub struct EventReceiver {
    queue: Arc<RingQueue>,
}

impl EventReceiver {
    /// Wait for the next event, in publish order, oldest first.
    ///
    /// Always resolves to `Some`: the bus itself never closes. A
    /// subscriber that wants to stop simply drops its `EventReceiver`.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.queue.queue.lock().expect("event ring queue lock poisoned").pop_front() {
                return Some(envelope);
            }
            self.queue.notify.notified().await;
        }
    }
}

struct Subscriber {
    name: String,
    queue: Arc<RingQueue>,
}

/// Central publish/subscribe point for [`CoreEvent`]s.
///
/// Cloning an `EventBus` is cheap and shares the same subscriber list
/// (it is `Arc`-backed internally); components take an `EventBus` by value.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<std::sync::Mutex<Vec<Subscriber>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose subscriber queues hold `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Register a new subscriber and return its receiver.
    ///
    /// `name` is used only for logging dropped-event warnings.
    pub fn subscribe(&self, name: impl Into<String>) -> EventReceiver {
        let queue = Arc::new(RingQueue {
            queue: Mutex::new(VecDeque::with_capacity(self.capacity)),
            capacity: self.capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let mut subs = self.inner.lock().expect("event bus subscriber lock poisoned");
        subs.push(Subscriber {
            name: name.into(),
            queue: queue.clone(),
        });
        EventReceiver { queue }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Never blocks: a subscriber whose queue is already at capacity has
    /// its oldest queued event evicted to make room (drop-oldest).
    pub fn publish(&self, event: CoreEvent) {
        let envelope = Envelope { event, at: Utc::now() };
        let subs = self.inner.lock().expect("event bus subscriber lock poisoned");
        for sub in subs.iter() {
            let was_full = sub.queue.queue.lock().expect("event ring queue lock poisoned").len() >= sub.queue.capacity;
            sub.queue.push(envelope.clone());
            if was_full {
                log::warn!("event bus subscriber '{}' queue full, dropped oldest event", sub.name);
            }
        }
    }

    /// Total events dropped across all subscribers, for monitoring.
    pub fn total_dropped(&self) -> u64 {
        let subs = self.inner.lock().expect("event bus subscriber lock poisoned");
        subs.iter().map(|s| s.queue.dropped.load(Ordering::Relaxed)).sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("test");
        bus.publish(CoreEvent::SessionCreated {
            session_id: "s1".into(),
            user_id: "u1".into(),
        });
        let envelope = rx.recv().await.expect("event delivered");
        assert!(matches!(envelope.event, CoreEvent::SessionCreated { .. }));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking_publisher() {
        let bus = EventBus::new(1);
        let _rx = bus.subscribe("slow");
        // First fills the one-slot queue, the rest must not block.
        for _ in 0..5 {
            bus.publish(CoreEvent::SessionExpired { session_id: "s1".into() });
        }
        assert!(bus.total_dropped() >= 4);
    }

    #[tokio::test]
    async fn overflow_evicts_the_oldest_entry_not_the_newest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe("watcher");
        bus.publish(CoreEvent::SessionDeleted { session_id: "first".into() });
        bus.publish(CoreEvent::SessionDeleted { session_id: "second".into() });
        bus.publish(CoreEvent::SessionDeleted { session_id: "third".into() });

        let first_received = rx.recv().await.unwrap();
        let second_received = rx.recv().await.unwrap();
        let ids: Vec<&str> = [&first_received, &second_received]
            .iter()
            .map(|e| match &e.event {
                CoreEvent::SessionDeleted { session_id } => session_id.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::new(4);
        let mut rx_a = bus.subscribe("a");
        let mut rx_b = bus.subscribe("b");
        bus.publish(CoreEvent::ContextClosed {
            context_id: "c1".into(),
            session_id: "s1".into(),
        });
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }
}
