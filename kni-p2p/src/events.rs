//! Peer lifecycle events.
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: when a
//! queue is full its oldest event is discarded and the subscriber's dropped
//! counter goes up. A slow subscriber therefore only loses its own events.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::Stream;
use tokio::sync::Notify;

use crate::peer::PeerInfo;
use crate::protocol::DisconnectReason;

/// What happened to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    /// The peer became active.
    Added,
    /// The peer's session ended.
    Dropped,
}

impl fmt::Display for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEventKind::Added => write!(f, "add"),
            PeerEventKind::Dropped => write!(f, "drop"),
        }
    }
}

/// A peer lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// Kind of event.
    pub kind: PeerEventKind,
    /// The peer as it was when the event fired.
    pub peer: PeerInfo,
    /// Why the peer was dropped. `None` for `Added`.
    pub cause: Option<DisconnectReason>,
}

impl PeerEvent {
    /// Peer became active.
    pub fn added(peer: PeerInfo) -> Self {
        Self {
            kind: PeerEventKind::Added,
            peer,
            cause: None,
        }
    }

    /// Peer was dropped for `cause`.
    pub fn dropped(peer: PeerInfo, cause: DisconnectReason) -> Self {
        Self {
            kind: PeerEventKind::Dropped,
            peer,
            cause: Some(cause),
        }
    }
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.peer.descriptor)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

/// Identifies one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct SubscriberQueue {
    events: Mutex<VecDeque<PeerEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<PeerEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, event: PeerEvent) {
        {
            let mut events = self.events();
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct BusInner {
    subscribers: Mutex<HashMap<SubscriptionId, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Arc<SubscriberQueue>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fan-out channel for peer events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber.
    ///
    /// Subscribing to a closed bus yields a subscription that is already
    /// closed.
    pub fn subscribe(&self) -> EventSubscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SubscriberQueue::new(self.inner.capacity));

        {
            let mut subscribers = self.inner.subscribers();
            if self.inner.closed.load(Ordering::Acquire) {
                queue.close();
            } else {
                subscribers.insert(id, queue.clone());
            }
        }

        EventSubscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Later publishes skip it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.inner.subscribers().remove(&id) {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every subscriber without blocking.
    pub fn publish(&self, event: PeerEvent) {
        let subscribers = self.inner.subscribers();
        tracing::trace!(event = %event, subscribers = subscribers.len(), "Publishing peer event");
        for queue in subscribers.values() {
            queue.push(event.clone());
        }
    }

    /// Close the bus and wake every waiting subscriber.
    ///
    /// Queued events can still be drained; `recv` returns `None` afterwards.
    pub fn close(&self) {
        let mut subscribers = self.inner.subscribers();
        self.inner.closed.store(true, Ordering::Release);
        for (_, queue) in subscribers.drain() {
            queue.close();
        }
    }

    /// Check if the bus was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving end of one subscription.
///
/// Dropping it unsubscribes.
pub struct EventSubscription {
    id: SubscriptionId,
    queue: Arc<SubscriberQueue>,
    bus: std::sync::Weak<BusInner>,
}

impl EventSubscription {
    /// This subscription's id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                // An event may have landed between the pop and the check.
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.queue.events().pop_front()
    }

    /// Number of events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.queue.events().len()
    }

    /// Check if no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Turn the subscription into a stream that ends when the bus closes.
    pub fn into_stream(self) -> impl Stream<Item = PeerEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers().remove(&self.id);
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .field("queued", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
