//! Lifecycle event bus.
//!
//! Platform, Device and CardSession each carry one of these. Subscribers
//! register a handler for one [`EventKind`] and get a [`Subscription`] back;
//! disposing it unregisters. Delivery is synchronous and in registration
//! order; a panicking handler is logged and suppressed, never unwound into
//! the emitter.
//!
//! Event payloads carry the emitter's handle and a short free-form detail
//! string. Nothing sensitive goes in here: APDU events in particular carry
//! lengths, not bytes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tracing::warn;

/// The closed set of lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlatformInitialized,
    PlatformReleased,
    DeviceAcquired,
    DeviceReleased,
    CardFound,
    CardLost,
    CardSessionStarted,
    CardSessionReset,
    WaitTimeout,
    ApduSent,
    ApduFailed,
}

/// Which object emitted an event. Devices and sessions are identified by the
/// device id they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitter {
    Platform,
    Device(String),
    Session(String),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub emitter: Emitter,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new<S: Into<String>>(kind: EventKind, emitter: Emitter, detail: S) -> Self {
        Self {
            kind,
            emitter,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

struct Entry {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

struct BusInner {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

/// A typed pub/sub bus. Cloning shares the subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().unwrap().push(Entry {
            id,
            kind,
            handler: Arc::new(handler),
        });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Delivers `event` to every matching subscriber, in registration order.
    pub fn emit(&self, event: Event) {
        // Snapshot outside the lock so handlers can (un)subscribe freely.
        let handlers: Vec<Handler> = self
            .inner
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == event.kind)
            .map(|e| Arc::clone(&e.handler))
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(kind = ?event.kind, "event handler panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Undoes one [`EventBus::on`] registration.
///
/// Dropping a subscription without calling [`Subscription::dispose`] leaves
/// the handler registered for the bus's lifetime.
#[must_use = "dispose() this to unregister the handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.entries.lock().unwrap().retain(|e| e.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(kind: EventKind) -> Event {
        Event::new(kind, Emitter::Platform, "")
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for i in 0..4 {
            let log = Arc::clone(&log);
            subs.push(bus.on(EventKind::CardFound, move |_| {
                log.lock().unwrap().push(i);
            }));
        }
        bus.emit(event(EventKind::CardFound));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        for sub in subs {
            sub.dispose();
        }
    }

    #[test]
    fn test_kind_filtering() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.on(EventKind::CardFound, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(event(EventKind::CardLost));
        bus.emit(event(EventKind::CardFound));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sub.dispose();
    }

    #[test]
    fn test_dispose_unregisters() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.on(EventKind::CardFound, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(event(EventKind::CardFound));
        sub.dispose();
        bus.emit(event(EventKind::CardFound));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_is_suppressed() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub1 = bus.on(EventKind::ApduSent, |_| panic!("boom"));
        let h = Arc::clone(&hits);
        let sub2 = bus.on(EventKind::ApduSent, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        // The panic must neither escape nor starve later subscribers.
        bus.emit(event(EventKind::ApduSent));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sub1.dispose();
        sub2.dispose();
    }

    #[test]
    fn test_handler_may_subscribe_from_callback() {
        let bus = EventBus::new();
        let inner = bus.clone();
        let sub = bus.on(EventKind::CardFound, move |_| {
            // Must not deadlock against the subscriber list lock.
            inner
                .on(EventKind::CardLost, |_| {})
                .dispose();
        });
        bus.emit(event(EventKind::CardFound));
        sub.dispose();
    }
}
