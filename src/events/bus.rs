//! Subscriber bus with copy-on-write dispatch
//!
//! Subscribers register a handler against an event-kind filter and an
//! optional selector. Delivery is synchronous from the publisher's
//! perspective; a slow handler back-pressures the publisher only for the
//! duration of its call. A panicking handler is isolated and reported as an
//! `InternalError` event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::{Event, EventKind};

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Narrows a subscription beyond its event kinds.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    /// Only events originating from this adapter.
    pub adapter: Option<String>,
    /// Only events whose (masked) command line starts with this prefix.
    pub command_prefix: Option<String>,
}

impl Selector {
    fn matches(&self, event: &Event) -> bool {
        if let Some(adapter) = &self.adapter {
            if event.adapter() != Some(adapter.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.command_prefix {
            match event.command() {
                Some(command) if command.starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }
        true
    }
}

struct Subscriber {
    id: u64,
    /// `None` subscribes to every kind.
    kinds: Option<Vec<EventKind>>,
    selector: Selector,
    handler: Handler,
}

impl Subscriber {
    fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        self.selector.matches(event)
    }
}

struct Inner {
    subscribers: RwLock<Arc<Vec<Arc<Subscriber>>>>,
    next_id: AtomicU64,
}

/// Process-wide event bus.
///
/// Cloning shares the subscriber list; adapters hold a clone as their narrow
/// emit seam.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to the given event kinds (all kinds when `kinds` is `None`).
    ///
    /// The returned [`Subscription`] unsubscribes when cancelled or dropped.
    pub fn subscribe(
        &self,
        kinds: Option<Vec<EventKind>>,
        selector: Selector,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            kinds,
            selector,
            handler: Arc::new(handler),
        });

        let mut guard = self.inner.subscribers.write();
        let mut next = (**guard).clone();
        next.push(subscriber);
        *guard = Arc::new(next);

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish an event to all matching subscribers.
    ///
    /// Dispatch snapshots the subscriber list first, so no lock is held while
    /// handlers run.
    pub fn emit(&self, event: Event) {
        let snapshot = self.inner.subscribers.read().clone();

        let mut failed = 0_usize;
        for subscriber in snapshot.iter() {
            if !subscriber.matches(&event) {
                continue;
            }
            let handler = subscriber.handler.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                failed += 1;
            }
        }

        // Handler failures must not affect command execution; report them as
        // their own events, but never recurse off a failing InternalError
        // handler.
        if failed > 0 && !matches!(event, Event::InternalError { .. }) {
            warn!("{} event handler(s) panicked while handling {:?}", failed, event.kind());
            self.emit(Event::InternalError {
                message: format!("{} subscriber handler(s) panicked", failed),
            });
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    fn remove(inner: &Inner, id: u64) {
        let mut guard = inner.subscribers.write();
        let next: Vec<Arc<Subscriber>> = guard
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle to an active subscription. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    bus: std::sync::Weak<Inner>,
}

impl Subscription {
    /// Explicitly unsubscribe.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus::remove(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamKind;
    use parking_lot::Mutex;

    fn collect(bus: &EventBus, kinds: Option<Vec<EventKind>>) -> (Arc<Mutex<Vec<EventKind>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sub = bus.subscribe(kinds, Selector::default(), move |event| {
            seen_clone.lock().push(event.kind());
        });
        (seen, sub)
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = EventBus::new();
        let (seen, _sub) = collect(&bus, None);

        bus.emit(Event::CommandStart {
            id: 1,
            command: "echo hi".into(),
            adapter: "local",
        });

        assert_eq!(seen.lock().as_slice(), &[EventKind::CommandStart]);
    }

    #[test]
    fn test_kind_filter() {
        let bus = EventBus::new();
        let (seen, _sub) = collect(&bus, Some(vec![EventKind::CommandComplete]));

        bus.emit(Event::CommandStart {
            id: 1,
            command: "true".into(),
            adapter: "local",
        });
        bus.emit(Event::CommandComplete {
            id: 1,
            command: "true".into(),
            adapter: "local",
            exit_code: 0,
            duration_ms: 3,
        });

        assert_eq!(seen.lock().as_slice(), &[EventKind::CommandComplete]);
    }

    #[test]
    fn test_adapter_selector() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0_usize));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(
            None,
            Selector {
                adapter: Some("ssh".into()),
                command_prefix: None,
            },
            move |_| *seen_clone.lock() += 1,
        );

        bus.emit(Event::CommandStart {
            id: 1,
            command: "ls".into(),
            adapter: "local",
        });
        bus.emit(Event::CommandStart {
            id: 2,
            command: "ls".into(),
            adapter: "ssh",
        });

        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_command_prefix_selector() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0_usize));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(
            None,
            Selector {
                adapter: None,
                command_prefix: Some("git ".into()),
            },
            move |_| *seen_clone.lock() += 1,
        );

        bus.emit(Event::CommandStart {
            id: 1,
            command: "git status".into(),
            adapter: "local",
        });
        bus.emit(Event::CommandStart {
            id: 2,
            command: "ls -la".into(),
            adapter: "local",
        });
        // Output events carry no command line; the prefix selector drops them.
        bus.emit(Event::CommandOutput {
            id: 1,
            stream: StreamKind::Stdout,
            chunk: b"x".to_vec(),
        });

        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let bus = EventBus::new();
        let (seen, sub) = collect(&bus, None);

        bus.emit(Event::InternalError { message: "a".into() });
        drop(sub);
        bus.emit(Event::InternalError { message: "b".into() });

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let _panicker = bus.subscribe(
            Some(vec![EventKind::CommandStart]),
            Selector::default(),
            |_| panic!("handler bug"),
        );
        let (seen, _sub) = collect(&bus, None);

        bus.emit(Event::CommandStart {
            id: 1,
            command: "true".into(),
            adapter: "local",
        });

        // The healthy subscriber saw the original event and the follow-up
        // internal error.
        let kinds = seen.lock().clone();
        assert_eq!(
            kinds,
            vec![EventKind::CommandStart, EventKind::InternalError]
        );
    }

    #[test]
    fn test_custom_kind_filter() {
        let bus = EventBus::new();
        let (seen, _sub) = collect(&bus, Some(vec![EventKind::Custom("deploy".into())]));

        bus.emit(Event::Custom {
            kind: "deploy".into(),
            payload: serde_json::json!({"step": 1}),
        });
        bus.emit(Event::Custom {
            kind: "other".into(),
            payload: serde_json::Value::Null,
        });

        assert_eq!(seen.lock().len(), 1);
    }
}
