//! Typed listener registry used by servers, channels and sub-channels.
//!
//! Each component owns a `Listeners<E>` for its own event enum
//! (`ServerEvent`, `ChannelEvent`, `MuxEvent`, `SubChannelEvent`). Listeners
//! are invoked synchronously, in registration order, on whichever task emits
//! the event. Every listener sees every variant, so a plain listener is also
//! the "any" listener: it matches on the variants it cares about.
//!
//! # Usage
//!
//! ```rust
//! use sockmux::events::Listeners;
//!
//! #[derive(Clone, Debug)]
//! enum Event { Ping, Closed }
//!
//! let listeners = Listeners::<Event>::new();
//! listeners.on(|event| log::debug!("saw {event:?}"));
//! listeners.once(|event| log::debug!("first event only: {event:?}"));
//! assert_eq!(listeners.emit(&Event::Ping), 2);
//! assert_eq!(listeners.emit(&Event::Closed), 1);
//! ```
//!
//! The registry lock is only held to snapshot the listener list, never while
//! a callback runs, so callbacks may register or remove listeners (including
//! themselves) and may emit further events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Unique identifier for a registered listener.
pub type ListenerId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    id: ListenerId,
    once: bool,
    callback: Callback<E>,
}

/// Registry of typed event listeners.
pub struct Listeners<E> {
    entries: Mutex<Vec<Entry<E>>>,
    next_id: AtomicU64,
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish_non_exhaustive()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E> Listeners<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener invoked for every emitted event.
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(false, Arc::new(callback))
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(true, Arc::new(callback))
    }

    /// Remove a listener. Returns `false` if the id was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().expect("listener registry mutex poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("listener registry mutex poisoned")
            .clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("listener registry mutex poisoned")
            .len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke all listeners with `event`, in registration order.
    ///
    /// One-shot listeners are removed before any callback runs, so they fire
    /// at most once even when `emit` is re-entered from a callback.
    /// Returns the number of callbacks invoked.
    pub fn emit(&self, event: &E) -> usize {
        let callbacks: Vec<Callback<E>> = {
            let mut entries = self.entries.lock().expect("listener registry mutex poisoned");
            let snapshot = entries.iter().map(|entry| Arc::clone(&entry.callback)).collect();
            entries.retain(|entry| !entry.once);
            snapshot
        };

        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    fn insert(&self, once: bool, callback: Callback<E>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("listener registry mutex poisoned")
            .push(Entry { id, once, callback });
        id
    }
}

impl<E> Listeners<E>
where
    E: Clone + Send + 'static,
{
    /// Forward every event into an unbounded channel.
    ///
    /// Convenient for async consumers that prefer `rx.recv().await` over
    /// callbacks. Events emitted after the receiver is dropped are discarded.
    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on(move |event: &E| {
            if !tx.is_closed() {
                let _ = tx.send(event.clone());
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        A,
        B(u32),
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        let listeners = Listeners::<TestEvent>::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            listeners.on(move |_| seen.lock().unwrap().push(tag));
        }

        assert_eq!(listeners.emit(&TestEvent::A), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let listeners = Listeners::<TestEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        listeners.once(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&TestEvent::A);
        listeners.emit(&TestEvent::B(1));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_once_not_refired_by_reentrant_emit() {
        let listeners = Arc::new(Listeners::<TestEvent>::new());
        let count = Arc::new(AtomicU64::new(0));

        let inner = Arc::clone(&listeners);
        let count_clone = Arc::clone(&count);
        listeners.once(move |event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            if *event == TestEvent::A {
                inner.emit(&TestEvent::B(2));
            }
        });

        listeners.emit(&TestEvent::A);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_listener() {
        let listeners = Listeners::<TestEvent>::new();
        let id = listeners.on(|_| {});
        assert!(listeners.off(id));
        assert!(!listeners.off(id));
        assert_eq!(listeners.emit(&TestEvent::A), 0);
    }

    #[test]
    fn test_callback_may_register_listener_during_emit() {
        let listeners = Arc::new(Listeners::<TestEvent>::new());
        let inner = Arc::clone(&listeners);
        listeners.once(move |_| {
            inner.on(|_| {});
        });

        assert_eq!(listeners.emit(&TestEvent::A), 1);
        assert_eq!(listeners.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_events() {
        let listeners = Listeners::<TestEvent>::new();
        let mut rx = listeners.subscribe();

        listeners.emit(&TestEvent::B(7));
        listeners.emit(&TestEvent::A);

        assert_eq!(rx.recv().await, Some(TestEvent::B(7)));
        assert_eq!(rx.recv().await, Some(TestEvent::A));
    }
}
