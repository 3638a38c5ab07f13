//! Connection events and the broker that delivers them.
//!
//! Listeners hear about two things only: a logical handle was closed by
//! the application, or the physical connection behind it failed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tidewire_core::{Error, ErrorKind};

/// Something that happened to a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The application closed its logical handle.
    Closed { connection_id: u32 },
    /// The physical connection failed and was removed from the pool.
    ErrorOccurred {
        connection_id: u32,
        kind: ErrorKind,
        message: String,
    },
}

impl ConnectionEvent {
    pub(crate) fn error(connection_id: u32, error: &Error) -> Self {
        ConnectionEvent::ErrorOccurred {
            connection_id,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn connection_id(&self) -> u32 {
        match self {
            ConnectionEvent::Closed { connection_id }
            | ConnectionEvent::ErrorOccurred { connection_id, .. } => *connection_id,
        }
    }
}

/// Receives [`ConnectionEvent`]s.
///
/// Listeners are called on the thread that closed the handle or hit the
/// error, after the broker's own lock has been released.
pub trait ConnectionEventListener: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionEventListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event);
    }
}

/// Handle returned by [`EventBroker::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A shared, ordered set of listeners. Clones share the same set.
#[derive(Clone, Default)]
pub struct EventBroker {
    listeners: Arc<Mutex<Vec<(ListenerId, Arc<dyn ConnectionEventListener>)>>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBroker")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: impl ConnectionEventListener + 'static) -> ListenerId {
        self.add_shared(Arc::new(listener))
    }

    pub fn add_shared(&self, listener: Arc<dyn ConnectionEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener in registration order.
    pub fn fire(&self, event: &ConnectionEvent) {
        let snapshot: Vec<Arc<dyn ConnectionEventListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        tracing::trace!(?event, listeners = snapshot.len(), "firing connection event");
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}
