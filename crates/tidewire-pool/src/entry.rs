//! One physical connection as the pool tracks it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tidewire_core::{Error, Result};
use tidewire_mysql::{PhysicalConnection, SharedConnection};

use crate::events::{ConnectionEvent, ConnectionEventListener, EventBroker, ListenerId};
use crate::logical::{HandleState, LogicalConnection};

/// Connection details that stay readable after a handle is invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub connection_id: u32,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: Option<String>,
    pub server_version: String,
}

impl ConnectionMetadata {
    fn of(conn: &PhysicalConnection) -> Self {
        let config = conn.config();
        Self {
            connection_id: conn.connection_id(),
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            database: config.database.clone(),
            server_version: conn.server_version().to_string(),
        }
    }
}

/// Where an entry goes when its logical handle is done with it.
pub(crate) trait EntryOwner: Send + Sync {
    /// The entry is clean and may be handed out again.
    fn recycle(&self, entry: PoolEntry);
    /// The entry was destroyed.
    fn discard(&self, entry: &PoolEntry);
}

pub(crate) struct EntryInner {
    physical: SharedConnection,
    connection_id: u32,
    current: Mutex<Option<Weak<HandleState>>>,
    listeners: EventBroker,
    pool_listeners: Option<EventBroker>,
    active_statements: AtomicUsize,
    created: Instant,
    released: Mutex<Instant>,
    destroyed: AtomicBool,
    owner: Option<Weak<dyn EntryOwner>>,
}

/// A physical connection, its current logical handle and its listeners.
///
/// At most one logical handle is valid at a time: asking for a new one
/// invalidates the previous handle without firing an event.
#[derive(Clone)]
pub struct PoolEntry {
    inner: Arc<EntryInner>,
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("connection_id", &self.inner.connection_id)
            .field("active_statements", &self.active_statements())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl PoolEntry {
    /// Entry for a connection that no pool owns.
    pub fn new(physical: SharedConnection) -> Self {
        Self::build(physical, None, None)
    }

    pub(crate) fn owned(
        physical: SharedConnection,
        pool_listeners: EventBroker,
        owner: Weak<dyn EntryOwner>,
    ) -> Self {
        Self::build(physical, Some(pool_listeners), Some(owner))
    }

    fn build(
        physical: SharedConnection,
        pool_listeners: Option<EventBroker>,
        owner: Option<Weak<dyn EntryOwner>>,
    ) -> Self {
        let connection_id = physical.lock().connection_id();
        let now = Instant::now();
        Self {
            inner: Arc::new(EntryInner {
                physical,
                connection_id,
                current: Mutex::new(None),
                listeners: EventBroker::new(),
                pool_listeners,
                active_statements: AtomicUsize::new(0),
                created: now,
                released: Mutex::new(now),
                destroyed: AtomicBool::new(false),
                owner,
            }),
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.inner.connection_id
    }

    /// Issue a new logical handle, invalidating the previous one.
    pub fn get_logical_connection(&self) -> Result<LogicalConnection> {
        if self.is_destroyed() {
            return Err(Error::LogicalHandleInvalid(
                "pooled connection was destroyed".to_string(),
            ));
        }
        let mut current = self.inner.current.lock();
        if let Some(previous) = current.take().and_then(|w| w.upgrade()) {
            previous.supersede();
            tracing::debug!(
                connection_id = self.inner.connection_id,
                "previous logical handle superseded"
            );
        }
        self.inner.active_statements.store(0, Ordering::Release);
        let metadata = ConnectionMetadata::of(&self.inner.physical.lock());
        let state = HandleState::new(self.clone(), metadata);
        *current = Some(Arc::downgrade(&state));
        Ok(LogicalConnection::from_state(state))
    }

    /// Register a listener on this entry only.
    pub fn add_listener(&self, listener: impl ConnectionEventListener + 'static) -> ListenerId {
        self.inner.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove_listener(id)
    }

    /// Statements opened through the current handle and not yet closed.
    pub fn active_statements(&self) -> usize {
        self.inner.active_statements.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> std::time::Duration {
        self.inner.created.elapsed()
    }

    /// Time since the entry was last returned.
    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.released.lock().elapsed()
    }

    pub(crate) fn physical(&self) -> &SharedConnection {
        &self.inner.physical
    }

    pub(crate) fn statement_opened(&self) {
        self.inner.active_statements.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn statement_closed(&self) {
        let _ = self
            .inner
            .active_statements
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn fire(&self, event: &ConnectionEvent) {
        self.inner.listeners.fire(event);
        if let Some(pool) = &self.inner.pool_listeners {
            pool.fire(event);
        }
    }

    /// Clean the connection after its handle was closed and hand it back.
    ///
    /// Fires the close event; a fatal failure during cleanup destroys the
    /// entry instead.
    pub(crate) fn release(&self) {
        self.inner.active_statements.store(0, Ordering::Release);
        let cleaned = {
            let mut conn = self.inner.physical.lock();
            if conn.is_dead() {
                Err(Error::connection(
                    tidewire_core::ConnectionErrorKind::Disconnected,
                    "connection is no longer usable",
                ))
            } else {
                reset(&mut conn)
            }
        };
        match cleaned {
            Ok(()) => {
                self.fire(&ConnectionEvent::Closed {
                    connection_id: self.inner.connection_id,
                });
                *self.inner.released.lock() = Instant::now();
                match self.owner() {
                    Some(owner) => owner.recycle(self.clone()),
                    None => tracing::debug!(connection_id = self.inner.connection_id, "entry idle"),
                }
            }
            Err(e) if e.is_fatal() => self.fail(&e),
            Err(e) => {
                // the session state is unknown; do not hand it out again
                tracing::warn!(error = %e, "cleanup of released connection failed");
                self.fire(&ConnectionEvent::Closed {
                    connection_id: self.inner.connection_id,
                });
                self.destroy();
            }
        }
    }

    /// Report a fatal error once and remove the entry.
    pub(crate) fn fail(&self, error: &Error) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(
            connection_id = self.inner.connection_id,
            error = %error,
            "pooled connection failed"
        );
        self.inner.physical.lock().mark_dead();
        self.fire(&ConnectionEvent::error(self.inner.connection_id, error));
        if let Some(owner) = self.owner() {
            owner.discard(self);
        }
    }

    /// Close the physical connection and forget the entry.
    pub(crate) fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.physical.lock().close();
        if let Some(previous) = self.inner.current.lock().take().and_then(|w| w.upgrade()) {
            previous.supersede();
        }
        if let Some(owner) = self.owner() {
            owner.discard(self);
        }
    }

    fn owner(&self) -> Option<Arc<dyn EntryOwner>> {
        self.inner.owner.as_ref().and_then(Weak::upgrade)
    }
}

/// Return a session to a clean state: no pending stream, no open
/// transaction, no server statements.
fn reset(conn: &mut PhysicalConnection) -> Result<()> {
    conn.discard_active_stream()?;
    if conn.in_transaction() {
        tracing::debug!(connection_id = conn.connection_id(), "rolling back on release");
        conn.rollback()?;
    }
    conn.close_all_statements()
}
