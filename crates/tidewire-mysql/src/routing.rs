//! Resolving the physical connection an operation runs on.
//!
//! Statements, result sets and LOB locators never cache a physical
//! connection. They ask a [`ConnectionContext`] each time, so a revoked
//! logical handle or a replica switch takes effect on the next operation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tidewire_core::{ConnectionErrorKind, Error, Result};

use crate::connection::SharedConnection;

/// Source of physical connections for statements and locators.
pub trait ConnectionContext: Send + Sync + fmt::Debug {
    /// Connection for statements and reads: the currently selected member.
    fn active_connection(&self) -> Result<SharedConnection>;

    /// Connection for writes. Defaults to the active connection.
    fn source_connection(&self) -> Result<SharedConnection> {
        self.active_connection()
    }

    /// Cheap check that the context may still be used, without touching
    /// the physical connection.
    fn ensure_valid(&self) -> Result<()> {
        Ok(())
    }

    /// A statement was created on this context.
    fn statement_opened(&self) {}

    /// A statement created on this context was closed.
    fn statement_closed(&self) {}

    /// An operation routed through this context hit a fatal error. Called
    /// after the physical connection lock is released.
    fn connection_failed(&self, _err: &Error) {}
}

/// Pass `result` through, telling `context` about fatal errors.
pub(crate) fn report<T>(context: &dyn ConnectionContext, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_fatal() {
            context.connection_failed(e);
        }
    }
    result
}

impl ConnectionContext for SharedConnection {
    fn active_connection(&self) -> Result<SharedConnection> {
        if self.lock().is_dead() {
            return Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is no longer usable",
            ));
        }
        Ok(self.clone())
    }
}

const SOURCE: usize = usize::MAX;

/// Source/replica topology.
///
/// Writes always go to the source; reads go to whichever member is
/// currently selected.
#[derive(Debug)]
pub struct ReplicationRouter {
    source: SharedConnection,
    replicas: Vec<SharedConnection>,
    current: AtomicUsize,
}

impl ReplicationRouter {
    pub fn new(source: SharedConnection, replicas: Vec<SharedConnection>) -> Self {
        Self {
            source,
            replicas,
            current: AtomicUsize::new(SOURCE),
        }
    }

    /// Route reads to the source.
    pub fn use_source(&self) {
        self.current.store(SOURCE, Ordering::Release);
    }

    /// Route reads to replica `index`.
    pub fn use_replica(&self, index: usize) -> Result<()> {
        if index >= self.replicas.len() {
            return Err(Error::InvalidArgument(format!(
                "replica {index} does not exist ({} configured)",
                self.replicas.len()
            )));
        }
        tracing::debug!(replica = index, "reads routed to replica");
        self.current.store(index, Ordering::Release);
        Ok(())
    }

    /// Is the source the selected member?
    pub fn on_source(&self) -> bool {
        self.current.load(Ordering::Acquire) == SOURCE
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

impl ConnectionContext for ReplicationRouter {
    fn active_connection(&self) -> Result<SharedConnection> {
        match self.current.load(Ordering::Acquire) {
            SOURCE => self.source.active_connection(),
            i => self
                .replicas
                .get(i)
                .ok_or_else(|| Error::InvalidArgument(format!("replica {i} does not exist")))?
                .active_connection(),
        }
    }

    fn source_connection(&self) -> Result<SharedConnection> {
        self.source.active_connection()
    }
}
