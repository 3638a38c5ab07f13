//! Application-facing handles over pooled connections.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tidewire_core::{ConnectionErrorKind, Error, Result};
use tidewire_mysql::{
    ConnectionContext, PhysicalConnection, QueryResult, SharedConnection, Statement,
};

use crate::entry::{ConnectionMetadata, PoolEntry};

/// Why a handle stopped delegating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    /// The application closed the handle.
    Closed,
    /// A newer handle was issued for the same connection.
    Superseded,
    /// The physical connection failed.
    Failed,
}

impl Revocation {
    pub fn reason(self) -> &'static str {
        match self {
            Revocation::Closed => "logical connection is closed",
            Revocation::Superseded => "logical connection was superseded by a newer handle",
            Revocation::Failed => "physical connection failed",
        }
    }
}

/// A value that is either delegated to or revoked for good.
#[derive(Debug)]
pub enum Guarded<T> {
    Live(T),
    Revoked(Revocation),
}

impl<T> Guarded<T> {
    pub fn get(&self) -> Result<&T> {
        match self {
            Guarded::Live(value) => Ok(value),
            Guarded::Revoked(why) => Err(Error::LogicalHandleInvalid(why.reason().to_string())),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Guarded::Live(_))
    }

    pub fn revocation(&self) -> Option<Revocation> {
        match self {
            Guarded::Live(_) => None,
            Guarded::Revoked(why) => Some(*why),
        }
    }

    /// Revoke, returning the value if this call did the revoking.
    pub fn revoke(&mut self, why: Revocation) -> Option<T> {
        match std::mem::replace(self, Guarded::Revoked(why)) {
            Guarded::Live(value) => Some(value),
            Guarded::Revoked(earlier) => {
                *self = Guarded::Revoked(earlier);
                None
            }
        }
    }
}

pub(crate) struct HandleState {
    proxy: Mutex<Guarded<PoolEntry>>,
    metadata: ConnectionMetadata,
}

impl HandleState {
    pub(crate) fn new(entry: PoolEntry, metadata: ConnectionMetadata) -> Arc<Self> {
        Arc::new(Self {
            proxy: Mutex::new(Guarded::Live(entry)),
            metadata,
        })
    }

    pub(crate) fn supersede(&self) {
        self.proxy.lock().revoke(Revocation::Superseded);
    }

    fn entry(&self) -> Result<PoolEntry> {
        self.proxy.lock().get().cloned()
    }

    fn close(&self) {
        let taken = self.proxy.lock().revoke(Revocation::Closed);
        if let Some(entry) = taken {
            tracing::debug!(connection_id = self.metadata.connection_id, "logical connection closed");
            entry.release();
        }
    }

    fn fail(&self, error: &Error) {
        let taken = self.proxy.lock().revoke(Revocation::Failed);
        if let Some(entry) = taken {
            entry.fail(error);
        }
    }
}

impl Drop for HandleState {
    fn drop(&mut self) {
        if let Some(entry) = self.proxy.get_mut().revoke(Revocation::Closed) {
            tracing::debug!(
                connection_id = self.metadata.connection_id,
                "logical connection dropped without close"
            );
            entry.release();
        }
    }
}

/// A revocable handle on a pooled physical connection.
///
/// Clones share one handle: closing any clone closes them all. Once the
/// handle is closed, superseded or its connection failed, every operation
/// fails with [`Error::LogicalHandleInvalid`]; the connection metadata
/// stays readable.
#[derive(Clone)]
pub struct LogicalConnection {
    state: Arc<HandleState>,
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("connection_id", &self.state.metadata.connection_id)
            .field("host", &self.state.metadata.host)
            .field("revoked", &self.state.proxy.lock().revocation())
            .finish()
    }
}

impl LogicalConnection {
    pub(crate) fn from_state(state: Arc<HandleState>) -> Self {
        Self { state }
    }

    // ==================== Metadata ====================

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.state.metadata
    }

    pub fn connection_id(&self) -> u32 {
        self.state.metadata.connection_id
    }

    pub fn host(&self) -> &str {
        &self.state.metadata.host
    }

    pub fn port(&self) -> u16 {
        self.state.metadata.port
    }

    pub fn user(&self) -> &str {
        &self.state.metadata.user
    }

    pub fn database(&self) -> Option<&str> {
        self.state.metadata.database.as_deref()
    }

    pub fn server_version(&self) -> &str {
        &self.state.metadata.server_version
    }

    /// Is this handle no longer usable?
    pub fn is_closed(&self) -> bool {
        !self.state.proxy.lock().is_live()
    }

    /// Why the handle was revoked, if it was.
    pub fn revocation(&self) -> Option<Revocation> {
        self.state.proxy.lock().revocation()
    }

    // ==================== Statements ====================

    /// This handle as a statement context.
    pub fn context(&self) -> Arc<dyn ConnectionContext> {
        Arc::new(self.clone())
    }

    pub fn create_statement(&self, sql: &str) -> Result<Statement> {
        Statement::new(self.context(), sql)
    }

    /// Create a statement and prepare it right away.
    pub fn prepare_statement(&self, sql: &str) -> Result<Statement> {
        Statement::prepare(self.context(), sql)
    }

    /// Statements opened through this handle and not yet closed.
    pub fn active_statements(&self) -> Result<usize> {
        Ok(self.state.entry()?.active_statements())
    }

    // ==================== Session ====================

    fn with_physical<T>(&self, op: impl FnOnce(&mut PhysicalConnection) -> Result<T>) -> Result<T> {
        let conn = self.active_connection()?;
        let result = op(&mut conn.lock());
        match result {
            Ok(value) => {
                self.ensure_valid()?;
                Ok(value)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.state.fail(&e);
                }
                Err(e)
            }
        }
    }

    pub fn execute(&self, sql: &str) -> Result<u64> {
        self.with_physical(|c| c.execute(sql))
    }

    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        self.with_physical(|c| c.query(sql))
    }

    pub fn begin(&self) -> Result<()> {
        self.with_physical(PhysicalConnection::begin)
    }

    pub fn commit(&self) -> Result<()> {
        self.with_physical(PhysicalConnection::commit)
    }

    pub fn rollback(&self) -> Result<()> {
        self.with_physical(PhysicalConnection::rollback)
    }

    pub fn set_autocommit(&self, enabled: bool) -> Result<()> {
        self.with_physical(|c| c.set_autocommit(enabled))
    }

    pub fn ping(&self) -> Result<()> {
        self.with_physical(PhysicalConnection::ping)
    }

    /// Close the handle and return the connection to its pool.
    ///
    /// Rolls back an open transaction and closes server statements
    /// first. Closing an already closed or superseded handle does nothing.
    pub fn close(&self) -> Result<()> {
        self.state.close();
        Ok(())
    }
}

impl ConnectionContext for LogicalConnection {
    fn active_connection(&self) -> Result<SharedConnection> {
        let entry = self.state.entry()?;
        let conn = entry.physical().clone();
        let dead = conn.lock().is_dead();
        if dead {
            let err = Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is no longer usable",
            );
            self.state.fail(&err);
            return Err(err);
        }
        Ok(conn)
    }

    fn ensure_valid(&self) -> Result<()> {
        self.state.proxy.lock().get().map(|_| ())
    }

    fn statement_opened(&self) {
        if let Ok(entry) = self.state.entry() {
            entry.statement_opened();
        }
    }

    fn statement_closed(&self) {
        if let Ok(entry) = self.state.entry() {
            entry.statement_closed();
        }
    }

    fn connection_failed(&self, err: &Error) {
        self.state.fail(err);
    }
}
