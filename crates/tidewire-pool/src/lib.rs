//! Connection pooling for tidewire.
//!
//! A [`Pool`] keeps physical MySQL connections and lends them out as
//! [`LogicalConnection`] handles. Closing a handle cleans the session
//! (pending stream, open transaction, server statements) and puts the
//! connection back; a fatal transport error removes it instead. Both
//! outcomes are reported to [`ConnectionEventListener`]s.
//!
//! ```rust,ignore
//! use tidewire_mysql::MySqlConfig;
//! use tidewire_pool::{Pool, PoolConfig};
//!
//! let pool = Pool::new(MySqlConfig::new().host("db").user("app"), PoolConfig::new(8))?;
//! let conn = pool.acquire()?;
//! let mut stmt = conn.prepare_statement("UPDATE jobs SET done = 1 WHERE id = ?")?;
//! stmt.bind(0, 42)?;
//! stmt.execute_update()?;
//! conn.close()?;
//! ```

pub mod entry;
pub mod events;
pub mod logical;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tidewire_core::{Error, PoolError, PoolErrorKind, Result};
use tidewire_mysql::{MySqlConfig, SharedConnection};

pub use entry::{ConnectionMetadata, PoolEntry};
pub use events::{ConnectionEvent, ConnectionEventListener, EventBroker, ListenerId};
pub use logical::{Guarded, LogicalConnection, Revocation};

use entry::EntryOwner;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Ping connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(pool_error(PoolErrorKind::Config, "max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<PoolEntry>,
    /// Open connections, idle or lent out, plus connects in progress
    total: usize,
    pending: usize,
}

struct PoolInner {
    config: PoolConfig,
    connect: MySqlConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
    listeners: EventBroker,
    closed: AtomicBool,
}

impl EntryOwner for PoolInner {
    fn recycle(&self, entry: PoolEntry) {
        if self.closed.load(Ordering::Acquire) {
            entry.destroy();
            return;
        }
        self.state.lock().idle.push_back(entry);
        self.returned.notify_one();
    }

    fn discard(&self, entry: &PoolEntry) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            state.idle.retain(|e| e.connection_id() != entry.connection_id());
        }
        tracing::debug!(connection_id = entry.connection_id(), "pooled connection discarded");
        self.returned.notify_one();
    }
}

/// What an acquire attempt decided while holding the state lock.
enum Step {
    Reuse(PoolEntry),
    Open,
}

/// A blocking pool of MySQL connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Create a pool and open `min_connections` connections.
    pub fn new(connect: MySqlConfig, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                connect,
                state: Mutex::new(PoolState::default()),
                returned: Condvar::new(),
                listeners: EventBroker::new(),
                closed: AtomicBool::new(false),
            }),
        };
        for _ in 0..pool.inner.config.min_connections {
            pool.inner.state.lock().total += 1;
            match pool.open() {
                Ok(entry) => pool.inner.state.lock().idle.push_back(entry),
                Err(e) => {
                    pool.inner.state.lock().total -= 1;
                    pool.close();
                    return Err(e);
                }
            }
        }
        tracing::debug!(
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "pool created"
        );
        Ok(pool)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            pending_requests: state.pending,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.inner.state.lock().total >= self.inner.config.max_connections
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a listener on every connection of this pool.
    pub fn add_listener(&self, listener: impl ConnectionEventListener + 'static) -> ListenerId {
        self.inner.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove_listener(id)
    }

    fn open(&self) -> Result<PoolEntry> {
        let physical = SharedConnection::connect(self.inner.connect.clone())?;
        let inner: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let owner: Weak<dyn EntryOwner> = inner;
        let entry = PoolEntry::owned(physical, self.inner.listeners.clone(), owner);
        tracing::debug!(connection_id = entry.connection_id(), "pooled connection opened");
        Ok(entry)
    }

    /// Should an idle entry be dropped rather than lent out?
    fn expired(&self, entry: &PoolEntry, total: usize) -> bool {
        let config = &self.inner.config;
        entry.age() > Duration::from_millis(config.max_lifetime_ms)
            || (total > config.min_connections
                && entry.idle_for() > Duration::from_millis(config.idle_timeout_ms))
    }

    /// Borrow a connection, waiting up to the acquire timeout.
    pub fn acquire(&self) -> Result<LogicalConnection> {
        let deadline =
            Instant::now() + Duration::from_millis(self.inner.config.acquire_timeout_ms);
        loop {
            let step = self.next_step(deadline)?;
            let entry = match step {
                Step::Reuse(entry) => {
                    if self.inner.config.test_on_checkout {
                        let alive = entry.physical().lock().ping();
                        if let Err(e) = alive {
                            tracing::debug!(error = %e, "idle connection failed checkout test");
                            entry.destroy();
                            continue;
                        }
                    }
                    entry
                }
                Step::Open => match self.open() {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.inner.state.lock().total -= 1;
                        self.inner.returned.notify_one();
                        return Err(e);
                    }
                },
            };
            return entry.get_logical_connection();
        }
    }

    /// Take an idle entry, reserve a slot for a new one, or wait.
    fn next_step(&self, deadline: Instant) -> Result<Step> {
        let mut state = self.inner.state.lock();
        loop {
            if self.is_closed() {
                return Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
            }
            while let Some(entry) = state.idle.pop_front() {
                if self.expired(&entry, state.total) {
                    // destroy() re-enters the state lock through discard()
                    drop(state);
                    tracing::debug!(connection_id = entry.connection_id(), "retiring idle connection");
                    entry.destroy();
                    state = self.inner.state.lock();
                    continue;
                }
                return Ok(Step::Reuse(entry));
            }
            if state.total < self.inner.config.max_connections {
                state.total += 1;
                return Ok(Step::Open);
            }
            state.pending += 1;
            let timed_out = self.inner.returned.wait_until(&mut state, deadline).timed_out();
            state.pending -= 1;
            if timed_out && state.idle.is_empty() && state.total >= self.inner.config.max_connections {
                return Err(pool_error(
                    PoolErrorKind::Timeout,
                    format!(
                        "no connection available within {}ms",
                        self.inner.config.acquire_timeout_ms
                    ),
                ));
            }
        }
    }

    /// Close idle connections and refuse further acquires. Connections
    /// still lent out are closed when their handles are.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle: Vec<PoolEntry> = self.inner.state.lock().idle.drain(..).collect();
        tracing::debug!(idle = idle.len(), "closing pool");
        for entry in idle {
            entry.destroy();
        }
        self.inner.returned.notify_all();
    }
}
