use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tidewire_core::{Error, ErrorKind, PoolErrorKind, Value};
use tidewire_mysql::testing::{Logged, MockColumn, MockServer, Reply};
use tidewire_mysql::types::FieldType;
use tidewire_pool::{ConnectionEvent, Pool, PoolConfig, PoolEntry, PoolStats, Revocation};

fn handler(sql: &str) -> Reply {
    match sql {
        "SELECT 1" => Reply::scalar("1", FieldType::LongLong, Value::BigInt(1)),
        "DO SLEEP(-1)" => Reply::Hangup,
        _ => Reply::ok(),
    }
}

fn server() -> MockServer {
    MockServer::with_handler(handler).unwrap()
}

fn recorder() -> (
    Arc<Mutex<Vec<ConnectionEvent>>>,
    impl Fn(&ConnectionEvent) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |e: &ConnectionEvent| sink.lock().push(e.clone()))
}

fn handshakes(server: &MockServer) -> usize {
    server
        .log()
        .iter()
        .filter(|l| matches!(l, Logged::Handshake { .. }))
        .count()
}

fn quiet_pool(server: &MockServer, max: usize) -> Pool {
    let config = PoolConfig::new(max).min_connections(0).test_on_checkout(false);
    Pool::new(server.config(), config).unwrap()
}

#[test]
fn new_handle_invalidates_the_previous_one_silently() {
    let server = server();
    let entry = PoolEntry::new(server.connect().unwrap());
    let (seen, listener) = recorder();
    entry.add_listener(listener);

    let first = entry.get_logical_connection().unwrap();
    first.execute("SELECT 1").unwrap();
    let second = entry.get_logical_connection().unwrap();

    assert!(first.is_closed());
    assert_eq!(first.revocation(), Some(Revocation::Superseded));
    let err = first.execute("SELECT 1").unwrap_err();
    assert!(matches!(err, Error::LogicalHandleInvalid(_)));
    assert_eq!(err.kind(), ErrorKind::LogicalHandleInvalid);
    assert!(matches!(first.create_statement("SELECT 1"), Err(Error::LogicalHandleInvalid(_))));

    // metadata survives invalidation
    assert_eq!(first.user(), "tidewire");
    assert_eq!(first.host(), "127.0.0.1");
    assert_eq!(first.port(), server.port());
    assert_eq!(first.connection_id(), second.connection_id());

    // closing the stale handle does nothing
    first.close().unwrap();
    assert!(seen.lock().is_empty());
    second.execute("SELECT 1").unwrap();
}

#[test]
fn close_fires_one_event_and_cleans_the_session() {
    let server = server();
    let pool = Pool::new(
        server.config().use_server_prepared_statements(true),
        PoolConfig::new(2).min_connections(0).test_on_checkout(false),
    )
    .unwrap();
    let (seen, listener) = recorder();
    pool.add_listener(listener);

    let conn = pool.acquire().unwrap();
    let id = conn.connection_id();
    conn.begin().unwrap();
    let mut stmt = conn.prepare_statement("UPDATE jobs SET done = 1 WHERE id = ?").unwrap();
    stmt.bind(0, 7).unwrap();
    stmt.execute_update().unwrap();
    let _other = conn.create_statement("SELECT 1").unwrap();
    assert_eq!(conn.active_statements().unwrap(), 2);
    server.clear_log();

    conn.close().unwrap();
    conn.close().unwrap();

    assert_eq!(*seen.lock(), vec![ConnectionEvent::Closed { connection_id: id }]);
    assert_eq!(conn.revocation(), Some(Revocation::Closed));
    let log = server.log();
    assert!(log.contains(&Logged::Query("ROLLBACK".to_string())));
    assert!(server.wait_for(|l| matches!(l, Logged::Close(_))));
    assert_eq!(
        pool.stats(),
        PoolStats {
            total_connections: 1,
            idle_connections: 1,
            active_connections: 0,
            pending_requests: 0,
        }
    );

    // statements of the closed handle are dead too
    let err = stmt.execute_update().unwrap_err();
    assert!(matches!(err, Error::LogicalHandleInvalid(_)));
    drop(stmt);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn close_without_transaction_skips_rollback() {
    let server = server();
    let pool = quiet_pool(&server, 1);
    let conn = pool.acquire().unwrap();
    conn.execute("SELECT 1").unwrap();
    server.clear_log();
    conn.close().unwrap();
    assert!(server.queries().is_empty());
}

#[test]
fn fatal_error_fires_one_error_event_and_no_close() {
    let server = server();
    let pool = quiet_pool(&server, 1);
    let (seen, listener) = recorder();
    pool.add_listener(listener);

    let conn = pool.acquire().unwrap();
    let id = conn.connection_id();
    let err = conn.execute("DO SLEEP(-1)").unwrap_err();
    assert!(err.is_fatal());

    assert_eq!(conn.revocation(), Some(Revocation::Failed));
    assert!(matches!(conn.execute("SELECT 1"), Err(Error::LogicalHandleInvalid(_))));
    conn.close().unwrap();
    drop(conn);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        seen[0],
        ConnectionEvent::ErrorOccurred { connection_id, kind: ErrorKind::Connection, .. } if connection_id == id
    ));
    assert_eq!(pool.stats().total_connections, 0);
}

#[test]
fn fatal_error_through_a_statement_is_reported_at_once() {
    let server = server();
    let pool = quiet_pool(&server, 1);
    let (seen, listener) = recorder();
    pool.add_listener(listener);

    let conn = pool.acquire().unwrap();
    let id = conn.connection_id();
    let mut stmt = conn.create_statement("DO SLEEP(-1)").unwrap();
    assert!(stmt.execute_update().unwrap_err().is_fatal());

    // reported before the handle is touched again
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            ConnectionEvent::ErrorOccurred { connection_id, kind: ErrorKind::Connection, .. } if connection_id == id
        ));
    }
    assert_eq!(conn.revocation(), Some(Revocation::Failed));
    assert_eq!(pool.stats().total_connections, 0);

    drop(stmt);
    conn.close().unwrap();
    assert_eq!(seen.lock().len(), 1);

    // the slot is free for a fresh connection
    let again = pool.acquire().unwrap();
    again.execute("SELECT 1").unwrap();
}

#[test]
fn fatal_error_while_iterating_rows_is_reported_at_once() {
    let server = MockServer::with_handler(|sql| match sql {
        "SELECT n FROM numbers" => Reply::rows_then_hangup(
            vec![MockColumn::new("n", FieldType::LongLong)],
            vec![vec![Value::BigInt(1)]],
        ),
        other => handler(other),
    })
    .unwrap();
    let pool = Pool::new(
        server.config().streaming_results(true),
        PoolConfig::new(1).min_connections(0).test_on_checkout(false),
    )
    .unwrap();
    let (seen, listener) = recorder();
    pool.add_listener(listener);

    let conn = pool.acquire().unwrap();
    let mut stmt = conn.create_statement("SELECT n FROM numbers").unwrap();
    let mut rs = stmt.execute_query().unwrap();
    assert!(rs.next().unwrap());
    assert!(rs.next().unwrap_err().is_fatal());

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(conn.revocation(), Some(Revocation::Failed));
    assert_eq!(pool.stats().total_connections, 0);
}

#[test]
fn released_connection_is_reused() {
    let server = server();
    let pool = Pool::new(server.config(), PoolConfig::new(1).min_connections(1)).unwrap();
    assert_eq!(handshakes(&server), 1);

    let first = pool.acquire().unwrap();
    let id = first.connection_id();
    first.close().unwrap();
    server.clear_log();

    let second = pool.acquire().unwrap();
    assert_eq!(second.connection_id(), id);
    assert_eq!(handshakes(&server), 0);
    // checkout test
    assert_eq!(server.log(), vec![Logged::Ping]);
    assert_eq!(second.active_statements().unwrap(), 0);
}

#[test]
fn dropped_handle_returns_its_connection() {
    let server = server();
    let pool = quiet_pool(&server, 1);
    let (seen, listener) = recorder();
    pool.add_listener(listener);

    drop(pool.acquire().unwrap());
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(pool.stats().idle_connections, 1);
}

#[test]
fn acquire_times_out_when_exhausted() {
    let server = server();
    let pool = Pool::new(
        server.config(),
        PoolConfig::new(1)
            .min_connections(0)
            .acquire_timeout(100)
            .test_on_checkout(false),
    )
    .unwrap();
    let _held = pool.acquire().unwrap();
    assert!(pool.at_capacity());

    let err = pool.acquire().unwrap_err();
    assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Timeout));
    assert_eq!(pool.stats().pending_requests, 0);
}

#[test]
fn waiter_gets_the_released_connection() {
    let server = server();
    let pool = Pool::new(
        server.config(),
        PoolConfig::new(1)
            .min_connections(0)
            .acquire_timeout(5_000)
            .test_on_checkout(false),
    )
    .unwrap();
    let held = pool.acquire().unwrap();
    let id = held.connection_id();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.acquire().map(|c| c.connection_id()))
    };
    thread::sleep(Duration::from_millis(100));
    held.close().unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), id);
    assert_eq!(handshakes(&server), 1);
}

#[test]
fn closed_pool_refuses_acquire() {
    let server = server();
    let pool = Pool::new(server.config(), PoolConfig::new(2).min_connections(1)).unwrap();
    let lent = pool.acquire().unwrap();
    pool.close();
    assert!(pool.is_closed());

    let err = pool.acquire().unwrap_err();
    assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Closed));

    // a lent connection is closed once its handle is returned
    lent.close().unwrap();
    assert_eq!(pool.stats().total_connections, 0);
    assert!(server.wait_for(|l| *l == Logged::Quit));
}

#[test]
fn removed_listener_hears_nothing() {
    let server = server();
    let pool = quiet_pool(&server, 1);
    let (seen, listener) = recorder();
    let id = pool.add_listener(listener);
    assert!(pool.remove_listener(id));

    pool.acquire().unwrap().close().unwrap();
    assert!(seen.lock().is_empty());
}

#[test]
fn entry_listener_and_statement_count() {
    let server = server();
    let entry = PoolEntry::new(server.connect().unwrap());
    let (seen, listener) = recorder();
    entry.add_listener(listener);

    let conn = entry.get_logical_connection().unwrap();
    let mut a = conn.create_statement("SELECT 1").unwrap();
    let _b = conn.create_statement("SELECT 1").unwrap();
    assert_eq!(entry.active_statements(), 2);
    a.close().unwrap();
    a.close().unwrap();
    assert_eq!(entry.active_statements(), 1);

    conn.close().unwrap();
    assert_eq!(entry.active_statements(), 0);
    assert_eq!(seen.lock().len(), 1);

    // the entry can issue a fresh handle after close
    let next = entry.get_logical_connection().unwrap();
    next.execute("SELECT 1").unwrap();
    assert!(!entry.is_destroyed());
}
