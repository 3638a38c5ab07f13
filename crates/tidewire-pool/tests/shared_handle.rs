use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tidewire_core::{Error, Value};
use tidewire_mysql::testing::{MockColumn, MockServer, Reply};
use tidewire_mysql::types::FieldType;
use tidewire_pool::{LogicalConnection, Pool, PoolConfig};

const ROWS: i64 = 3;

fn server() -> MockServer {
    MockServer::with_handler(|sql| {
        if sql.starts_with("SELECT n FROM numbers") {
            Reply::rows(
                vec![MockColumn::new("n", FieldType::LongLong)],
                (1..=ROWS).map(|n| vec![Value::BigInt(n)]).collect(),
            )
        } else {
            Reply::affected(1)
        }
    })
    .unwrap()
}

#[derive(Debug, Default)]
struct Tally {
    queries: usize,
    updates: usize,
    conflicts: usize,
}

/// Alternate queries and updates on `conn` until `deadline`.
fn hammer(conn: &LogicalConnection, deadline: Instant) -> Tally {
    let mut tally = Tally::default();
    while Instant::now() < deadline {
        let mut stmt = conn.create_statement("SELECT n FROM numbers").unwrap();
        match stmt.execute_query() {
            Ok(mut rs) => {
                let mut seen = Vec::new();
                while rs.next().unwrap() {
                    seen.push(rs.get_i64("n").unwrap().unwrap());
                }
                assert_eq!(seen, (1..=ROWS).collect::<Vec<_>>());
                tally.queries += 1;
            }
            Err(Error::StreamingConflict) => tally.conflicts += 1,
            Err(e) => panic!("query failed: {e}"),
        }
        drop(stmt);

        let mut update = conn.create_statement("UPDATE counters SET n = n + 1").unwrap();
        match update.execute_update() {
            Ok(affected) => {
                assert_eq!(affected, 1);
                tally.updates += 1;
            }
            Err(Error::StreamingConflict) => tally.conflicts += 1,
            Err(e) => panic!("update failed: {e}"),
        }
    }
    tally
}

fn run_shared(streaming: bool) {
    let server = server();
    let pool = Pool::new(
        server.config().streaming_results(streaming),
        PoolConfig::new(1).min_connections(0).test_on_checkout(false),
    )
    .unwrap();
    let conn = pool.acquire().unwrap();
    let held = conn.create_statement("SELECT n FROM numbers").unwrap();
    assert_eq!(conn.active_statements().unwrap(), 1);

    let deadline = Instant::now() + Duration::from_millis(500);
    let (done, finished) = mpsc::channel();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let conn = conn.clone();
            let done = done.clone();
            thread::spawn(move || {
                let tally = hammer(&conn, deadline);
                done.send(()).unwrap();
                tally
            })
        })
        .collect();

    for _ in 0..2 {
        finished
            .recv_timeout(Duration::from_secs(10))
            .expect("worker did not finish: connection deadlocked");
    }
    let tallies: Vec<Tally> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(tallies.iter().map(|t| t.queries).sum::<usize>() > 0);
    assert!(tallies.iter().map(|t| t.updates).sum::<usize>() > 0);
    if !streaming {
        assert!(tallies.iter().all(|t| t.conflicts == 0));
    }

    // every statement the workers opened was closed again
    assert!(!conn.is_closed());
    assert_eq!(conn.active_statements().unwrap(), 1);
    drop(held);
    assert_eq!(conn.active_statements().unwrap(), 0);
    conn.execute("UPDATE counters SET n = 0").unwrap();
    assert_eq!(pool.stats().total_connections, 1);
}

#[test]
fn two_threads_share_one_handle_with_buffered_results() {
    run_shared(false);
}

#[test]
fn two_threads_share_one_handle_with_streaming_results() {
    run_shared(true);
}
