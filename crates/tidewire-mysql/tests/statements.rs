use std::io::Cursor;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use rust_decimal::Decimal;

use tidewire_core::{Error, Value};
use tidewire_mysql::testing::{Logged, MockColumn, MockOptions, MockServer, Reply};
use tidewire_mysql::types::FieldType;
use tidewire_mysql::{
    ConnectionContext, MySqlConfig, SharedConnection, Statement, StatementState, UpdateCount,
};

static AMOUNT_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((-?\d+(?:\.\d+)?),\s*(-?\d+(?:\.\d+)?)\)").unwrap()
});

/// Server holding an `amounts (a, b)` table of decimals.
fn amounts_server(options: MockOptions) -> MockServer {
    let table: Arc<Mutex<Vec<(Decimal, Decimal)>>> = Arc::default();
    MockServer::start(options, move |sql| {
        if sql.starts_with("INSERT INTO amounts") {
            let mut table = table.lock();
            let before = table.len();
            for caps in AMOUNT_ROW.captures_iter(sql) {
                table.push((caps[1].parse().unwrap(), caps[2].parse().unwrap()));
            }
            Reply::affected((table.len() - before) as u64)
        } else if sql.starts_with("SELECT a + b AS total FROM amounts") {
            let rows = table.lock().iter().map(|(a, b)| vec![Value::Decimal(a + b)]).collect();
            Reply::rows(
                vec![MockColumn::new("total", FieldType::NewDecimal).decimals(10)],
                rows,
            )
        } else {
            Reply::ok()
        }
    })
    .unwrap()
}

fn context(conn: SharedConnection) -> Arc<dyn ConnectionContext> {
    Arc::new(conn)
}

fn sum_decimals(server: &MockServer, config: MySqlConfig) -> Vec<String> {
    let ctx = context(server.connect_with(config).unwrap());
    let a: Decimal = "-723279.9710000000".parse().unwrap();
    let b: Decimal = "-964372.8000000000".parse().unwrap();

    let mut insert = Statement::new(Arc::clone(&ctx), "INSERT INTO amounts (a, b) VALUES (?, ?)")
        .unwrap();
    for _ in 0..10 {
        insert.bind(0, a).unwrap();
        insert.bind(1, b).unwrap();
        insert.add_batch().unwrap();
    }
    let counts = insert.execute_batch().unwrap();
    assert_eq!(counts.len(), 10);
    assert_eq!(insert.affected_rows(), 10);
    insert.close().unwrap();

    let mut select = Statement::new(ctx, "SELECT a + b AS total FROM amounts").unwrap();
    let mut rs = select.execute_query().unwrap();
    let mut totals = Vec::new();
    while rs.next().unwrap() {
        totals.push(rs.get_decimal("total").unwrap().unwrap().to_string());
    }
    totals
}

fn assert_sums(totals: &[String]) {
    assert_eq!(totals.len(), 10);
    for total in totals {
        assert_eq!(total, "-1687652.7710000000");
    }
}

#[test]
fn decimal_sum_client_side() {
    let server = amounts_server(MockOptions::default());
    assert_sums(&sum_decimals(&server, server.config()));
    assert_eq!(
        server
            .queries()
            .iter()
            .filter(|q| q.starts_with("INSERT"))
            .count(),
        10
    );
}

#[test]
fn decimal_sum_client_side_rewritten() {
    let server = amounts_server(MockOptions::default());
    assert_sums(&sum_decimals(&server, server.config().rewrite_batched_statements(true)));
    let inserts: Vec<String> = server
        .queries()
        .into_iter()
        .filter(|q| q.starts_with("INSERT"))
        .collect();
    assert_eq!(inserts.len(), 1);
    assert_eq!(AMOUNT_ROW.find_iter(&inserts[0]).count(), 10);
}

#[test]
fn decimal_sum_server_side() {
    let server = amounts_server(MockOptions::default());
    let config = server.config().use_server_prepared_statements(true);
    assert_sums(&sum_decimals(&server, config));
    let executes = server
        .log()
        .into_iter()
        .filter(|e| matches!(e, Logged::Execute { sql, .. } if sql.starts_with("INSERT")))
        .count();
    assert_eq!(executes, 10);
}

#[test]
fn decimal_sum_server_side_rewritten() {
    let server = amounts_server(MockOptions::default());
    let config = server
        .config()
        .use_server_prepared_statements(true)
        .rewrite_batched_statements(true);
    assert_sums(&sum_decimals(&server, config));
    let prepared: Vec<String> = server
        .log()
        .into_iter()
        .filter_map(|e| match e {
            Logged::Prepare(sql) if sql.starts_with("INSERT") => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(prepared.len(), 1);
    assert_eq!(prepared[0].matches('?').count(), 20);
}

#[test]
fn decimal_sum_with_cursor_fetch() {
    let server = amounts_server(MockOptions::default());
    let config = server
        .config()
        .use_server_prepared_statements(true)
        .use_cursor_fetch(true, 3);
    assert_sums(&sum_decimals(&server, config));

    let log = server.log();
    assert!(log.iter().any(|e| matches!(e, Logged::Execute { cursor: true, .. })));
    let fetches: Vec<u32> = log
        .iter()
        .filter_map(|e| match e {
            Logged::Fetch { rows, .. } => Some(*rows),
            _ => None,
        })
        .collect();
    assert!(fetches.len() >= 4);
    assert!(fetches.iter().all(|&rows| rows == 3));
}

// ==================== Packet limits ====================

static NOTE_ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\('[^']*'\)").unwrap());

fn notes_server() -> MockServer {
    MockServer::start(
        MockOptions {
            max_allowed_packet: 1024,
            ..MockOptions::default()
        },
        |sql| {
            if sql.starts_with("INSERT INTO notes") {
                Reply::affected(NOTE_ROW.find_iter(sql).count() as u64)
            } else {
                Reply::ok()
            }
        },
    )
    .unwrap()
}

fn oversized_insert_is_rejected(config: MySqlConfig, server: &MockServer) {
    let conn = server.connect_with(config).unwrap();
    let ctx = context(conn.clone());
    let mut stmt = Statement::new(ctx, "INSERT INTO notes (body) VALUES (?)").unwrap();

    stmt.bind(0, "x".repeat(2000)).unwrap();
    let err = stmt.execute_update().unwrap_err();
    assert!(matches!(err, Error::PacketTooBig { max: 1024, .. }));
    assert_eq!(stmt.state(), StatementState::Failed);
    assert!(!conn.lock().is_dead());

    stmt.bind(0, "short").unwrap();
    assert_eq!(stmt.execute_update().unwrap(), 1);
    assert_eq!(stmt.state(), StatementState::Executed);
}

#[test]
fn oversized_client_statement_leaves_connection_usable() {
    let server = notes_server();
    oversized_insert_is_rejected(server.config(), &server);
    assert!(server.queries().iter().all(|q| q.len() < 1024));
}

#[test]
fn oversized_server_statement_leaves_connection_usable() {
    let server = notes_server();
    oversized_insert_is_rejected(server.config().use_server_prepared_statements(true), &server);
}

#[test]
fn rewritten_batch_is_split_to_fit_packet_limit() {
    let server = notes_server();
    let ctx = context(server.connect_with(server.config().rewrite_batched_statements(true)).unwrap());
    let mut stmt = Statement::new(ctx, "INSERT INTO notes (body) VALUES (?)").unwrap();
    for i in 0..100 {
        stmt.bind(0, format!("note number {i:05}")).unwrap();
        stmt.add_batch().unwrap();
    }
    let counts = stmt.execute_batch().unwrap();
    assert_eq!(counts, vec![UpdateCount::SuccessNoInfo; 100]);
    assert_eq!(stmt.affected_rows(), 100);
    assert_eq!(stmt.batch_len(), 0);

    let inserts: Vec<String> = server
        .queries()
        .into_iter()
        .filter(|q| q.starts_with("INSERT"))
        .collect();
    assert!(inserts.len() > 1);
    for sql in &inserts {
        assert!(sql.len() < 1024, "{} bytes", sql.len());
    }
}

// ==================== Streams ====================

fn blob_server() -> MockServer {
    MockServer::with_handler(|_| Reply::affected(1)).unwrap()
}

fn executed_sql(server: &MockServer) -> Vec<String> {
    server
        .log()
        .into_iter()
        .filter_map(|e| match e {
            Logged::Query(sql) if sql.starts_with("INSERT") => Some(sql),
            Logged::Execute { sql, .. } => Some(sql),
            _ => None,
        })
        .collect()
}

fn long_data(server: &MockServer) -> Vec<usize> {
    server
        .log()
        .into_iter()
        .filter_map(|e| match e {
            Logged::LongData { bytes, .. } => Some(bytes),
            _ => None,
        })
        .collect()
}

#[test]
fn empty_stream_binds_empty_value_client_side() {
    let server = blob_server();
    let ctx = context(server.connect().unwrap());
    let mut stmt = Statement::new(ctx, "INSERT INTO files (data) VALUES (?)").unwrap();
    stmt.bind_binary_stream(0, std::io::empty(), None).unwrap();
    stmt.execute_update().unwrap();
    assert_eq!(executed_sql(&server), vec!["INSERT INTO files (data) VALUES (X'')"]);
}

#[test]
fn empty_stream_binds_empty_value_server_side() {
    let server = blob_server();
    let ctx = context(server.connect_with(server.config().use_server_prepared_statements(true)).unwrap());
    let mut stmt = Statement::new(ctx, "INSERT INTO files (data) VALUES (?)").unwrap();
    stmt.bind_binary_stream(0, std::io::empty(), None).unwrap();
    stmt.execute_update().unwrap();
    assert_eq!(executed_sql(&server), vec!["INSERT INTO files (data) VALUES (X'')"]);
    assert!(long_data(&server).is_empty());
}

#[test]
fn large_stream_is_sent_as_long_data_in_chunks() {
    let server = blob_server();
    let config = server
        .config()
        .use_server_prepared_statements(true)
        .blob_send_chunk_size(16);
    let ctx = context(server.connect_with(config).unwrap());
    let payload: Vec<u8> = (0u8..40).collect();
    let hex: String = payload.iter().map(|b| format!("{b:02X}")).collect();

    let mut stmt = Statement::new(ctx, "INSERT INTO files (data) VALUES (?)").unwrap();
    stmt.bind_binary_stream(0, Cursor::new(payload), None).unwrap();
    stmt.execute_update().unwrap();

    assert_eq!(long_data(&server), vec![16, 16, 8]);
    assert_eq!(
        executed_sql(&server),
        vec![format!("INSERT INTO files (data) VALUES (X'{hex}')")]
    );

    // the reader was consumed by the first execution
    let err = stmt.execute_update().unwrap_err();
    assert!(err.to_string().contains("index 0"));
}

#[test]
fn stream_length_limits_bytes_read() {
    let server = blob_server();
    let ctx = context(server.connect().unwrap());
    let mut stmt = Statement::new(ctx, "INSERT INTO files (data) VALUES (?)").unwrap();
    stmt.bind_binary_stream(0, Cursor::new(b"abcdef".to_vec()), Some(3)).unwrap();
    stmt.execute_update().unwrap();
    assert_eq!(executed_sql(&server), vec!["INSERT INTO files (data) VALUES (X'616263')"]);
}

#[test]
fn character_stream_is_bound_as_text() {
    let server = blob_server();
    let ctx = context(server.connect_with(server.config().use_server_prepared_statements(true)).unwrap());
    let mut stmt = Statement::new(ctx, "INSERT INTO docs (body) VALUES (?)").unwrap();
    stmt.bind_character_stream(0, Cursor::new("héllo".as_bytes().to_vec()), None)
        .unwrap();
    stmt.execute_update().unwrap();
    assert_eq!(executed_sql(&server), vec!["INSERT INTO docs (body) VALUES ('héllo')"]);
    assert!(long_data(&server).is_empty());
}

// ==================== Errors and lifecycle ====================

#[test]
fn unset_parameter_is_reported_by_index() {
    let server = blob_server();
    let ctx = context(server.connect().unwrap());
    let mut stmt = Statement::new(ctx, "INSERT INTO t (a, b) VALUES (?, ?)").unwrap();
    stmt.bind(1, 5).unwrap();
    let err = stmt.execute_update().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("index 0")));

    let err = stmt.bind(2, 1).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn failed_statement_can_run_again() {
    let fail = Arc::new(Mutex::new(true));
    let server = {
        let fail = Arc::clone(&fail);
        MockServer::with_handler(move |_| {
            if *fail.lock() {
                Reply::error(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'")
            } else {
                Reply::affected(1)
            }
        })
        .unwrap()
    };
    let ctx = context(server.connect_with(server.config().use_server_prepared_statements(true)).unwrap());
    let mut stmt = Statement::prepare(ctx, "INSERT INTO t (id) VALUES (?)").unwrap();
    assert_eq!(stmt.state(), StatementState::Prepared);

    stmt.bind(0, 1).unwrap();
    let err = stmt.execute_update().unwrap_err();
    assert!(matches!(err, Error::Query(ref q) if q.is_duplicate_key()));
    assert_eq!(stmt.state(), StatementState::Failed);

    *fail.lock() = false;
    assert_eq!(stmt.execute_update().unwrap(), 1);

    stmt.close().unwrap();
    stmt.close().unwrap();
    assert_eq!(stmt.state(), StatementState::Closed);
    assert!(stmt.bind(0, 2).is_err());
    assert!(server.wait_for(|e| matches!(e, Logged::Close(_))));
    assert_eq!(
        server.log().iter().filter(|e| matches!(e, Logged::Close(_))).count(),
        1
    );
}

#[test]
fn streaming_result_blocks_other_statements() {
    let server = MockServer::with_handler(|sql| {
        if sql.starts_with("SELECT") {
            Reply::rows(
                vec![MockColumn::new("id", FieldType::Long)],
                (1..=3).map(|i| vec![Value::Int(i)]).collect(),
            )
        } else {
            Reply::ok()
        }
    })
    .unwrap();
    let ctx = context(server.connect_with(server.config().streaming_results(true)).unwrap());

    let mut first = Statement::new(Arc::clone(&ctx), "SELECT id FROM items").unwrap();
    let mut second = Statement::new(Arc::clone(&ctx), "SELECT id FROM items").unwrap();

    let mut rs = first.execute_query().unwrap();
    assert!(rs.is_streaming());
    assert!(rs.next().unwrap());
    assert!(matches!(second.execute_query(), Err(Error::StreamingConflict)));

    let mut ids = vec![rs.get_i32("id").unwrap().unwrap()];
    while rs.next().unwrap() {
        ids.push(rs.get_i32(0).unwrap().unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3]);

    let mut rs = second.execute_query().unwrap();
    assert!(rs.next().unwrap());
    rs.close().unwrap();
    assert!(first.execute_query().unwrap().next().unwrap());
}

#[test]
fn statement_closed_during_a_stream_is_closed_on_the_server_afterwards() {
    let server = MockServer::with_handler(|sql| {
        if sql.starts_with("SELECT") {
            Reply::rows(
                vec![MockColumn::new("id", FieldType::Long)],
                (1..=2).map(|i| vec![Value::Int(i)]).collect(),
            )
        } else {
            Reply::affected(1)
        }
    })
    .unwrap();
    let conn = server
        .connect_with(
            server
                .config()
                .use_server_prepared_statements(true)
                .streaming_results(true),
        )
        .unwrap();
    let ctx = context(conn.clone());
    let closes = |server: &MockServer| {
        server.log().iter().filter(|e| matches!(e, Logged::Close(_))).count()
    };

    let mut update = Statement::new(Arc::clone(&ctx), "UPDATE jobs SET done = 1 WHERE id = ?").unwrap();
    update.bind(0, 7).unwrap();
    assert_eq!(update.execute_update().unwrap(), 1);
    let mut select = Statement::new(Arc::clone(&ctx), "SELECT id FROM jobs").unwrap();
    let mut rs = select.execute_query().unwrap();
    assert!(rs.next().unwrap());
    assert_eq!(conn.lock().open_statements().len(), 2);

    update.close().unwrap();
    assert_eq!(update.state(), StatementState::Closed);
    assert_eq!(conn.lock().open_statements().len(), 1);
    assert_eq!(closes(&server), 0);

    while rs.next().unwrap() {}
    assert!(server.wait_for(|e| matches!(e, Logged::Close(_))));
    assert_eq!(closes(&server), 1);

    // the connection is usable again
    assert!(select.execute_query().unwrap().next().unwrap());
}
