use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use regex::Regex;

use tidewire_core::Value;
use tidewire_mysql::testing::{MockColumn, MockServer, Reply};
use tidewire_mysql::types::FieldType;
use tidewire_mysql::{ConnectionContext, Statement, StatementOptions};

static TEMPORALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SELECT '([^']*)', '([^']*)', '([^']*)'$").unwrap());

fn temporal_columns() -> Vec<MockColumn> {
    vec![
        MockColumn::new("ts", FieldType::DateTime).decimals(6),
        MockColumn::new("d", FieldType::Date),
        MockColumn::new("t", FieldType::Time).decimals(6),
    ]
}

/// Echoes three temporal literals back as typed columns.
fn echo(sql: &str) -> Reply {
    let Some(c) = TEMPORALS.captures(sql) else {
        return Reply::rows(temporal_columns(), vec![vec![Value::Null; 3]]);
    };
    let ts = NaiveDateTime::parse_from_str(&c[1], "%Y-%m-%d %H:%M:%S%.f").unwrap();
    let d = NaiveDate::parse_from_str(&c[2], "%Y-%m-%d").unwrap();
    let t = NaiveTime::parse_from_str(&c[3], "%H:%M:%S%.f").unwrap();
    Reply::rows(
        temporal_columns(),
        vec![vec![Value::Timestamp(ts), Value::Date(d), Value::Time(t)]],
    )
}

fn round_trips(ctx: Arc<dyn ConnectionContext>, options: StatementOptions, until: Instant) -> u32 {
    let base = NaiveDate::from_ymd_opt(2024, 1, 31)
        .unwrap()
        .and_hms_micro_opt(23, 59, 58, 123_456)
        .unwrap();
    let mut stmt = Statement::with_options(ctx, "SELECT ?, ?, ?", options).unwrap();
    let mut done = 0u32;
    while Instant::now() < until {
        let ts = base + TimeDelta::seconds(i64::from(done));
        stmt.bind(0, ts).unwrap();
        stmt.bind(1, ts.date()).unwrap();
        stmt.bind(2, ts.time()).unwrap();

        let mut rs = stmt.execute_query().unwrap();
        assert!(rs.next().unwrap());
        assert_eq!(rs.get_timestamp(0).unwrap(), Some(ts));
        assert_eq!(rs.get_date(1).unwrap(), Some(ts.date()));
        assert_eq!(rs.get_time(2).unwrap(), Some(ts.time()));
        assert!(!rs.next().unwrap());
        done += 1;
    }
    done
}

#[test]
fn client_and_server_statements_share_one_connection() {
    let server = MockServer::with_handler(echo).unwrap();
    let config = server.config();
    let ctx: Arc<dyn ConnectionContext> = Arc::new(server.connect().unwrap());
    let until = Instant::now() + Duration::from_secs(3);

    let client = {
        let ctx = Arc::clone(&ctx);
        let options = StatementOptions {
            server_side: false,
            ..StatementOptions::from_config(&config)
        };
        thread::spawn(move || round_trips(ctx, options, until))
    };
    let prepared = {
        let ctx = Arc::clone(&ctx);
        let options = StatementOptions {
            server_side: true,
            ..StatementOptions::from_config(&config)
        };
        thread::spawn(move || round_trips(ctx, options, until))
    };

    let client = client.join().unwrap();
    let prepared = prepared.join().unwrap();
    assert!(client > 0);
    assert!(prepared > 0);

    let conn = ctx.active_connection().unwrap();
    assert!(!conn.lock().is_dead());
    assert!(!conn.lock().has_active_stream());
}
