use std::io::Read;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;

use tidewire_core::{Error, Value};
use tidewire_mysql::testing::{MockColumn, MockServer, Reply};
use tidewire_mysql::types::FieldType;
use tidewire_mysql::{ConnectionContext, ReplicationRouter, ResultSet, Statement};

/// The single row of `db.docs (id, data BLOB, body TEXT)`.
#[derive(Debug)]
struct Doc {
    exists: bool,
    data: Vec<u8>,
    body: Vec<char>,
}

type Table = Arc<Mutex<Doc>>;

fn table(data: &[u8], body: &str) -> Table {
    Arc::new(Mutex::new(Doc {
        exists: true,
        data: data.to_vec(),
        body: body.chars().collect(),
    }))
}

enum Literal {
    Bytes(Vec<u8>),
    Text(String),
}

fn literal(sql: &str) -> Literal {
    if let Some(hex) = sql.strip_prefix("X'").and_then(|s| s.strip_suffix('\'')) {
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect();
        Literal::Bytes(bytes)
    } else {
        let text = sql.trim_matches('\'');
        Literal::Text(text.to_string())
    }
}

fn data_column() -> MockColumn {
    MockColumn::new("data", FieldType::Blob).table("db", "docs")
}

fn body_column() -> MockColumn {
    MockColumn::new("body", FieldType::Blob).table("db", "docs").charset(45)
}

fn cell(column: &str, units: &[u8], chars: &[char]) -> Reply {
    if column == "data" {
        Reply::rows(vec![data_column()], vec![vec![Value::Bytes(units.to_vec())]])
    } else {
        Reply::rows(
            vec![body_column()],
            vec![vec![Value::Text(chars.iter().collect())]],
        )
    }
}

fn splice<T: Clone>(target: &mut Vec<T>, pos: usize, count: usize, new: &[T]) {
    let start = pos - 1;
    let end = (start + count).min(target.len());
    target.splice(start..end, new.iter().cloned());
}

fn locate<T: PartialEq>(haystack: &[T], needle: &[T], start: usize) -> usize {
    haystack
        .get(start - 1..)
        .and_then(|tail| tail.windows(needle.len()).position(|w| w == needle))
        .map_or(0, |i| i + start)
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).unwrap());
    };
}

pattern!(LENGTH, r"^SELECT (CHAR_)?LENGTH\(`(\w+)`\) FROM `db`\.`docs` WHERE `id` <=> 1$");
pattern!(SUBSTRING, r"^SELECT SUBSTRING\(`(\w+)`, (\d+), (\d+)\) FROM `db`\.`docs`");
pattern!(LOCATE, r"^SELECT LOCATE\((.+), `(\w+)`, (\d+)\) FROM `db`\.`docs`");
pattern!(INSERT, r"^UPDATE `db`\.`docs` SET `(\w+)` = INSERT\(`\w+`, (\d+), (\d+), (.+)\) WHERE");
pattern!(APPEND, r"^UPDATE `db`\.`docs` SET `(\w+)` = CONCAT\(IFNULL\(`\w+`, ''\), (.+)\) WHERE");
pattern!(LEFT, r"^UPDATE `db`\.`docs` SET `(\w+)` = LEFT\(`\w+`, (\d+)\) WHERE");
pattern!(ASSIGN, r"^UPDATE `db`\.`docs` SET `(\w+)` = (.+) WHERE `id` <=> 1 LIMIT 1$");

fn handle(doc: &mut Doc, sql: &str) -> Reply {
    if sql.starts_with("SELECT id, data, body FROM docs")
        || sql == "SELECT `id`, `data`, `body` FROM `db`.`docs` WHERE `id` <=> 1 LIMIT 1"
    {
        let rows = if doc.exists {
            vec![vec![
                Value::Int(1),
                Value::Bytes(doc.data.clone()),
                Value::Text(doc.body.iter().collect()),
            ]]
        } else {
            Vec::new()
        };
        let id = MockColumn::new("id", FieldType::Long)
            .table("db", "docs")
            .primary_key();
        return Reply::rows(vec![id, data_column(), body_column()], rows);
    }
    if sql.starts_with("DELETE FROM `db`.`docs` WHERE `id` <=> 1") {
        let affected = u64::from(doc.exists);
        doc.exists = false;
        return Reply::affected(affected);
    }
    if let Some(c) = LENGTH.captures(sql) {
        let len = if &c[2] == "data" { doc.data.len() } else { doc.body.len() };
        return Reply::scalar("len", FieldType::LongLong, Value::BigInt(len as i64));
    }
    if let Some(c) = SUBSTRING.captures(sql) {
        let start: usize = c[2].parse().unwrap();
        let len: usize = c[3].parse().unwrap();
        let (from, data_end, body_end) = (
            start - 1,
            (start - 1 + len).min(doc.data.len()),
            (start - 1 + len).min(doc.body.len()),
        );
        return cell(
            &c[1],
            doc.data.get(from..data_end).unwrap_or_default(),
            doc.body.get(from..body_end).unwrap_or_default(),
        );
    }
    if let Some(c) = LOCATE.captures(sql) {
        let start: usize = c[3].parse().unwrap();
        let found = match literal(&c[1]) {
            Literal::Bytes(b) => locate(&doc.data, &b, start),
            Literal::Text(t) => locate(&doc.body, &t.chars().collect::<Vec<_>>(), start),
        };
        return Reply::scalar("pos", FieldType::LongLong, Value::BigInt(found as i64));
    }
    if let Some(c) = INSERT.captures(sql) {
        let pos: usize = c[2].parse().unwrap();
        let count: usize = c[3].parse().unwrap();
        match literal(&c[4]) {
            Literal::Bytes(b) => splice(&mut doc.data, pos, count, &b),
            Literal::Text(t) => splice(&mut doc.body, pos, count, &t.chars().collect::<Vec<_>>()),
        }
        return Reply::affected(1);
    }
    if let Some(c) = APPEND.captures(sql) {
        match literal(&c[2]) {
            Literal::Bytes(b) => doc.data.extend(b),
            Literal::Text(t) => doc.body.extend(t.chars()),
        }
        return Reply::affected(1);
    }
    if let Some(c) = LEFT.captures(sql) {
        let len: usize = c[2].parse().unwrap();
        if &c[1] == "data" {
            doc.data.truncate(len);
        } else {
            doc.body.truncate(len);
        }
        return Reply::affected(1);
    }
    if let Some(c) = ASSIGN.captures(sql) {
        if !doc.exists {
            return Reply::affected(0);
        }
        match literal(&c[2]) {
            Literal::Bytes(b) => doc.data = b,
            // non-strict server clipping to the column width
            Literal::Text(t) => doc.body = t.chars().take(8).collect(),
        }
        return Reply::affected(1);
    }
    Reply::ok()
}

fn docs_server(doc: Table) -> MockServer {
    MockServer::with_handler(move |sql| handle(&mut doc.lock(), sql)).unwrap()
}

fn open_docs(ctx: &Arc<dyn ConnectionContext>) -> (Statement, ResultSet) {
    let mut stmt = Statement::new(Arc::clone(ctx), "SELECT id, data, body FROM docs").unwrap();
    let mut rs = stmt.execute_query().unwrap();
    assert!(rs.next().unwrap());
    (stmt, rs)
}

fn locator_context(server: &MockServer) -> Arc<dyn ConnectionContext> {
    Arc::new(server.connect_with(server.config().emulate_locators(true)).unwrap())
}

#[test]
fn blob_locator_reads_and_writes_through_the_row() {
    let doc = table(b"abcdef", "");
    let server = docs_server(Arc::clone(&doc));
    let ctx = locator_context(&server);
    let (_stmt, mut rs) = open_docs(&ctx);

    let mut blob = rs.get_blob("data").unwrap().unwrap();
    assert!(blob.is_locator());
    assert_eq!(blob.length().unwrap(), 6);
    assert_eq!(blob.get_bytes(1, 3).unwrap(), b"bcd");

    // overwrite past the end: the value grows
    assert_eq!(blob.set_bytes(3, b"XYZ12").unwrap(), 5);
    assert_eq!(doc.lock().data, b"abcXYZ12");
    assert_eq!(blob.length().unwrap(), 8);

    // append at exactly the end
    blob.set_bytes(8, b"!").unwrap();
    assert_eq!(blob.to_vec().unwrap(), b"abcXYZ12!");

    let err = blob.set_bytes(20, b"?").unwrap_err();
    assert!(matches!(err, Error::IndexBounds(_)));

    assert!(server
        .queries()
        .iter()
        .any(|q| q == "SELECT LENGTH(`data`) FROM `db`.`docs` WHERE `id` <=> 1"));
}

#[test]
fn blob_position_and_truncate() {
    let doc = table(b"hello world", "");
    let server = docs_server(Arc::clone(&doc));
    let ctx = locator_context(&server);
    let (_stmt, mut rs) = open_docs(&ctx);
    let mut blob = rs.get_blob(1).unwrap().unwrap();

    assert_eq!(blob.position(b"o", 1).unwrap(), Some(5));
    assert_eq!(blob.position(b"o", 6).unwrap(), Some(8));
    assert_eq!(blob.position(b"zz", 1).unwrap(), None);
    assert_eq!(blob.position(b"o", 12).unwrap(), None);
    assert!(matches!(blob.position(b"o", 0), Err(Error::InvalidArgument(_))));

    blob.truncate(5).unwrap();
    assert_eq!(doc.lock().data, b"hello");
    blob.truncate(0).unwrap();
    let mut out = Vec::new();
    blob.binary_stream().unwrap().read_to_end(&mut out).unwrap();
    assert!(out.is_empty());
}

#[test]
fn blob_stream_reads_whole_value() {
    let doc = table(b"streamed content", "");
    let server = docs_server(doc);
    let ctx = locator_context(&server);
    let (_stmt, mut rs) = open_docs(&ctx);
    let mut blob = rs.get_blob("data").unwrap().unwrap();

    let mut out = Vec::new();
    blob.binary_stream().unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, b"streamed content");
}

#[test]
fn clob_locator_counts_characters() {
    let doc = table(b"", "naïve café");
    let server = docs_server(Arc::clone(&doc));
    let ctx = locator_context(&server);
    let (_stmt, mut rs) = open_docs(&ctx);
    let mut clob = rs.get_clob("body").unwrap().unwrap();

    assert!(clob.is_locator());
    assert_eq!(clob.length().unwrap(), 10);
    assert_eq!(clob.substring(6, 4).unwrap(), "café");
    assert_eq!(clob.position("café", 1).unwrap(), Some(7));

    clob.set_string(0, "NAÏVE").unwrap();
    assert_eq!(doc.lock().body.iter().collect::<String>(), "NAÏVE café");
    assert!(server.queries().iter().any(|q| q.starts_with("SELECT CHAR_LENGTH(`body`)")));
}

#[test]
fn locators_go_stale_when_result_set_closes() {
    let doc = table(b"abc", "text");
    let server = docs_server(doc);
    let ctx = locator_context(&server);
    let (_stmt, mut rs) = open_docs(&ctx);

    let mut blob = rs.get_blob("data").unwrap().unwrap();
    let mut clob = rs.get_clob("body").unwrap().unwrap();
    assert_eq!(blob.length().unwrap(), 3);
    rs.close().unwrap();

    // cached length does not bypass the check
    assert!(matches!(blob.length(), Err(Error::StaleLocator)));
    assert!(matches!(blob.get_bytes(0, 1), Err(Error::StaleLocator)));
    assert!(matches!(clob.substring(0, 1), Err(Error::StaleLocator)));
}

#[test]
fn values_are_materialized_without_emulation() {
    let doc = table(b"raw", "plain");
    let server = docs_server(doc);
    let ctx: Arc<dyn ConnectionContext> = Arc::new(server.connect().unwrap());
    let (_stmt, mut rs) = open_docs(&ctx);

    let mut blob = rs.get_blob("data").unwrap().unwrap();
    assert!(!blob.is_locator());
    assert_eq!(blob.to_vec().unwrap(), b"raw");
    rs.close().unwrap();
    assert_eq!(blob.length().unwrap(), 3);

    let before = server.queries().len();
    blob.set_bytes(3, b"!").unwrap();
    assert_eq!(server.queries().len(), before);
}

#[test]
fn updatable_result_set_writes_back() {
    let doc = table(b"old", "body");
    let server = docs_server(Arc::clone(&doc));
    let ctx: Arc<dyn ConnectionContext> = Arc::new(server.connect().unwrap());
    let (_stmt, mut rs) = open_docs(&ctx);
    assert!(rs.is_updatable());

    rs.update_value("data", b"new".to_vec()).unwrap();
    rs.update_row().unwrap();
    assert_eq!(doc.lock().data, b"new");
    assert_eq!(rs.get_bytes("data").unwrap().unwrap(), b"new");
    assert!(server
        .queries()
        .iter()
        .any(|q| q == "UPDATE `db`.`docs` SET `data` = X'6E6577' WHERE `id` <=> 1 LIMIT 1"));

    rs.delete_row().unwrap();
    assert!(!doc.lock().exists);
    assert!(!rs.next().unwrap());
    assert!(!rs.first().unwrap());
}

#[test]
fn updated_row_is_read_back_from_the_server() {
    let doc = table(b"raw", "short");
    let server = docs_server(Arc::clone(&doc));
    let ctx: Arc<dyn ConnectionContext> = Arc::new(server.connect().unwrap());
    let (_stmt, mut rs) = open_docs(&ctx);

    rs.update_value("body", "a rather long body").unwrap();
    rs.update_row().unwrap();

    // the stored value, not the staged one
    assert_eq!(rs.get_string("body").unwrap().as_deref(), Some("a rather"));
    assert_eq!(rs.get_bytes("data").unwrap().unwrap(), b"raw");
    assert_eq!(
        server.queries().last().map(String::as_str),
        Some("SELECT `id`, `data`, `body` FROM `db`.`docs` WHERE `id` <=> 1 LIMIT 1")
    );

    // a deleted row leaves nothing to refresh: staged values are kept
    rs.update_value("body", "gone").unwrap();
    doc.lock().exists = false;
    assert!(rs.update_row().is_err());
    assert_eq!(rs.get_string("body").unwrap().as_deref(), Some("gone"));
}

#[test]
fn router_reads_from_replica_and_writes_to_source() {
    let doc = table(b"shared", "");
    let source = docs_server(Arc::clone(&doc));
    let replica = docs_server(Arc::clone(&doc));

    let router = ReplicationRouter::new(
        source.connect_with(source.config().emulate_locators(true)).unwrap(),
        vec![replica.connect_with(replica.config().emulate_locators(true)).unwrap()],
    );
    router.use_replica(0).unwrap();
    assert!(!router.on_source());
    let ctx: Arc<dyn ConnectionContext> = Arc::new(router);
    source.clear_log();
    replica.clear_log();

    let (_stmt, mut rs) = open_docs(&ctx);
    let mut blob = rs.get_blob("data").unwrap().unwrap();
    assert_eq!(blob.length().unwrap(), 6);
    blob.set_bytes(6, b"!").unwrap();
    assert_eq!(doc.lock().data, b"shared!");

    let reads = replica.queries();
    let writes = source.queries();
    assert!(reads.iter().any(|q| q.starts_with("SELECT id, data, body")));
    assert!(reads.iter().any(|q| q.starts_with("SELECT LENGTH")));
    assert!(reads.iter().all(|q| !q.starts_with("UPDATE")));
    assert!(writes.iter().any(|q| q.starts_with("UPDATE `db`.`docs` SET `data` = CONCAT")));
    assert!(writes.iter().all(|q| !q.starts_with("SELECT id")));
}
