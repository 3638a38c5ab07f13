//! MySQL driver core for tidewire.
//!
//! This crate speaks the MySQL client/server protocol over a blocking TCP
//! socket. It provides:
//!
//! - Packet framing with sequence numbers and 16MB continuation frames
//! - Authentication (mysql_native_password, caching_sha2_password)
//! - Charset negotiation from the configured encoding and collation
//! - Text and binary protocols, server cursors and long data
//! - Client-rewritten and server-held [`Statement`]s with batching
//! - Buffered, streaming and cursor [`ResultSet`]s, optionally updatable
//! - Locator-backed [`Blob`] and [`Clob`] values
//! - Source/replica routing through [`ConnectionContext`]
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidewire_mysql::{MySqlConfig, SharedConnection, Statement};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let conn = SharedConnection::connect(config)?;
//! let mut stmt = Statement::new(Arc::new(conn), "SELECT name FROM users WHERE id = ?")?;
//! stmt.bind(0, 42)?;
//! let mut rows = stmt.execute_query()?;
//! while rows.next()? {
//!     println!("{:?}", rows.get_string("name")?);
//! }
//! ```

pub mod auth;
pub mod charset;
pub mod config;
pub mod connection;
pub mod lob;
pub mod protocol;
pub mod result_set;
pub mod routing;
pub mod sql;
pub mod statement;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod trace;
pub mod types;

pub use charset::{CharsetNegotiator, CharsetPlan, Encoding};
pub use config::MySqlConfig;
pub use connection::{PhysicalConnection, QueryResult, SharedConnection, WeakConnection};
pub use lob::{Blob, Clob, LobStream};
pub use result_set::{ColumnIndex, ResultSet};
pub use routing::{ConnectionContext, ReplicationRouter};
pub use statement::{Statement, StatementOptions, StatementState, StreamKind, UpdateCount};
pub use types::{ColumnDef, FieldType};
