//! Core types shared by the tidewire driver crates.
//!
//! - [`Error`] and [`Result`] with the driver's error taxonomy
//! - [`Value`] for dynamically-typed SQL values
//! - [`Row`] and [`FromValue`] for reading result rows

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    BoundsError, ConfigError, ConnectionError, ConnectionErrorKind, Error, ErrorKind, PoolError,
    PoolErrorKind, ProtocolError, QueryError, QueryErrorKind, Result, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;

pub use chrono;
pub use rust_decimal::Decimal;
