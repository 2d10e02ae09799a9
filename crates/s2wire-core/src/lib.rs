//! Core types shared by the s2wire protocol client.
//!
//! - `Error` and `ErrorCategory`: the categorized error taxonomy
//! - `Value`: a decoded column value
//! - `Row` / `ColumnInfo`: ordered values with name lookup

pub mod error;
pub mod row;
pub mod value;

pub use error::{Error, ErrorCategory, Result};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
