pub mod sqlite;

pub use sqlite::{Cursor, SqliteStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not obtain store connection: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("corrupt staged record: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("another transaction is already open")]
    Busy,
    #[error("no key set on cursor")]
    NoKey,
    #[error("cursor is not positioned on a record")]
    NotPositioned,
}

/// Outcome of a positional cursor operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// Where `Cursor::update` writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Replace the record the cursor is positioned on
    Current,
    /// Write at the key buffer, inserting if absent
    Key,
}
