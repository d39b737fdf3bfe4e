use crate::config::StorageConfig;
use crate::proto;
use crate::storage::{Direction, Lookup, StoreError, UpdateMode};
use crate::types::{Sequence, StagedMessage};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::{error, info, trace, warn};

pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite backed staging store
///
/// The pool holds exactly one connection, and a `Cursor` keeps it checked
/// out for its whole lifetime, so at most one transaction can be open at a
/// time. A second `begin` while a cursor is live fails with `Busy` instead
/// of nesting.
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, StoreError> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let synchronous = config.synchronous.clone();
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", &synchronous)?;

            Self::create_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", &synchronous)?;
            Ok(())
        });

        let pool = Pool::builder().max_size(1).build(manager)?;

        let store = SqliteStore { pool };
        info!(
            "store {:?} contains {} record(s)",
            path_ref,
            store.count()?
        );
        Ok(store)
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- Messages staged until the broker confirms them
            CREATE TABLE IF NOT EXISTS staged (
                seq INTEGER PRIMARY KEY,
                record BLOB NOT NULL
            );
            "#,
        )
    }

    /// Open a transaction and a cursor on it
    pub fn begin(&self) -> Result<Cursor, StoreError> {
        let conn = self.pool.try_get().ok_or(StoreError::Busy)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        trace!("began transaction");

        Ok(Cursor {
            conn,
            key: None,
            value: None,
            position: None,
            open: true,
        })
    }

    /// Number of staged records
    pub fn count(&self) -> Result<u64, StoreError> {
        let cursor = self.begin()?;
        let count = cursor.count();
        cursor.end(false)?;
        count
    }

    /// Highest staged key, if any
    pub fn last_key(&self) -> Result<Option<Sequence>, StoreError> {
        let cursor = self.begin()?;
        let key = cursor.last_key();
        cursor.end(false)?;
        key
    }
}

/// A transaction plus a position in the ordered `staged` table
///
/// Holds a key buffer and a value buffer that positional operations read
/// and fill, mirroring a B-tree cursor. Must be finished with `end`; a
/// cursor dropped without it aborts its transaction.
pub struct Cursor {
    conn: PooledConnection<SqliteConnectionManager>,
    key: Option<Sequence>,
    value: Option<Vec<u8>>,
    position: Option<Sequence>,
    open: bool,
}

impl Cursor {
    pub fn set_key(&mut self, key: Sequence) {
        self.key = Some(key);
    }

    pub fn key(&self) -> Option<Sequence> {
        self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Decode the record the cursor is positioned on
    pub fn message(&self) -> Result<StagedMessage, StoreError> {
        match (self.position, self.value.as_deref()) {
            (Some(seq), Some(value)) => Ok(proto::decode_message(seq, value)?),
            _ => Err(StoreError::NotPositioned),
        }
    }

    /// Position the cursor on `key` and load its value
    pub fn get(&mut self, key: Sequence) -> Result<Lookup, StoreError> {
        trace!("get, setting cursor to '{}'", key);
        self.key = Some(key);
        self.value = None;

        let value: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT record FROM staged WHERE seq = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(value) => {
                self.value = Some(value);
                self.position = Some(key);
                Ok(Lookup::Found)
            }
            None => {
                trace!("'{}' was not found", key);
                self.position = None;
                Ok(Lookup::NotFound)
            }
        }
    }

    /// Move to the next or previous record in key order
    ///
    /// An unpositioned cursor moves to the first (`Next`) or last (`Prev`)
    /// record. At either end the position is left unchanged.
    pub fn sibling(&mut self, direction: Direction) -> Result<Lookup, StoreError> {
        let sql = match (direction, self.position) {
            (Direction::Next, Some(_)) => {
                "SELECT seq, record FROM staged WHERE seq > ?1 ORDER BY seq ASC LIMIT 1"
            }
            (Direction::Prev, Some(_)) => {
                "SELECT seq, record FROM staged WHERE seq < ?1 ORDER BY seq DESC LIMIT 1"
            }
            (Direction::Next, None) => "SELECT seq, record FROM staged ORDER BY seq ASC LIMIT 1",
            (Direction::Prev, None) => "SELECT seq, record FROM staged ORDER BY seq DESC LIMIT 1",
        };

        let read_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(Sequence, Vec<u8>)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let row = match self.position {
            Some(pos) => self.conn.query_row(sql, [pos], read_row).optional()?,
            None => self.conn.query_row(sql, [], read_row).optional()?,
        };

        match row {
            Some((seq, value)) => {
                trace!("got record '{}' as sibling", seq);
                self.key = Some(seq);
                self.value = Some(value);
                self.position = Some(seq);
                Ok(Lookup::Found)
            }
            None => Ok(Lookup::NotFound),
        }
    }

    /// Insert `value` at the key buffer; the key must not exist yet
    pub fn put(&mut self, value: &[u8]) -> Result<(), StoreError> {
        let key = self.key.ok_or(StoreError::NoKey)?;
        trace!("putting '{}' (size {}) into the store", key, value.len());

        self.conn.execute(
            "INSERT INTO staged (seq, record) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        self.value = Some(value.to_vec());
        self.position = Some(key);
        Ok(())
    }

    /// Rewrite a record in place (`Current`) or at the key buffer (`Key`)
    pub fn update(&mut self, mode: UpdateMode, value: &[u8]) -> Result<(), StoreError> {
        match mode {
            UpdateMode::Current => {
                let pos = self.position.ok_or(StoreError::NotPositioned)?;
                trace!("update '{}', replacing current", pos);
                let changed = self.conn.execute(
                    "UPDATE staged SET record = ?2 WHERE seq = ?1",
                    rusqlite::params![pos, value],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotPositioned);
                }
            }
            UpdateMode::Key => {
                let key = self.key.ok_or(StoreError::NoKey)?;
                trace!("update '{}', writing at key", key);
                self.conn.execute(
                    "INSERT OR REPLACE INTO staged (seq, record) VALUES (?1, ?2)",
                    rusqlite::params![key, value],
                )?;
                self.position = Some(key);
            }
        }
        self.value = Some(value.to_vec());
        Ok(())
    }

    /// Delete the record under the cursor
    ///
    /// Deleting an absent record, or with no position at all, is a no-op.
    pub fn delete(&mut self) -> Result<(), StoreError> {
        let Some(pos) = self.position else {
            trace!("delete without position, nothing to do");
            return Ok(());
        };

        let changed = self
            .conn
            .execute("DELETE FROM staged WHERE seq = ?1", [pos])?;
        if changed == 0 {
            trace!("'{}' already deleted", pos);
        } else {
            trace!("deleted '{}'", pos);
        }
        self.value = None;
        Ok(())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM staged", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn last_key(&self) -> Result<Option<Sequence>, StoreError> {
        let key: Option<Sequence> =
            self.conn
                .query_row("SELECT MAX(seq) FROM staged", [], |row| row.get(0))?;
        Ok(key)
    }

    /// Commit or abort the transaction and release the connection
    ///
    /// The store never keeps a transaction open past this call: a failed
    /// commit is followed by a rollback before the error is returned.
    pub fn end(mut self, commit: bool) -> Result<(), StoreError> {
        self.finish(commit)
    }

    fn finish(&mut self, commit: bool) -> Result<(), StoreError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        if commit {
            trace!("committing transaction");
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                error!("transaction failed: {}", e);
                if !self.conn.is_autocommit() {
                    let _ = self.conn.execute_batch("ROLLBACK");
                }
                return Err(e.into());
            }
        } else {
            trace!("aborting transaction");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                error!("could not abort transaction: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.open {
            warn!("cursor dropped inside a transaction, aborting");
            let _ = self.finish(false);
        }
    }
}
