//! Incremental I/O over one cell of the `blobs.bytes` column
//!
//! A handle does not keep SQLite's blob object open. Each read or write locks
//! the connection and reopens the cell, so a handle can cross tasks and
//! outlive the statement that produced its row.

use std::sync::Weak;

use parking_lot::Mutex;
use rusqlite::DatabaseName;

use crate::connection::DatabaseConnection;
use crate::error::{Result, SqliteError};

const BLOBS_TABLE: &str = "blobs";
const BYTES_COLUMN: &str = "bytes";

/// Handle on the bytes of one blob row.
#[derive(Debug, Clone)]
pub(crate) struct StreamingBlobHandle {
    connection: Weak<Mutex<DatabaseConnection>>,
    row_id: i64,
    read_only: bool,
    size: u64,
    invalidated: bool,
}

impl StreamingBlobHandle {
    /// Check that the cell exists and capture its size.
    pub(crate) fn open(
        sql: &rusqlite::Connection,
        connection: Weak<Mutex<DatabaseConnection>>,
        row_id: i64,
        read_only: bool,
    ) -> Result<Self> {
        let blob = sql.blob_open(DatabaseName::Main, BLOBS_TABLE, BYTES_COLUMN, row_id, read_only)?;
        let size = blob.len() as u64;
        Ok(Self {
            connection,
            row_id,
            read_only,
            size,
            invalidated: false,
        })
    }

    pub(crate) fn row_id(&self) -> i64 {
        self.row_id
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` from `offset`. Fails if the range runs past the end.
    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_valid()?;
        let start = to_usize(offset)?;
        let connection = self.connection.upgrade().ok_or(SqliteError::ConnectionClosed)?;
        let guard = connection.lock();
        let blob = guard.sql().blob_open(
            DatabaseName::Main,
            BLOBS_TABLE,
            BYTES_COLUMN,
            self.row_id,
            true,
        )?;
        blob.read_at_exact(buf, start)?;
        Ok(())
    }

    /// Write `data` at `offset`. The cell cannot grow.
    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_valid()?;
        if self.read_only {
            return Err(SqliteError::InvalidArgument(
                "write through a read-only blob handle".to_string(),
            ));
        }
        let start = to_usize(offset)?;
        let connection = self.connection.upgrade().ok_or(SqliteError::ConnectionClosed)?;
        let guard = connection.lock();
        let mut blob = guard.sql().blob_open(
            DatabaseName::Main,
            BLOBS_TABLE,
            BYTES_COLUMN,
            self.row_id,
            false,
        )?;
        blob.write_at(data, start)?;
        Ok(())
    }

    /// Refuse all further I/O through this handle.
    pub(crate) fn invalidate(&mut self) {
        self.invalidated = true;
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.invalidated {
            return Err(SqliteError::InvalidArgument(format!(
                "blob handle for row {} was invalidated",
                self.row_id
            )));
        }
        Ok(())
    }
}

fn to_usize(offset: u64) -> Result<usize> {
    usize::try_from(offset)
        .map_err(|_| SqliteError::InvalidArgument(format!("blob offset {} out of range", offset)))
}
