//! Last-synchronization bookkeeping.
//!
//! One row (`id = 1`) in `sync_table(id INTEGER PRIMARY KEY, sync_date
//! INTEGER)` holds the Unix-seconds time of the last sync. The table is
//! created lazily and creation is idempotent.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::executor::in_transaction;

/// Name of the sync-metadata table. Never exported.
pub const SYNC_TABLE: &str = "sync_table";

/// Creates the sync table and its row if missing.
///
/// Returns `1` when the row was created and `0` when it already existed.
pub fn ensure_sync_table(conn: &Connection) -> Result<u64> {
    in_transaction(conn, |tx| {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_table (id INTEGER PRIMARY KEY NOT NULL, sync_date INTEGER);",
        )
        .map_err(StoreError::sql("create sync table"))?;
        let changes = tx
            .execute(
                "INSERT OR IGNORE INTO sync_table (id, sync_date) VALUES (1, ?1)",
                [Utc::now().timestamp()],
            )
            .map_err(StoreError::sql("insert sync row"))?;
        if changes > 0 {
            debug!("sync table created");
        }
        Ok(changes as u64)
    })
}

/// Parses an RFC 3339 timestamp into Unix seconds.
///
/// # Examples
///
/// ```
/// use versioned_db_sqlite::parse_sync_date;
///
/// assert_eq!(parse_sync_date("2024-01-01T00:00:00Z").unwrap(), 1_704_067_200);
/// assert_eq!(parse_sync_date("2024-01-01T02:00:00+02:00").unwrap(), 1_704_067_200);
/// assert!(parse_sync_date("yesterday").is_err());
/// ```
pub fn parse_sync_date(iso: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(iso.trim())
        .map(|dt| dt.timestamp())
        .map_err(|_| StoreError::InvalidSyncDate(iso.to_string()))
}

/// Stores an RFC 3339 timestamp as the last sync date.
pub fn set_sync_date(conn: &Connection, iso: &str) -> Result<()> {
    let seconds = parse_sync_date(iso)?;
    set_sync_timestamp(conn, seconds)
}

/// Stores Unix seconds as the last sync date.
pub fn set_sync_timestamp(conn: &Connection, seconds: i64) -> Result<()> {
    in_transaction(conn, |tx| {
        ensure_sync_table(tx)?;
        tx.execute(
            "UPDATE sync_table SET sync_date = ?1 WHERE id = 1",
            [seconds],
        )
        .map_err(StoreError::sql("update sync date"))?;
        Ok(())
    })
}

/// Returns the last sync date in Unix seconds.
pub fn get_sync_date(conn: &Connection) -> Result<i64> {
    stored_sync_date(conn)?
        .ok_or_else(|| StoreError::InvalidSyncDate("no sync date recorded".to_string()))
}

/// Returns the last sync date as a UTC timestamp.
pub fn sync_date_utc(conn: &Connection) -> Result<DateTime<Utc>> {
    let seconds = get_sync_date(conn)?;
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| StoreError::InvalidSyncDate(seconds.to_string()))
}

/// Reads the sync date without creating anything; `None` if the table or
/// its row is missing.
pub(crate) fn stored_sync_date(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [SYNC_TABLE],
            |row| row.get(0),
        )
        .map_err(StoreError::sql("look up sync table"))?;
    if !exists {
        return Ok(None);
    }
    conn.query_row("SELECT sync_date FROM sync_table WHERE id = 1", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .optional()
    .map(Option::flatten)
    .map_err(StoreError::sql("read sync date"))
}
