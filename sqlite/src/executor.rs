//! Transactional statement execution.
//!
//! Provides [`Executor`] for running raw SQL batches, parameter-bound
//! statement sets and read-only queries against a borrowed connection. All
//! mutating calls share one envelope, [`in_transaction`]: begin, run the
//! body, commit; on any body failure roll back, and if the rollback itself
//! fails report both errors.
//!
//! # Example
//!
//! ```
//! use rusqlite::Connection;
//! use versioned_db_core::{BoundStatement, CellValue};
//! use versioned_db_sqlite::Executor;
//!
//! let conn = Connection::open_in_memory().unwrap();
//! let exec = Executor::new(&conn);
//! exec.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);", true).unwrap();
//!
//! let outcome = exec
//!     .execute_set(
//!         &[BoundStatement::new("INSERT INTO t (name) VALUES (?)", vec!["a".into()])],
//!         true,
//!     )
//!     .unwrap();
//! assert_eq!(outcome.last_id, 1);
//!
//! let rows = exec.query_all("SELECT name FROM t", &[]).unwrap();
//! assert_eq!(rows[0]["name"], CellValue::Text("a".into()));
//! ```

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params_from_iter};
use versioned_db_core::{BoundStatement, CellValue, Row};

use crate::error::{Result, StoreError, TransactionStage};

/// Result of a mutating call: rows changed and the last inserted row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOutcome {
    /// Rows inserted, updated or deleted.
    pub changes: u64,
    /// Row id of the final `INSERT`, or `-1` if none ran.
    pub last_id: i64,
}

impl Default for SetOutcome {
    fn default() -> Self {
        Self {
            changes: 0,
            last_id: -1,
        }
    }
}

/// Runs `body` inside a transaction scope.
///
/// If a scope is already open on the connection, `body` joins it instead
/// of nesting; the owner of that scope decides whether it commits.
///
/// # Errors
///
/// Returns [`StoreError::Transaction`] if begin or commit fails, the body's
/// own error after a successful rollback, or [`StoreError::RollbackFailed`]
/// carrying both errors if the rollback fails too.
pub fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    if !conn.is_autocommit() {
        return body(conn);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|source| StoreError::Transaction {
            stage: TransactionStage::Begin,
            source,
        })?;

    match body(&tx) {
        Ok(value) => {
            tx.commit().map_err(|source| StoreError::Transaction {
                stage: TransactionStage::Commit,
                source,
            })?;
            Ok(value)
        }
        Err(cause) => match tx.rollback() {
            Ok(()) => Err(cause),
            Err(rollback) => Err(StoreError::RollbackFailed {
                cause: Box::new(cause),
                rollback,
            }),
        },
    }
}

/// Opens an explicit transaction scope. Nesting is rejected by the engine.
pub(crate) fn begin(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN DEFERRED")
        .map_err(|source| StoreError::Transaction {
            stage: TransactionStage::Begin,
            source,
        })
}

/// Commits the open scope; a no-op when none is open.
pub(crate) fn commit(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    conn.execute_batch("COMMIT")
        .map_err(|source| StoreError::Transaction {
            stage: TransactionStage::Commit,
            source,
        })
}

/// Rolls back the open scope; a no-op when none is open.
pub(crate) fn rollback(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    conn.execute_batch("ROLLBACK")
        .map_err(|source| StoreError::Transaction {
            stage: TransactionStage::Rollback,
            source,
        })
}

/// Converts a cell into an owned SQLite value for binding.
pub(crate) fn to_sql_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Integer(i) => Value::Integer(*i),
        CellValue::Real(f) => Value::Real(*f),
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Blob(b) => Value::Blob(b.clone()),
    }
}

/// Converts a borrowed SQLite value into a cell.
pub(crate) fn from_value_ref(value: ValueRef<'_>) -> Result<CellValue> {
    Ok(match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(f) => CellValue::Real(f),
        ValueRef::Text(bytes) => CellValue::Text(
            std::str::from_utf8(bytes)
                .map_err(|e| StoreError::Conversion(format!("text column is not UTF-8: {e}")))?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => CellValue::Blob(bytes.to_vec()),
    })
}

fn total_changes(conn: &Connection) -> Result<u64> {
    let total: i64 = conn
        .query_row("SELECT total_changes()", [], |row| row.get(0))
        .map_err(StoreError::sql("read change count"))?;
    Ok(total.max(0) as u64)
}

fn is_insert(sql: &str) -> bool {
    let head = sql.trim_start();
    let keyword = head
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    keyword.eq_ignore_ascii_case("INSERT") || keyword.eq_ignore_ascii_case("REPLACE")
}

/// Statement executor over a borrowed connection.
///
/// The connection handle is never copied; the executor lives only as long
/// as the borrow.
pub struct Executor<'a> {
    conn: &'a Connection,
}

impl<'a> Executor<'a> {
    /// Creates an executor for the given connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Runs one or more semicolon-separated statements as a unit.
    ///
    /// Returns the number of rows changed across the batch. With
    /// `transactional`, a failure anywhere leaves no partial changes.
    pub fn execute_batch(&self, sql: &str, transactional: bool) -> Result<u64> {
        let run = |conn: &Connection| -> Result<u64> {
            let before = total_changes(conn)?;
            conn.execute_batch(sql)
                .map_err(StoreError::sql("execute batch"))?;
            Ok(total_changes(conn)?.saturating_sub(before))
        };
        if transactional {
            in_transaction(self.conn, run)
        } else {
            run(self.conn)
        }
    }

    /// Runs parameter-bound statements in order.
    ///
    /// Returns the total change count and the row id of the final `INSERT`.
    pub fn execute_set(&self, set: &[BoundStatement], transactional: bool) -> Result<SetOutcome> {
        let run = |conn: &Connection| -> Result<SetOutcome> {
            let mut outcome = SetOutcome::default();
            for bound in set {
                let mut stmt = conn
                    .prepare_cached(&bound.statement)
                    .map_err(StoreError::sql("prepare statement"))?;
                let changes = stmt
                    .execute(params_from_iter(bound.values.iter().map(to_sql_value)))
                    .map_err(StoreError::sql("execute statement"))?;
                outcome.changes += changes as u64;
                if is_insert(&bound.statement) {
                    outcome.last_id = conn.last_insert_rowid();
                }
            }
            Ok(outcome)
        };
        if transactional {
            in_transaction(self.conn, run)
        } else {
            run(self.conn)
        }
    }

    /// Runs a single parameter-bound statement.
    pub fn run(&self, sql: &str, values: &[CellValue], transactional: bool) -> Result<SetOutcome> {
        self.execute_set(&[BoundStatement::new(sql, values.to_vec())], transactional)
    }

    /// Runs a read-only query and returns every row, in engine order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotReadOnly`] if the statement would write.
    pub fn query_all(&self, sql: &str, values: &[CellValue]) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(StoreError::sql("prepare query"))?;
        if !stmt.readonly() {
            return Err(StoreError::NotReadOnly(sql.trim().to_string()));
        }

        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt
            .query(params_from_iter(values.iter().map(to_sql_value)))
            .map_err(StoreError::sql("run query"))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(StoreError::sql("read row"))? {
            let mut out = Row::new();
            for (index, name) in names.iter().enumerate() {
                let value = row.get_ref(index).map_err(StoreError::sql("read column"))?;
                out.insert(name.clone(), from_value_ref(value)?);
            }
            result.push(out);
        }
        Ok(result)
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        self.conn
    }
}
