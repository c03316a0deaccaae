use std::collections::HashSet;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};
use versioned_db_core::{
    BoundStatement, DocumentMode, JsonDatabase, JsonTable, quote_ident, validate_document,
};

use super::{ddl, is_user_table};
use crate::error::{Result, StoreError};
use crate::executor::{Executor, in_transaction};
use crate::sync;
use crate::upgrade::write_version;

/// Counts from a successful import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Tables in the document.
    pub tables: usize,
    /// Rows written.
    pub rows: u64,
}

fn foreign_keys_enabled(conn: &Connection) -> Result<bool> {
    conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .map_err(StoreError::sql("read foreign_keys"))
}

fn set_foreign_keys(conn: &Connection, on: bool) -> Result<()> {
    conn.execute_batch(if on {
        "PRAGMA foreign_keys = ON"
    } else {
        "PRAGMA foreign_keys = OFF"
    })
    .map_err(StoreError::sql("set foreign_keys"))
}

fn drop_user_objects(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name FROM sqlite_master WHERE type IN ('view', 'table') \
             ORDER BY type = 'table', rowid",
        )
        .map_err(StoreError::sql("list schema objects"))?;
    let objects = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(StoreError::sql("list schema objects"))?;

    for (kind, name) in objects {
        let sql = match kind.as_str() {
            "view" => format!("DROP VIEW IF EXISTS {};", quote_ident(&name)),
            _ if is_user_table(&name) => format!("DROP TABLE IF EXISTS {};", quote_ident(&name)),
            _ => continue,
        };
        conn.execute_batch(&sql)
            .map_err(StoreError::sql("drop existing object"))?;
        debug!(kind = %kind, name = %name, "dropped");
    }
    Ok(())
}

/// Phase one: every table, then every index and trigger, then every view.
fn create_schema(conn: &Connection, doc: &JsonDatabase) -> Result<()> {
    if doc.mode == DocumentMode::Full {
        drop_user_objects(conn)?;
    }
    for table in &doc.tables {
        if let Some(sql) = table.create_sql() {
            conn.execute_batch(&sql)
                .map_err(StoreError::sql("create table"))?;
        }
    }
    for table in &doc.tables {
        for index in &table.indexes {
            conn.execute_batch(&ddl::index_sql(&table.name, index))
                .map_err(StoreError::sql("create index"))?;
        }
        for trigger in &table.triggers {
            conn.execute_batch(&ddl::trigger_sql(&table.name, trigger))
                .map_err(StoreError::sql("create trigger"))?;
        }
    }
    for view in doc.tables.iter().flat_map(|t| &t.views) {
        conn.execute_batch(&ddl::view_sql(view))
            .map_err(StoreError::sql("create view"))?;
    }
    Ok(())
}

fn key_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0")
        .map_err(StoreError::sql("read primary key"))?;
    stmt.query_map([table], |row| row.get::<_, String>(0))
        .and_then(|rows| {
            rows.map(|name| name.map(|n| n.to_ascii_lowercase()))
                .collect::<rusqlite::Result<HashSet<_>>>()
        })
        .map_err(StoreError::sql("read primary key"))
}

/// Builds one `INSERT` per row. With `keys` set, each insert becomes an
/// upsert that only overwrites the non-key columns the row supplies.
fn row_statements(table: &JsonTable, keys: Option<&HashSet<String>>) -> Vec<BoundStatement> {
    let target = quote_ident(&table.name);
    table
        .values
        .iter()
        .map(|row| {
            if row.is_empty() {
                return BoundStatement::new(
                    format!("INSERT INTO {target} DEFAULT VALUES"),
                    Vec::new(),
                );
            }
            let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
            let placeholders = vec!["?"; row.len()].join(", ");
            let mut sql = format!(
                "INSERT INTO {target} ({}) VALUES ({placeholders})",
                columns.join(", ")
            );
            if let Some(keys) = keys {
                let updates: Vec<String> = row
                    .keys()
                    .filter(|c| !keys.contains(&c.to_ascii_lowercase()))
                    .map(|c| {
                        let column = quote_ident(c);
                        format!("{column} = excluded.{column}")
                    })
                    .collect();
                if updates.is_empty() {
                    sql.push_str(" ON CONFLICT DO NOTHING");
                } else {
                    sql.push_str(" ON CONFLICT DO UPDATE SET ");
                    sql.push_str(&updates.join(", "));
                }
            }
            BoundStatement::new(sql, row.values().cloned().collect())
        })
        .collect()
}

/// Phase two: all row data, parameter-bound.
fn insert_rows(conn: &Connection, doc: &JsonDatabase) -> Result<u64> {
    conn.execute_batch("PRAGMA defer_foreign_keys = ON")
        .map_err(StoreError::sql("defer foreign keys"))?;

    let exec = Executor::new(conn);
    let mut total = 0;
    for table in doc.tables.iter().filter(|t| !t.values.is_empty()) {
        let statements = match doc.mode {
            DocumentMode::Full => row_statements(table, None),
            DocumentMode::Partial => {
                let keys = key_columns(conn, &table.name)?;
                row_statements(table, Some(&keys))
            }
        };
        let outcome = exec.execute_set(&statements, false)?;
        debug!(table = %table.name, rows = outcome.changes, "rows written");
        total += outcome.changes;
    }
    Ok(total)
}

/// Imports a document into the connected database.
///
/// The document is validated first. In `full` mode every existing user
/// table and view is dropped before the document's schema is created;
/// in `partial` mode missing objects are created and rows are upserted,
/// overwriting only the columns each row supplies.
/// Schema and rows commit in separate transactions, and rows are only
/// written once the whole schema is in place. On success the schema
/// version is stamped with the document's version and the sync date is
/// set to now.
///
/// # Errors
///
/// Returns [`StoreError::InvalidImport`] without touching the database if
/// validation fails; otherwise the first SQL error, after rolling back the
/// phase it occurred in.
pub fn import_document(conn: &Connection, doc: &JsonDatabase) -> Result<ImportReport> {
    let errors = validate_document(doc);
    if !errors.is_empty() {
        return Err(StoreError::InvalidImport(errors));
    }

    let toggle_fk = doc.mode == DocumentMode::Full && foreign_keys_enabled(conn)?;
    if toggle_fk {
        set_foreign_keys(conn, false)?;
    }
    let created = in_transaction(conn, |tx| create_schema(tx, doc));
    let restored = if toggle_fk {
        set_foreign_keys(conn, true)
    } else {
        Ok(())
    };
    created?;
    restored?;

    let rows = in_transaction(conn, |tx| {
        let rows = insert_rows(tx, doc)?;
        write_version(tx, doc.version)?;
        Ok(rows)
    })?;
    sync::set_sync_timestamp(conn, Utc::now().timestamp())?;

    info!(
        database = %doc.database,
        mode = doc.mode.as_str(),
        tables = doc.tables.len(),
        rows,
        "imported document"
    );
    Ok(ImportReport {
        tables: doc.tables.len(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use versioned_db_core::{CellValue, ColumnDef, IndexDef, Row, ViewDef};

    use super::*;
    use crate::upgrade::read_version;

    fn row(pairs: &[(&str, CellValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn document() -> JsonDatabase {
        let mut doc = JsonDatabase::new("shop", 3);
        let mut parents = JsonTable::new("parents");
        parents
            .schema
            .push(ColumnDef::new("id", "INTEGER").with_constraint("PRIMARY KEY"));
        parents.values.push(row(&[("id", CellValue::Integer(1))]));

        let mut children = JsonTable::new("children");
        children
            .schema
            .push(ColumnDef::new("id", "INTEGER").with_constraint("PRIMARY KEY"));
        children.schema.push(ColumnDef::new("parent_id", "INTEGER"));
        children.schema.push(ColumnDef::new("note", "TEXT"));
        children
            .constraints
            .push("FOREIGN KEY (\"parent_id\") REFERENCES \"parents\" (\"id\")".into());
        children.indexes.push(IndexDef {
            name: "idx_children_parent".into(),
            columns: "parent_id".into(),
            unique: false,
            condition: None,
        });
        children.views.push(ViewDef {
            name: "notes".into(),
            value: "SELECT note FROM children".into(),
        });
        children.values.push(row(&[
            ("id", CellValue::Integer(10)),
            ("parent_id", CellValue::Integer(1)),
            ("note", CellValue::from("it's; DROP TABLE parents")),
        ]));

        // children before parents: deferred foreign keys allow it
        doc.tables.push(children);
        doc.tables.push(parents);
        doc
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_full_import_creates_everything() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON; CREATE TABLE stale (x);")
            .unwrap();

        let report = import_document(&conn, &document()).unwrap();
        assert_eq!(report, ImportReport { tables: 2, rows: 2 });

        assert_eq!(count(&conn, "children"), 1);
        assert_eq!(count(&conn, "notes"), 1);
        assert!(conn.prepare("SELECT * FROM stale").is_err());
        assert_eq!(read_version(&conn).unwrap(), 3);
        assert!(sync::get_sync_date(&conn).unwrap() > 0);
        assert!(foreign_keys_enabled(&conn).unwrap());

        let note: String = conn
            .query_row("SELECT note FROM children", [], |r| r.get(0))
            .unwrap();
        assert_eq!(note, "it's; DROP TABLE parents");
    }

    #[test]
    fn test_invalid_document_touches_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE kept (x)").unwrap();

        let mut doc = document();
        doc.tables[0]
            .values
            .push(row(&[("undeclared", CellValue::Integer(1))]));

        let err = import_document(&conn, &doc).unwrap_err();
        assert!(matches!(err, StoreError::InvalidImport(_)));
        assert_eq!(count(&conn, "kept"), 0);
    }

    #[test]
    fn test_schema_failure_skips_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let mut doc = document();
        doc.tables[1].views.push(ViewDef {
            name: "broken".into(),
            value: "SELEKT nothing".into(),
        });

        assert!(import_document(&conn, &doc).is_err());
        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_row_failure_rolls_back_all_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let mut doc = document();
        doc.tables[1].values.push(row(&[("id", CellValue::Integer(1))]));

        assert!(import_document(&conn, &doc).is_err());
        assert_eq!(count(&conn, "parents"), 0);
        assert_eq!(count(&conn, "children"), 0);
    }

    #[test]
    fn test_partial_import_upserts() {
        let conn = Connection::open_in_memory().unwrap();
        import_document(&conn, &document()).unwrap();

        let mut update = JsonDatabase::new("shop", 3);
        update.mode = DocumentMode::Partial;
        let mut children = JsonTable::new("children");
        children.values.push(row(&[
            ("id", CellValue::Integer(10)),
            ("parent_id", CellValue::Integer(1)),
            ("note", CellValue::from("edited")),
        ]));
        update.tables.push(children);

        let report = import_document(&conn, &update).unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(count(&conn, "children"), 1);
        let note: String = conn
            .query_row("SELECT note FROM children WHERE id = 10", [], |r| r.get(0))
            .unwrap();
        assert_eq!(note, "edited");
    }

    #[test]
    fn test_partial_import_keeps_unsupplied_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, qty INTEGER DEFAULT 0);
             INSERT INTO items VALUES (1, 'bolt', 7);",
        )
        .unwrap();

        let mut update = JsonDatabase::new("shop", 1);
        update.mode = DocumentMode::Partial;
        let mut items = JsonTable::new("items");
        items.values.push(row(&[
            ("id", CellValue::Integer(1)),
            ("name", CellValue::from("nut")),
        ]));
        items.values.push(row(&[("ID", CellValue::Integer(1))]));
        items.values.push(row(&[
            ("id", CellValue::Integer(2)),
            ("name", CellValue::from("washer")),
        ]));
        update.tables.push(items);

        import_document(&conn, &update).unwrap();
        let first: (String, i64) = conn
            .query_row("SELECT name, qty FROM items WHERE id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(first, ("nut".to_string(), 7));
        let second: (String, i64) = conn
            .query_row("SELECT name, qty FROM items WHERE id = 2", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(second, ("washer".to_string(), 0));
    }

    #[test]
    fn test_partial_import_does_not_cascade_into_children() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parents (id INTEGER PRIMARY KEY, label TEXT);
             CREATE TABLE children (
                 id INTEGER PRIMARY KEY,
                 parent_id INTEGER REFERENCES parents (id) ON DELETE CASCADE
             );
             INSERT INTO parents VALUES (1, 'old');
             INSERT INTO children VALUES (10, 1), (11, 1);",
        )
        .unwrap();

        let mut update = JsonDatabase::new("shop", 1);
        update.mode = DocumentMode::Partial;
        let mut parents = JsonTable::new("parents");
        parents.values.push(row(&[
            ("id", CellValue::Integer(1)),
            ("label", CellValue::from("new")),
        ]));
        update.tables.push(parents);

        import_document(&conn, &update).unwrap();
        assert_eq!(count(&conn, "children"), 2);
        let label: String = conn
            .query_row("SELECT label FROM parents WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(label, "new");
    }
}
