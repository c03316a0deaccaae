use std::fmt;
use std::str::FromStr;

use rusqlite::Connection;
use tracing::{info, warn};
use versioned_db_core::{
    CellValue, ColumnDef, DocumentMode, JsonDatabase, JsonTable, Row, quote_ident,
    validate_document,
};

use super::{LAST_MODIFIED, ddl, is_user_table};
use crate::error::{Result, StoreError};
use crate::executor::Executor;
use crate::sync::stored_sync_date;
use crate::upgrade::read_version;

/// What an export includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportMode {
    /// Schema and every row.
    #[default]
    Full,
    /// Schema only; tables carry no rows.
    SchemaOnly,
    /// Schema plus rows modified since the last sync.
    Partial,
}

impl ExportMode {
    /// Returns the command-line name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportMode::Full => "full",
            ExportMode::SchemaOnly => "schema-only",
            ExportMode::Partial => "partial",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(ExportMode::Full),
            "schema-only" | "schema" => Ok(ExportMode::SchemaOnly),
            "partial" => Ok(ExportMode::Partial),
            other => Err(format!(
                "unknown export mode '{other}' (expected full, schema-only or partial)"
            )),
        }
    }
}

struct MasterEntry {
    kind: String,
    name: String,
    table: String,
    sql: Option<String>,
}

fn master_entries(conn: &Connection) -> Result<Vec<MasterEntry>> {
    let mut stmt = conn
        .prepare("SELECT type, name, tbl_name, sql FROM sqlite_master ORDER BY rowid")
        .map_err(StoreError::sql("read schema"))?;
    let entries = stmt
        .query_map([], |row| {
            Ok(MasterEntry {
                kind: row.get(0)?,
                name: row.get(1)?,
                table: row.get(2)?,
                sql: row.get(3)?,
            })
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(StoreError::sql("read schema"))?;
    Ok(entries)
}

struct ColumnInfo {
    name: String,
    declared_type: String,
    not_null: bool,
    default: Option<String>,
    pk: i64,
    /// 0 for ordinary columns, 1 for hidden virtual-table columns, 2 or 3
    /// for generated columns.
    hidden: i64,
}

impl ColumnInfo {
    fn is_generated(&self) -> bool {
        matches!(self.hidden, 2 | 3)
    }
}

fn column_info(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare("SELECT * FROM pragma_table_xinfo(?1) WHERE hidden <> 1 ORDER BY cid")
        .map_err(StoreError::sql("read table info"))?;
    stmt.query_map([table], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            declared_type: row.get(2)?,
            not_null: row.get(3)?,
            default: row.get(4)?,
            pk: row.get(5)?,
            hidden: row.get(6)?,
        })
    })
    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
    .map_err(StoreError::sql("read table info"))
}

fn quoted_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

fn unique_constraints(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut list = conn
        .prepare("SELECT name, origin FROM pragma_index_list(?1)")
        .map_err(StoreError::sql("read index list"))?;
    let mut names = list
        .query_map([table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(StoreError::sql("read index list"))?
        .into_iter()
        .filter(|(_, origin)| origin == "u")
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    names.sort();

    let mut info = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .map_err(StoreError::sql("read index info"))?;
    let mut constraints = Vec::with_capacity(names.len());
    for index in names {
        let columns = info
            .query_map([&index], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(StoreError::sql("read index info"))?;
        constraints.push(format!(
            "UNIQUE ({})",
            quoted_list(columns.iter().map(String::as_str))
        ));
    }
    Ok(constraints)
}

struct ForeignKeyPart {
    id: i64,
    parent: String,
    from: String,
    to: Option<String>,
    on_update: String,
    on_delete: String,
}

fn foreign_key_constraints(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT * FROM pragma_foreign_key_list(?1) ORDER BY id, seq")
        .map_err(StoreError::sql("read foreign keys"))?;
    let parts = stmt
        .query_map([table], |row| {
            Ok(ForeignKeyPart {
                id: row.get(0)?,
                parent: row.get(2)?,
                from: row.get(3)?,
                to: row.get(4)?,
                on_update: row.get(5)?,
                on_delete: row.get(6)?,
            })
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(StoreError::sql("read foreign keys"))?;

    let mut constraints = Vec::new();
    for group in parts.chunk_by(|a, b| a.id == b.id) {
        let first = &group[0];
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            quoted_list(group.iter().map(|p| p.from.as_str())),
            quote_ident(&first.parent)
        );
        let targets: Option<Vec<&str>> = group.iter().map(|p| p.to.as_deref()).collect();
        if let Some(targets) = targets {
            sql.push_str(&format!(" ({})", quoted_list(targets)));
        }
        for (action, rule) in [("UPDATE", &first.on_update), ("DELETE", &first.on_delete)] {
            if !rule.eq_ignore_ascii_case("NO ACTION") {
                sql.push_str(&format!(" ON {action} {rule}"));
            }
        }
        constraints.push(sql);
    }
    Ok(constraints)
}

/// A table descriptor (without rows) and the columns that hold stored data.
struct DescribedTable {
    table: JsonTable,
    stored: Vec<String>,
}

/// Builds a table descriptor from schema introspection plus the clauses
/// only the `CREATE TABLE` text records.
fn describe_table(conn: &Connection, name: &str, create_sql: &str) -> Result<DescribedTable> {
    let columns = column_info(conn, name)?;
    let pk_count = columns.iter().filter(|c| c.pk > 0).count();
    let autoincrement = ddl::find_keyword(create_sql, "AUTOINCREMENT", 0).is_some();
    let mut clauses = ddl::parse_table(create_sql).unwrap_or_default();

    let mut table = JsonTable::new(name);
    let mut pk_columns: Vec<(i64, &str)> = Vec::new();
    for col in &columns {
        let mut def = ColumnDef::new(col.name.as_str(), col.declared_type.as_str());
        if col.pk > 0 {
            if pk_count == 1 {
                def = def.with_constraint(if autoincrement {
                    "PRIMARY KEY AUTOINCREMENT"
                } else {
                    "PRIMARY KEY"
                });
            }
            pk_columns.push((col.pk, col.name.as_str()));
        }
        if col.not_null {
            def = def.with_constraint("NOT NULL");
        }
        if let Some(default) = &col.default {
            def = def.with_constraint(ddl::default_clause(default));
        }
        if let Some(extra) = clauses.columns.remove(&col.name.to_ascii_lowercase()) {
            def.constraints.extend(extra);
        }
        table.schema.push(def);
    }

    if pk_count > 1 {
        pk_columns.sort_by_key(|(seq, _)| *seq);
        table.constraints.push(format!(
            "PRIMARY KEY ({})",
            quoted_list(pk_columns.iter().map(|(_, name)| *name))
        ));
    }
    table.constraints.extend(unique_constraints(conn, name)?);
    table.constraints.extend(foreign_key_constraints(conn, name)?);
    table.constraints.append(&mut clauses.checks);
    table.options = clauses.options;

    let stored = columns
        .iter()
        .filter(|c| !c.is_generated())
        .map(|c| c.name.clone())
        .collect();
    Ok(DescribedTable { table, stored })
}

fn table_rows(
    conn: &Connection,
    table: &JsonTable,
    stored: &[String],
    since: Option<i64>,
) -> Result<Vec<Row>> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        quoted_list(stored.iter().map(String::as_str)),
        quote_ident(&table.name)
    );
    let mut params = Vec::new();
    if let Some(since) = since.filter(|_| table.has_column(LAST_MODIFIED)) {
        sql.push_str(&format!(" WHERE {} > ?1", quote_ident(LAST_MODIFIED)));
        params.push(CellValue::Integer(since));
    }
    Executor::new(conn).query_all(&sql, &params)
}

/// Exports the connected database as a document.
///
/// Tables come out in creation order with rows in the engine's natural
/// order. The sync-metadata table and SQLite-internal tables are skipped.
/// A database that was never versioned is exported as version 1.
///
/// # Errors
///
/// Returns [`StoreError::InvalidExport`] if the result fails document
/// validation, or the underlying SQL error if introspection fails.
pub fn export_document(
    conn: &Connection,
    database: &str,
    encrypted: bool,
    mode: ExportMode,
) -> Result<JsonDatabase> {
    let since = match mode {
        ExportMode::Partial => Some(stored_sync_date(conn)?.unwrap_or(0)),
        ExportMode::Full | ExportMode::SchemaOnly => None,
    };
    let entries = master_entries(conn)?;

    let mut doc = JsonDatabase::new(database, read_version(conn)?.max(1));
    doc.encrypted = encrypted;
    if mode == ExportMode::Partial {
        doc.mode = DocumentMode::Partial;
    }

    for entry in entries
        .iter()
        .filter(|e| e.kind == "table" && is_user_table(&e.name))
    {
        let DescribedTable { mut table, stored } =
            describe_table(conn, &entry.name, entry.sql.as_deref().unwrap_or(""))?;
        for object in entries.iter().filter(|e| e.table == entry.name) {
            let Some(sql) = object.sql.as_deref() else {
                continue;
            };
            match object.kind.as_str() {
                "index" => table.indexes.extend(ddl::parse_index(&object.name, sql)),
                "trigger" => table.triggers.extend(ddl::parse_trigger(&object.name, sql)),
                _ => {}
            }
        }
        if mode != ExportMode::SchemaOnly {
            table.values = table_rows(conn, &table, &stored, since)?;
        }
        doc.tables.push(table);
    }

    for entry in entries.iter().filter(|e| e.kind == "view") {
        let Some(view) = entry
            .sql
            .as_deref()
            .and_then(|sql| ddl::parse_view(&entry.name, sql))
        else {
            continue;
        };
        let owner = doc
            .tables
            .iter()
            .position(|t| ddl::mentions(&view.value, &t.name))
            .or_else(|| doc.tables.len().checked_sub(1));
        match owner {
            Some(i) => doc.tables[i].views.push(view),
            None => warn!(view = %entry.name, "no table to attach view to, skipped"),
        }
    }

    let errors = validate_document(&doc);
    if !errors.is_empty() {
        return Err(StoreError::InvalidExport(errors));
    }
    info!(
        database,
        %mode,
        tables = doc.tables.len(),
        rows = doc.row_count(),
        "exported document"
    );
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE owners (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
             CREATE TABLE items (
                 id INTEGER PRIMARY KEY,
                 owner_id INTEGER REFERENCES owners(id) ON DELETE CASCADE,
                 name TEXT NOT NULL DEFAULT 'unnamed',
                 data BLOB,
                 last_modified INTEGER
             );
             CREATE INDEX idx_items_name ON items (name);
             CREATE TRIGGER items_touch AFTER UPDATE ON items BEGIN
                 UPDATE items SET last_modified = 0 WHERE id = NEW.id;
             END;
             CREATE VIEW item_names AS SELECT name FROM items;
             CREATE TABLE sync_table (id INTEGER PRIMARY KEY, sync_date INTEGER);
             INSERT INTO sync_table VALUES (1, 100);
             INSERT INTO owners (name) VALUES ('ann');
             INSERT INTO items VALUES (1, 1, 'old', x'00ff', 50);
             INSERT INTO items VALUES (2, 1, 'new', NULL, 150);
             PRAGMA user_version = 4;",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_full_export_describes_schema() {
        let conn = sample();
        let doc = export_document(&conn, "shop", false, ExportMode::Full).unwrap();

        assert_eq!(doc.version, 4);
        let names: Vec<&str> = doc.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["owners", "items"]);

        let owners = doc.table("owners").unwrap();
        assert_eq!(owners.schema[0].constraints, vec!["PRIMARY KEY AUTOINCREMENT"]);
        assert_eq!(owners.constraints, vec!["UNIQUE (\"name\")"]);

        let items = doc.table("items").unwrap();
        assert_eq!(items.schema[2].constraints, vec!["NOT NULL", "DEFAULT 'unnamed'"]);
        assert_eq!(
            items.constraints,
            vec!["FOREIGN KEY (\"owner_id\") REFERENCES \"owners\" (\"id\") ON DELETE CASCADE"]
        );
        assert_eq!(items.indexes[0].name, "idx_items_name");
        assert_eq!(items.triggers[0].timeevent, "AFTER UPDATE");
        assert_eq!(items.views[0].name, "item_names");
        assert_eq!(items.values.len(), 2);
        assert_eq!(items.values[0]["data"], CellValue::Blob(vec![0x00, 0xff]));
    }

    #[test]
    fn test_schema_only_export_has_no_rows() {
        let conn = sample();
        let doc = export_document(&conn, "shop", false, ExportMode::SchemaOnly).unwrap();
        assert_eq!(doc.row_count(), 0);
        assert_eq!(doc.tables.len(), 2);
    }

    #[test]
    fn test_partial_export_filters_by_sync_date() {
        let conn = sample();
        let doc = export_document(&conn, "shop", false, ExportMode::Partial).unwrap();
        assert_eq!(doc.mode, DocumentMode::Partial);

        let items = doc.table("items").unwrap();
        assert_eq!(items.values.len(), 1);
        assert_eq!(items.values[0]["name"], CellValue::Text("new".into()));
        // no last_modified column: every row
        assert_eq!(doc.table("owners").unwrap().values.len(), 1);
    }

    #[test]
    fn test_unversioned_database_exports_as_version_one() {
        let conn = Connection::open_in_memory().unwrap();
        let doc = export_document(&conn, "empty", false, ExportMode::Full).unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.tables.is_empty());
    }

    #[test]
    fn test_export_skips_generated_column_values() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (a INTEGER, b INTEGER GENERATED ALWAYS AS (a * 2) VIRTUAL);
             INSERT INTO t (a) VALUES (3);",
        )
        .unwrap();

        let doc = export_document(&conn, "gen", false, ExportMode::Full).unwrap();
        let t = doc.table("t").unwrap();
        assert_eq!(t.schema.len(), 2);
        assert_eq!(
            t.schema[1].constraints,
            vec!["GENERATED ALWAYS AS (a * 2) VIRTUAL"]
        );
        assert_eq!(t.values.len(), 1);
        assert_eq!(t.values[0].len(), 1);
        assert_eq!(t.values[0]["a"], CellValue::Integer(3));
    }

    #[test]
    fn test_export_keeps_checks_collations_and_options() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE kv (
                 k TEXT PRIMARY KEY COLLATE NOCASE,
                 v INTEGER CHECK (v > 0),
                 CHECK (length(k) < 64)
             ) WITHOUT ROWID;",
        )
        .unwrap();

        let doc = export_document(&conn, "kv", false, ExportMode::SchemaOnly).unwrap();
        let kv = doc.table("kv").unwrap();
        let key = &kv.schema[0].constraints;
        assert_eq!(key.first().map(String::as_str), Some("PRIMARY KEY"));
        assert_eq!(key.last().map(String::as_str), Some("COLLATE NOCASE"));
        assert_eq!(kv.schema[1].constraints, vec!["CHECK (v > 0)"]);
        assert_eq!(kv.constraints, vec!["CHECK (length(k) < 64)"]);
        assert_eq!(kv.options, vec!["WITHOUT ROWID"]);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("schema-only".parse::<ExportMode>().unwrap(), ExportMode::SchemaOnly);
        assert!("everything".parse::<ExportMode>().is_err());
    }
}
