//! JSON document types for whole-database import and export.
//!
//! This module defines the engine-independent representation of a
//! relational database: its tables, column definitions, indexes, triggers,
//! views and row data. The types are designed for serialization with
//! [`serde`] and round-trip through JSON without loss.
//!
//! The serialized shape is:
//!
//! ```json
//! {
//!   "database": "inventory",
//!   "version": 2,
//!   "encrypted": false,
//!   "mode": "full",
//!   "tables": [{
//!     "name": "items",
//!     "schema": [{ "column": "id", "type": "INTEGER", "constraints": ["PRIMARY KEY"] }],
//!     "indexes": [],
//!     "triggers": [],
//!     "views": [],
//!     "values": [{ "id": 1 }]
//!   }]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single row: column name to scalar value.
pub type Row = BTreeMap<String, CellValue>;

/// How a document is applied on import.
///
/// # Examples
///
/// ```
/// use versioned_db_core::DocumentMode;
///
/// assert_eq!(DocumentMode::default(), DocumentMode::Full);
/// assert_eq!(serde_json::to_string(&DocumentMode::Partial).unwrap(), "\"partial\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentMode {
    /// Replace every user table with the document contents (the default).
    #[default]
    Full,
    /// Create missing tables and upsert rows into existing ones.
    Partial,
}

impl DocumentMode {
    /// Returns the serialized name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentMode::Full => "full",
            DocumentMode::Partial => "partial",
        }
    }
}

/// A scalar cell value.
///
/// Serialized untagged: `null`, a JSON integer, a JSON float, a JSON string,
/// or `{"blob": "<hex>"}` for binary data.
///
/// # Examples
///
/// ```
/// use versioned_db_core::CellValue;
///
/// let blob = CellValue::Blob(vec![0xde, 0xad]);
/// assert_eq!(serde_json::to_string(&blob).unwrap(), r#"{"blob":"dead"}"#);
///
/// let parsed: CellValue = serde_json::from_str("42").unwrap();
/// assert_eq!(parsed, CellValue::Integer(42));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary data, hex-encoded in JSON.
    Blob(#[serde(with = "blob_hex")] Vec<u8>),
}

impl CellValue {
    /// Returns `true` for [`CellValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Integer(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Real(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<Vec<u8>> for CellValue {
    fn from(value: Vec<u8>) -> Self {
        CellValue::Blob(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(CellValue::Null, Into::into)
    }
}

mod blob_hex {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Blob {
        blob: String,
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        Blob {
            blob: hex::encode(bytes),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let Blob { blob } = Blob::deserialize(deserializer)?;
        hex::decode(blob).map_err(D::Error::custom)
    }
}

/// A column definition: name, declared type, and column constraints.
///
/// # Examples
///
/// ```
/// use versioned_db_core::ColumnDef;
///
/// let id = ColumnDef::new("id", "INTEGER").with_constraint("PRIMARY KEY");
/// assert_eq!(id.to_sql(), "\"id\" INTEGER PRIMARY KEY");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub column: String,
    /// Declared type as written in the DDL (may be empty).
    #[serde(rename = "type", default)]
    pub declared_type: String,
    /// Column constraints, e.g. `NOT NULL`, `DEFAULT 0`, `PRIMARY KEY`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

impl ColumnDef {
    /// Creates a column with no constraints.
    pub fn new(column: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            declared_type: declared_type.into(),
            constraints: Vec::new(),
        }
    }

    /// Appends a constraint.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Renders the column as it appears inside `CREATE TABLE (...)`.
    pub fn to_sql(&self) -> String {
        let mut sql = quote_ident(&self.column);
        if !self.declared_type.trim().is_empty() {
            sql.push(' ');
            sql.push_str(self.declared_type.trim());
        }
        for constraint in &self.constraints {
            sql.push(' ');
            sql.push_str(constraint.trim());
        }
        sql
    }
}

/// An index over one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name (unique across the database).
    pub name: String,
    /// Indexed column list as written, e.g. `name DESC, qty`.
    pub columns: String,
    /// Whether this is a `UNIQUE` index.
    #[serde(default)]
    pub unique: bool,
    /// `WHERE` clause of a partial index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A trigger attached to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Trigger name (unique across the database).
    pub name: String,
    /// Timing and event, e.g. `AFTER UPDATE OF qty`.
    pub timeevent: String,
    /// Optional `WHEN` condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Statements between `BEGIN` and `END`.
    pub logic: String,
}

/// A view, stored alongside the table it reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDef {
    /// View name (unique across the database).
    pub name: String,
    /// The `SELECT` statement the view is defined as.
    pub value: String,
}

/// One table of a [`JsonDatabase`].
///
/// # Examples
///
/// ```
/// use versioned_db_core::{CellValue, ColumnDef, JsonTable, Row};
///
/// let mut table = JsonTable::new("items");
/// table.schema.push(ColumnDef::new("id", "INTEGER").with_constraint("PRIMARY KEY"));
/// table.schema.push(ColumnDef::new("name", "TEXT"));
///
/// let mut row = Row::new();
/// row.insert("id".into(), CellValue::Integer(1));
/// row.insert("name".into(), CellValue::from("bolt"));
/// table.values.push(row);
///
/// assert!(table.has_column("name"));
/// assert_eq!(table.values.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonTable {
    /// Table name.
    pub name: String,
    /// Column definitions in declaration order.
    #[serde(default)]
    pub schema: Vec<ColumnDef>,
    /// Table-level constraints, e.g. `PRIMARY KEY (a, b)` or `FOREIGN KEY ...`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    /// Table options written after the column list, e.g. `WITHOUT ROWID`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Indexes on this table.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Triggers on this table.
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    /// Views associated with this table.
    #[serde(default)]
    pub views: Vec<ViewDef>,
    /// Row data in table order.
    #[serde(default)]
    pub values: Vec<Row>,
}

impl JsonTable {
    /// Creates an empty table descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Vec::new(),
            constraints: Vec::new(),
            options: Vec::new(),
            indexes: Vec::new(),
            triggers: Vec::new(),
            views: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Returns `true` if the table declares a column with the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.schema.iter().any(|c| c.column == name)
    }

    /// Renders `CREATE TABLE IF NOT EXISTS` for this table.
    ///
    /// Returns `None` when the table declares no columns.
    pub fn create_sql(&self) -> Option<String> {
        if self.schema.is_empty() {
            return None;
        }
        let mut parts: Vec<String> = self.schema.iter().map(ColumnDef::to_sql).collect();
        parts.extend(self.constraints.iter().map(|c| c.trim().to_string()));
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            parts.join(", ")
        );
        let options: Vec<&str> = self
            .options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .collect();
        if !options.is_empty() {
            sql.push(' ');
            sql.push_str(&options.join(", "));
        }
        sql.push(';');
        Some(sql)
    }
}

/// A whole database as a JSON document.
///
/// # Examples
///
/// ```
/// use versioned_db_core::{DocumentMode, JsonDatabase, JsonTable};
///
/// let mut doc = JsonDatabase::new("inventory", 2);
/// doc.tables.push(JsonTable::new("items"));
/// assert_eq!(doc.mode, DocumentMode::Full);
/// assert!(doc.table("items").is_some());
///
/// let raw = doc.to_json_pretty().unwrap();
/// let parsed = JsonDatabase::from_json(&raw).unwrap();
/// assert_eq!(parsed, doc);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDatabase {
    /// Database name.
    pub database: String,
    /// Schema version the document was taken at.
    pub version: i64,
    /// Whether the source database is encrypted.
    #[serde(default)]
    pub encrypted: bool,
    /// How the document is applied on import.
    #[serde(default)]
    pub mode: DocumentMode,
    /// Tables in document order.
    #[serde(default)]
    pub tables: Vec<JsonTable>,
}

impl JsonDatabase {
    /// Creates an empty full-mode document.
    pub fn new(database: impl Into<String>, version: i64) -> Self {
        Self {
            database: database.into(),
            version,
            encrypted: false,
            mode: DocumentMode::Full,
            tables: Vec::new(),
        }
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&JsonTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Parses a document from JSON text without validating it.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Serializes the document as indented JSON.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Total number of rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.values.len()).sum()
    }
}

/// Quotes an SQL identifier with double quotes, doubling embedded quotes.
///
/// # Examples
///
/// ```
/// use versioned_db_core::quote_ident;
///
/// assert_eq!(quote_ident("items"), "\"items\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
