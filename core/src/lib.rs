//! Core types for versioned embedded databases.
//!
//! This crate defines the engine-independent pieces shared by the storage
//! backend and the command-line tool:
//!
//! - [`JsonDatabase`]: a whole database (tables, columns, indexes,
//!   triggers, views, rows) as a JSON document.
//! - [`CellValue`]: a scalar cell, with binary data hex-encoded.
//! - [`DatabaseConfig`]: name, encryption mode, target version and the
//!   [`UpgradeTable`] of [`UpgradeStep`]s.
//!
//! Validation ([`validate_document`], [`validate_config`]) catches
//! structural errors such as duplicate tables, rows naming undeclared
//! columns, and upgrade steps outside the target range.
//!
//! # Example
//!
//! ```
//! use versioned_db_core::*;
//!
//! let mut doc = JsonDatabase::new("inventory", 1);
//! let mut items = JsonTable::new("items");
//! items.schema.push(ColumnDef::new("id", "INTEGER").with_constraint("PRIMARY KEY"));
//! items.schema.push(ColumnDef::new("name", "TEXT"));
//! let mut row = Row::new();
//! row.insert("id".into(), CellValue::Integer(1));
//! row.insert("name".into(), CellValue::from("bolt"));
//! items.values.push(row);
//! doc.tables.push(items);
//!
//! assert!(validate_document(&doc).is_empty());
//! assert_eq!(doc.row_count(), 1);
//! ```

mod config;
mod types;
mod validate;

pub use config::{
    BoundStatement, ConfigError, DatabaseConfig, EncryptionMode, UpgradeStep, UpgradeTable,
};
pub use types::*;
pub use validate::{ValidationError, validate_config, validate_document};

/// Parses a document and checks it against [`validate_document`].
///
/// Returns `false` for malformed JSON as well as for structurally invalid
/// documents.
///
/// # Examples
///
/// ```
/// use versioned_db_core::is_json_valid;
///
/// assert!(is_json_valid(r#"{"database": "db", "version": 1, "tables": []}"#));
/// assert!(!is_json_valid(r#"{"database": "", "version": 1}"#));
/// assert!(!is_json_valid("not json"));
/// ```
pub fn is_json_valid(raw: &str) -> bool {
    JsonDatabase::from_json(raw)
        .map(|doc| validate_document(&doc).is_empty())
        .unwrap_or(false)
}
