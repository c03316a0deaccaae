//! Document and configuration validation.
//!
//! Validates the structural invariants of a [`JsonDatabase`] before import
//! and after export, and of a [`DatabaseConfig`] before it is used to open a
//! database. Errors such as duplicate tables, rows naming undeclared
//! columns, or overlapping upgrade steps are caught here instead of
//! surfacing as SQL failures halfway through an import.
//!
//! # Examples
//!
//! ```
//! use versioned_db_core::*;
//!
//! let mut doc = JsonDatabase::new("inventory", 1);
//! let mut items = JsonTable::new("items");
//! items.schema.push(ColumnDef::new("id", "INTEGER"));
//! doc.tables.push(items);
//! assert!(validate_document(&doc).is_empty());
//!
//! // Invalid: duplicate table name
//! doc.tables.push(doc.tables[0].clone());
//! assert!(!validate_document(&doc).is_empty());
//! ```

use std::collections::HashSet;

use thiserror::Error;

use crate::{DatabaseConfig, DocumentMode, EncryptionMode, JsonDatabase, JsonTable};

/// Document/config validation errors.
///
/// Each variant describes a specific structural problem found during
/// validation. The `Display` impl provides a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Database name is empty or whitespace-only.
    #[error("database name cannot be empty")]
    EmptyDatabaseName,
    /// Schema version is below 1.
    #[error("version must be at least 1, got {0}")]
    InvalidVersion(i64),
    /// A table has an empty name.
    #[error("table name cannot be empty")]
    EmptyTableName,
    /// Two tables share a name.
    #[error("duplicate table: {0}")]
    DuplicateTable(String),
    /// A full-mode table declares no columns.
    #[error("table {0} declares no columns")]
    MissingColumns(String),
    /// A column has an empty name.
    #[error("table {0} has a column with an empty name")]
    EmptyColumnName(String),
    /// Two columns in the same table share a name.
    #[error("duplicate column {column} in table {table}")]
    DuplicateColumn { table: String, column: String },
    /// A row names a column the table does not declare.
    #[error("row {row} of table {table} references undeclared column {column}")]
    UnknownColumn {
        table: String,
        row: usize,
        column: String,
    },
    /// An index, trigger or view is missing its name.
    #[error("{kind} on table {table} has an empty name")]
    EmptyObjectName { kind: &'static str, table: String },
    /// Two indexes, triggers or views share a name.
    #[error("duplicate {kind}: {name}")]
    DuplicateObject { kind: &'static str, name: String },
    /// An index, trigger or view is missing its body.
    #[error("{kind} {name} has an empty definition")]
    EmptyDefinition { kind: &'static str, name: String },
    /// Two upgrade steps target the same version.
    #[error("duplicate upgrade step for version {0}")]
    DuplicateUpgrade(i64),
    /// An upgrade step targets a version outside `1..=version`.
    #[error("upgrade step version {step} is outside 1..={target}")]
    UpgradeOutOfRange { step: i64, target: i64 },
    /// An upgrade step has nothing to execute.
    #[error("upgrade step {0} has no statements")]
    EmptyUpgrade(i64),
    /// An unencrypted database was configured with an encryption mode.
    #[error("mode {0} requires encrypted = true")]
    ModeRequiresEncryption(&'static str),
}

/// Validates a JSON database document.
///
/// Checks the database name and version, then each table in order.
/// Validation stops at the first table that fails, mirroring the way an
/// import would stop at the first failing statement.
///
/// # Examples
///
/// ```
/// use versioned_db_core::*;
///
/// let mut doc = JsonDatabase::new("db", 1);
/// let mut t = JsonTable::new("t");
/// t.schema.push(ColumnDef::new("a", "TEXT"));
/// let mut row = Row::new();
/// row.insert("b".into(), CellValue::Null);
/// t.values.push(row);
/// doc.tables.push(t);
///
/// let errors = validate_document(&doc);
/// assert!(matches!(errors[0], ValidationError::UnknownColumn { .. }));
/// ```
pub fn validate_document(doc: &JsonDatabase) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if doc.database.trim().is_empty() {
        errors.push(ValidationError::EmptyDatabaseName);
        return errors;
    }
    if doc.version < 1 {
        errors.push(ValidationError::InvalidVersion(doc.version));
        return errors;
    }

    let mut seen_tables: HashSet<String> = HashSet::new();
    let mut seen_objects: HashSet<(&'static str, String)> = HashSet::new();

    for table in &doc.tables {
        let name = table.name.trim();
        if name.is_empty() {
            errors.push(ValidationError::EmptyTableName);
            return errors;
        }
        if !seen_tables.insert(identifier_key(name)) {
            errors.push(ValidationError::DuplicateTable(name.to_string()));
            return errors;
        }

        errors.extend(validate_table(table, doc.mode));
        if !errors.is_empty() {
            return errors;
        }

        errors.extend(validate_objects(table, &mut seen_objects));
        if !errors.is_empty() {
            return errors;
        }
    }

    errors
}

/// SQLite compares identifiers case-insensitively (ASCII only).
fn identifier_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn validate_table(table: &JsonTable, mode: DocumentMode) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if table.schema.is_empty() {
        // Partial documents may carry rows for tables that already exist.
        if mode == DocumentMode::Full {
            errors.push(ValidationError::MissingColumns(table.name.clone()));
        }
        return errors;
    }

    let mut columns: HashSet<String> = HashSet::new();
    for col in &table.schema {
        let column = col.column.trim();
        if column.is_empty() {
            errors.push(ValidationError::EmptyColumnName(table.name.clone()));
            return errors;
        }
        if !columns.insert(identifier_key(column)) {
            errors.push(ValidationError::DuplicateColumn {
                table: table.name.clone(),
                column: column.to_string(),
            });
            return errors;
        }
    }

    for (index, row) in table.values.iter().enumerate() {
        if let Some(unknown) = row.keys().find(|key| !columns.contains(&identifier_key(key))) {
            errors.push(ValidationError::UnknownColumn {
                table: table.name.clone(),
                row: index,
                column: unknown.clone(),
            });
            return errors;
        }
    }

    errors
}

fn validate_objects(
    table: &JsonTable,
    seen: &mut HashSet<(&'static str, String)>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let indexes = table
        .indexes
        .iter()
        .map(|i| ("index", i.name.as_str(), i.columns.as_str()));
    let triggers = table
        .triggers
        .iter()
        .map(|t| ("trigger", t.name.as_str(), t.logic.as_str()));
    let views = table
        .views
        .iter()
        .map(|v| ("view", v.name.as_str(), v.value.as_str()));

    for (kind, name, body) in indexes.chain(triggers).chain(views) {
        let name = name.trim();
        if name.is_empty() {
            errors.push(ValidationError::EmptyObjectName {
                kind,
                table: table.name.clone(),
            });
            return errors;
        }
        if !seen.insert((kind, identifier_key(name))) {
            errors.push(ValidationError::DuplicateObject {
                kind,
                name: name.to_string(),
            });
            return errors;
        }
        if body.trim().is_empty() {
            errors.push(ValidationError::EmptyDefinition {
                kind,
                name: name.to_string(),
            });
            return errors;
        }
    }

    for trigger in &table.triggers {
        if trigger.timeevent.trim().is_empty() {
            errors.push(ValidationError::EmptyDefinition {
                kind: "trigger",
                name: trigger.name.clone(),
            });
            return errors;
        }
    }

    errors
}

/// Validates a database configuration.
///
/// Checks the name, the target version, the encryption mode, and that every
/// upgrade step targets a distinct version in `1..=version` and has at
/// least one statement.
///
/// # Examples
///
/// ```
/// use versioned_db_core::*;
///
/// let mut config = DatabaseConfig::new("app", 2);
/// config.upgrades.insert(1, UpgradeStep::new(["CREATE TABLE a (id INTEGER)"]));
/// assert!(validate_config(&config).is_empty());
///
/// config.upgrades.insert(3, UpgradeStep::new(["CREATE TABLE b (id INTEGER)"]));
/// assert_eq!(
///     validate_config(&config),
///     vec![ValidationError::UpgradeOutOfRange { step: 3, target: 2 }]
/// );
/// ```
pub fn validate_config(config: &DatabaseConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(ValidationError::EmptyDatabaseName);
        return errors;
    }
    if config.version < 1 {
        errors.push(ValidationError::InvalidVersion(config.version));
        return errors;
    }
    if !config.encrypted && config.mode != EncryptionMode::NoEncryption {
        errors.push(ValidationError::ModeRequiresEncryption(config.mode.as_str()));
        return errors;
    }

    for (&step, upgrade) in config.upgrades.iter() {
        if step < 1 || step > config.version {
            errors.push(ValidationError::UpgradeOutOfRange {
                step,
                target: config.version,
            });
            return errors;
        }
        if upgrade.is_empty() {
            errors.push(ValidationError::EmptyUpgrade(step));
            return errors;
        }
    }

    errors
}
