//! JSON import and export of whole databases.
//!
//! [`export_document`] introspects a live connection into a
//! [`JsonDatabase`](versioned_db_core::JsonDatabase);
//! [`import_document`] materializes one, schema first and rows second.
//! Both validate the document: export refuses to return a malformed
//! document, import refuses to touch the database with one.

mod ddl;
mod export;
mod import;

pub use export::{ExportMode, export_document};
pub use import::{ImportReport, import_document};

use crate::sync::SYNC_TABLE;

/// Column consulted by partial export.
pub const LAST_MODIFIED: &str = "last_modified";

/// Returns `true` for tables that belong in a document.
pub(crate) fn is_user_table(name: &str) -> bool {
    name != SYNC_TABLE && !name.to_ascii_lowercase().starts_with("sqlite_")
}
