//! SQLite lifecycle management for versioned embedded databases.
//!
//! This crate opens a (possibly encrypted) SQLite file, brings its schema
//! up to the configured version behind a snapshot, and moves whole
//! databases in and out of the JSON document model defined in
//! [`versioned_db_core`].
//!
//! # Architecture
//!
//! - **`executor`**: transactional statement execution ([`Executor`])
//! - **`backup`**: snapshot/restore around upgrades ([`BackupGate`])
//! - **`upgrade`**: ordered, guarded upgrade steps ([`UpgradeEngine`])
//! - **`codec`**: JSON export and import ([`export_document`], [`import_document`])
//! - **`sync`**: last-sync bookkeeping in `sync_table`
//! - **`database`**: the lifecycle controller ([`Database`])
//! - **`files`**, **`cipher`**, **`secrets`**: injected collaborators
//!
//! # Quick start
//!
//! ```no_run
//! use versioned_db_core::DatabaseConfig;
//! use versioned_db_sqlite::{Database, LocalFileStore};
//!
//! let config = DatabaseConfig::load("inventory.yaml").unwrap();
//! let mut db = Database::builder(config)
//!     .files(LocalFileStore::new("data"))
//!     .build()
//!     .unwrap();
//!
//! match db.open() {
//!     Ok(()) => println!("at version {}", db.version().unwrap()),
//!     Err(e) if e.is_unrecoverable() => eprintln!("restore failed, manual repair needed: {e}"),
//!     Err(e) => eprintln!("upgrade rolled back: {e}"),
//! }
//! ```
//!
//! # Logging
//!
//! Events are emitted through [`tracing`]. The crate never installs a
//! subscriber; binaries choose one.

mod backup;
mod cipher;
mod codec;
mod database;
mod error;
mod executor;
mod files;
mod secrets;
mod sync;
mod upgrade;

pub use backup::{BACKUP_PREFIX, BackupGate, backup_name};
pub use cipher::{Cipher, NoCipher, SqlCipher};
pub use codec::{ExportMode, ImportReport, LAST_MODIFIED, export_document, import_document};
pub use database::{Database, DatabaseBuilder};
pub use error::{DeleteStep, Result, StoreError, TransactionStage};
pub use executor::{Executor, SetOutcome, in_transaction};
pub use files::{FileStore, LocalFileStore};
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
pub use sync::{
    SYNC_TABLE, ensure_sync_table, get_sync_date, parse_sync_date, set_sync_date,
    set_sync_timestamp, sync_date_utc,
};
pub use upgrade::{UpgradeEngine, UpgradeReport, UpgradeState, read_version};
