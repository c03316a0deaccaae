//! The database lifecycle controller.
//!
//! [`Database`] owns at most one connection and orchestrates everything
//! else: key handling on open, guarded upgrades, explicit transactions,
//! statement execution, sync bookkeeping, JSON import/export and deletion.
//!
//! # Example
//!
//! ```no_run
//! use versioned_db_core::{DatabaseConfig, UpgradeStep};
//! use versioned_db_sqlite::{Database, ExportMode, LocalFileStore};
//!
//! let mut config = DatabaseConfig::new("inventory", 2);
//! config.upgrades.insert(1, UpgradeStep::new(["CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)"]));
//! config.upgrades.insert(2, UpgradeStep::new(["ALTER TABLE items ADD COLUMN qty INTEGER DEFAULT 0"]));
//!
//! let mut db = Database::builder(config)
//!     .files(LocalFileStore::new("/var/lib/app"))
//!     .build()
//!     .unwrap();
//!
//! db.open().unwrap();
//! db.execute("INSERT INTO items (name) VALUES ('bolt')", true).unwrap();
//! let doc = db.export_json(ExportMode::Full).unwrap();
//! println!("{}", doc.to_json_pretty().unwrap());
//! db.close().unwrap();
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};
use versioned_db_core::{
    BoundStatement, CellValue, DatabaseConfig, EncryptionMode, JsonDatabase, Row,
    validate_config,
};

use crate::backup::BackupGate;
use crate::cipher::{Cipher, NoCipher};
use crate::codec::{self, ExportMode, ImportReport};
use crate::error::{DeleteStep, Result, StoreError};
use crate::executor::{self, Executor, SetOutcome};
use crate::files::{FileStore, LocalFileStore};
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::sync;
use crate::upgrade::{UpgradeEngine, UpgradeReport, read_version};

/// Builder for a [`Database`].
///
/// Collaborators default to a [`LocalFileStore`] in the current directory,
/// [`NoCipher`] and an [`EnvSecretStore`].
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    files: Option<Box<dyn FileStore>>,
    cipher: Option<Box<dyn Cipher>>,
    secrets: Option<Box<dyn SecretStore>>,
}

impl DatabaseBuilder {
    /// Starts a builder for `config`.
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            files: None,
            cipher: None,
            secrets: None,
        }
    }

    /// Sets the file store.
    pub fn files(mut self, files: impl FileStore + 'static) -> Self {
        self.files = Some(Box::new(files));
        self
    }

    /// Sets the cipher.
    pub fn cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.cipher = Some(Box::new(cipher));
        self
    }

    /// Sets the secret store.
    pub fn secrets(mut self, secrets: impl SecretStore + 'static) -> Self {
        self.secrets = Some(Box::new(secrets));
        self
    }

    /// Validates the configuration and resolves the database path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] for an inconsistent
    /// configuration and [`StoreError::PathResolution`] if the file store
    /// cannot map the name to a path.
    pub fn build(self) -> Result<Database> {
        if let Some(err) = validate_config(&self.config).into_iter().next() {
            return Err(StoreError::InvalidConfig(err));
        }
        let files = self
            .files
            .unwrap_or_else(|| Box::new(LocalFileStore::new(".")));
        let path = files
            .resolve_path(&self.config.name)
            .ok_or_else(|| StoreError::PathResolution(self.config.name.clone()))?;

        Ok(Database {
            config: self.config,
            path,
            files,
            cipher: self.cipher.unwrap_or_else(|| Box::new(NoCipher)),
            secrets: self
                .secrets
                .unwrap_or_else(|| Box::new(EnvSecretStore::default())),
            conn: None,
            last_upgrade: None,
        })
    }
}

/// A versioned SQLite database and its single connection.
///
/// The connection is either present (open) or absent (closed); dropping
/// the controller closes it.
pub struct Database {
    config: DatabaseConfig,
    path: PathBuf,
    files: Box<dyn FileStore>,
    cipher: Box<dyn Cipher>,
    secrets: Box<dyn SecretStore>,
    conn: Option<Connection>,
    last_upgrade: Option<UpgradeReport>,
}

impl Database {
    /// Starts a [`DatabaseBuilder`].
    pub fn builder(config: DatabaseConfig) -> DatabaseBuilder {
        DatabaseBuilder::new(config)
    }

    /// The configuration this controller was built with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The database name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The resolved database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` while a connection is held.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns `true` if the database file exists.
    pub fn exists(&self) -> bool {
        self.files.exists(&self.config.name)
    }

    /// The report of the upgrade run by the most recent `open`, if any ran.
    pub fn last_upgrade(&self) -> Option<&UpgradeReport> {
        self.last_upgrade.as_ref()
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::NotOpen(self.config.name.clone()))
    }

    /// Opens the database, applying any pending upgrades.
    ///
    /// Opening an open database does nothing. Secret material is fetched
    /// only when the mode needs it. If the stored version is below the
    /// configured one, the file is snapshotted, the pending steps run, and
    /// the snapshot is discarded or restored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OpenFailed`] wrapping the cause. The database
    /// is closed afterwards. Use [`StoreError::is_unrecoverable`] to tell a
    /// rolled-back upgrade from a failed restore.
    pub fn open(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        match self.connect() {
            Ok(conn) => {
                self.conn = Some(conn);
                info!(name = %self.config.name, path = %self.path.display(), "database opened");
                Ok(())
            }
            Err(source) => Err(StoreError::OpenFailed {
                name: self.config.name.clone(),
                source: Box::new(source),
            }),
        }
    }

    /// Resolves the key for this open, encrypting or re-keying the file
    /// first when the mode asks for it.
    fn prepare_key(&mut self) -> Result<Option<String>> {
        if !self.config.requires_secret() {
            return Ok(None);
        }
        let exists = self.files.exists(&self.config.name);
        let key = match self.config.mode {
            EncryptionMode::NoEncryption => return Ok(None),
            EncryptionMode::Secret => self.secrets.secret()?,
            EncryptionMode::Encryption => {
                let secret = self.secrets.secret()?;
                if exists {
                    self.cipher.encrypt_database(&self.path, &secret)?;
                }
                secret
            }
            EncryptionMode::NewSecret if !self.secrets.has_new_secret() => {
                debug!(name = %self.config.name, "no pending secret, opening with current");
                self.secrets.secret()?
            }
            EncryptionMode::NewSecret => {
                let old = self.secrets.secret()?;
                let new = self.secrets.new_secret()?;
                if exists {
                    self.cipher.change_password(&self.path, &old, &new)?;
                }
                self.secrets.promote_new_secret()?;
                new
            }
        };
        Ok(Some(key))
    }

    fn connect(&mut self) -> Result<Connection> {
        let key = self.prepare_key()?;
        let fresh = !self.files.exists(&self.config.name);
        let conn = Connection::open(&self.path).map_err(StoreError::sql("open connection"))?;
        if let Some(key) = &key {
            self.cipher.apply_key(&conn, key)?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .map_err(StoreError::sql("enable foreign keys"))?;

        let stored = read_version(&conn)?;
        let mut engine = UpgradeEngine::new(&self.config.upgrades, self.config.version);
        if !engine.needs_upgrade(stored) {
            debug!(name = %self.config.name, version = stored, "schema is current");
            return Ok(conn);
        }

        let gate = BackupGate::new(self.files.as_ref(), &self.config.name).fresh(fresh);
        let (conn, report) = engine.run(conn, gate, stored)?;
        self.last_upgrade = Some(report);
        Ok(conn)
    }

    /// Closes the connection. Closing a closed database does nothing.
    ///
    /// # Errors
    ///
    /// If SQLite refuses to release the handle the connection is kept and
    /// the error is returned.
    pub fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        match conn.close() {
            Ok(()) => {
                info!(name = %self.config.name, "database closed");
                Ok(())
            }
            Err((conn, source)) => {
                self.conn = Some(conn);
                Err(StoreError::Sql {
                    operation: "close connection",
                    source,
                })
            }
        }
    }

    /// The stored schema version.
    pub fn version(&self) -> Result<i64> {
        read_version(self.conn()?)
    }

    /// Deletes the database file.
    ///
    /// A missing file is a no-op. Otherwise the database is opened (if it
    /// is not already), closed, and then removed.
    pub fn delete_database(&mut self) -> Result<()> {
        if !self.exists() {
            debug!(name = %self.config.name, "nothing to delete");
            return Ok(());
        }
        let fail = |name: &str, step, source| StoreError::Delete {
            name: name.to_string(),
            step,
            source: Box::new(source),
        };

        if !self.is_open() {
            self.open()
                .map_err(|e| fail(&self.config.name, DeleteStep::Open, e))?;
        }
        self.close()
            .map_err(|e| fail(&self.config.name, DeleteStep::Close, e))?;
        self.files.delete(&self.config.name).map_err(|source| {
            fail(
                &self.config.name,
                DeleteStep::Remove,
                StoreError::File {
                    operation: "delete",
                    name: self.config.name.clone(),
                    source,
                },
            )
        })?;
        info!(name = %self.config.name, "database deleted");
        Ok(())
    }

    /// Opens an explicit transaction scope.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotOpen`] when closed, [`StoreError::Transaction`] when
    /// a scope is already open.
    pub fn begin_transaction(&self) -> Result<()> {
        executor::begin(self.conn()?)
    }

    /// Commits the explicit scope; a no-op when closed or when no scope is
    /// open.
    pub fn commit_transaction(&self) -> Result<()> {
        match &self.conn {
            Some(conn) => executor::commit(conn),
            None => Ok(()),
        }
    }

    /// Rolls back the explicit scope; a no-op when closed or when no scope
    /// is open.
    pub fn rollback_transaction(&self) -> Result<()> {
        match &self.conn {
            Some(conn) => executor::rollback(conn),
            None => Ok(()),
        }
    }

    /// Runs a batch of statements; see [`Executor::execute_batch`].
    pub fn execute(&self, sql: &str, transactional: bool) -> Result<u64> {
        Executor::new(self.conn()?).execute_batch(sql, transactional)
    }

    /// Runs parameter-bound statements; see [`Executor::execute_set`].
    pub fn execute_set(&self, set: &[BoundStatement], transactional: bool) -> Result<SetOutcome> {
        Executor::new(self.conn()?).execute_set(set, transactional)
    }

    /// Runs one parameter-bound statement; see [`Executor::run`].
    pub fn run(&self, sql: &str, values: &[CellValue], transactional: bool) -> Result<SetOutcome> {
        Executor::new(self.conn()?).run(sql, values, transactional)
    }

    /// Runs a read-only query; see [`Executor::query_all`].
    pub fn query(&self, sql: &str, values: &[CellValue]) -> Result<Vec<Row>> {
        Executor::new(self.conn()?).query_all(sql, values)
    }

    /// Creates the sync table if needed; `1` on creation, `0` after.
    pub fn ensure_sync_table(&self) -> Result<u64> {
        sync::ensure_sync_table(self.conn()?)
    }

    /// Stores an RFC 3339 timestamp as the last sync date.
    pub fn set_sync_date(&self, iso: &str) -> Result<()> {
        sync::set_sync_date(self.conn()?, iso)
    }

    /// The last sync date in Unix seconds.
    pub fn get_sync_date(&self) -> Result<i64> {
        sync::get_sync_date(self.conn()?)
    }

    /// The last sync date as a UTC timestamp.
    pub fn sync_date_utc(&self) -> Result<DateTime<Utc>> {
        sync::sync_date_utc(self.conn()?)
    }

    /// Exports the database as a JSON document.
    pub fn export_json(&self, mode: ExportMode) -> Result<JsonDatabase> {
        codec::export_document(
            self.conn()?,
            &self.config.name,
            self.config.encrypted,
            mode,
        )
    }

    /// Imports a JSON document into the open database.
    pub fn import_json(&self, doc: &JsonDatabase) -> Result<ImportReport> {
        codec::import_document(self.conn()?, doc)
    }
}
