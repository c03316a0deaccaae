//! Encryption collaborator.
//!
//! The controller never encrypts anything itself; it asks a [`Cipher`] to
//! key a connection, to encrypt a plain file in place, or to re-key a file.
//! [`SqlCipher`] drives the SQLCipher pragmas and needs a SQLCipher-linked
//! SQLite; [`NoCipher`] refuses every request.

use std::fs;
use std::path::Path;

use rusqlite::{Connection, ErrorCode};
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Encryption operations on database files and connections.
pub trait Cipher {
    /// Keys a freshly opened connection with `password`.
    fn apply_key(&self, conn: &Connection, password: &str) -> Result<()>;

    /// Encrypts the plain database at `path` in place. Already encrypted
    /// files are left alone.
    fn encrypt_database(&self, path: &Path, password: &str) -> Result<()>;

    /// Re-keys the encrypted database at `path` from `old` to `new`.
    fn change_password(&self, path: &Path, old: &str, new: &str) -> Result<()>;
}

/// Refuses every encryption request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCipher;

impl Cipher for NoCipher {
    fn apply_key(&self, _conn: &Connection, _password: &str) -> Result<()> {
        Err(unsupported())
    }

    fn encrypt_database(&self, _path: &Path, _password: &str) -> Result<()> {
        Err(unsupported())
    }

    fn change_password(&self, _path: &Path, _old: &str, _new: &str) -> Result<()> {
        Err(unsupported())
    }
}

fn unsupported() -> StoreError {
    StoreError::Cipher("encryption is not available in this build".to_string())
}

/// SQLCipher pragmas: `key`, `rekey` and `sqlcipher_export`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlCipher;

impl SqlCipher {
    fn check_readable(conn: &Connection) -> rusqlite::Result<()> {
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn is_not_a_database(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::NotADatabase))
}

fn cipher_err(context: &str) -> impl FnOnce(rusqlite::Error) -> StoreError + '_ {
    move |e| StoreError::Cipher(format!("{context}: {e}"))
}

impl Cipher for SqlCipher {
    fn apply_key(&self, conn: &Connection, password: &str) -> Result<()> {
        conn.execute_batch(&format!("PRAGMA key = {}", quote_literal(password)))
            .map_err(cipher_err("set key"))?;
        Self::check_readable(conn).map_err(|e| {
            if is_not_a_database(&e) {
                StoreError::Cipher("wrong secret or file is not encrypted".to_string())
            } else {
                cipher_err("verify key")(e)
            }
        })
    }

    fn encrypt_database(&self, path: &Path, password: &str) -> Result<()> {
        if !path.is_file() {
            debug!(path = %path.display(), "nothing to encrypt");
            return Ok(());
        }

        let conn = Connection::open(path).map_err(cipher_err("open plain database"))?;
        match Self::check_readable(&conn) {
            Ok(()) => {}
            Err(e) if is_not_a_database(&e) => {
                debug!(path = %path.display(), "database already encrypted");
                return Ok(());
            }
            Err(e) => return Err(cipher_err("read plain database")(e)),
        }

        let target = path.with_extension("encrypting");
        let target_str = target.to_string_lossy().into_owned();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(cipher_err("read version"))?;
        conn.execute(
            "ATTACH DATABASE ?1 AS encrypted KEY ?2",
            [target_str.as_str(), password],
        )
        .map_err(cipher_err("attach encrypted copy"))?;
        conn.query_row("SELECT sqlcipher_export('encrypted')", [], |_| Ok(()))
            .map_err(cipher_err("export to encrypted copy (is SQLite linked against SQLCipher?)"))?;
        conn.execute_batch(&format!("PRAGMA encrypted.user_version = {version}"))
            .map_err(cipher_err("stamp version"))?;
        conn.execute_batch("DETACH DATABASE encrypted")
            .map_err(cipher_err("detach encrypted copy"))?;
        conn.close()
            .map_err(|(_, e)| cipher_err("close plain database")(e))?;

        fs::rename(&target, path).map_err(|source| StoreError::File {
            operation: "replace with encrypted copy",
            name: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "database encrypted");
        Ok(())
    }

    fn change_password(&self, path: &Path, old: &str, new: &str) -> Result<()> {
        let conn = Connection::open(path).map_err(cipher_err("open encrypted database"))?;
        self.apply_key(&conn, old)?;
        conn.execute_batch(&format!("PRAGMA rekey = {}", quote_literal(new)))
            .map_err(cipher_err("rekey"))?;
        info!(path = %path.display(), "database re-keyed");
        Ok(())
    }
}
