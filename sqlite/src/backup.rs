//! Snapshot protection around schema upgrades.
//!
//! A [`BackupGate`] copies the live database to `backup-<name>` before the
//! first upgrade step runs. On success the copy is discarded; on failure it
//! is verified against the fingerprint taken at snapshot time and copied
//! back over the live file.

use std::io;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::files::FileStore;

/// Prefix of snapshot names.
pub const BACKUP_PREFIX: &str = "backup-";

/// Returns the snapshot name for a database name.
pub fn backup_name(name: &str) -> String {
    format!("{BACKUP_PREFIX}{name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Snapshot {
    /// No live file existed; restoring removes whatever was created.
    Empty,
    Copied { fingerprint: String },
}

/// Backup/restore gate for one database.
pub struct BackupGate<'a> {
    files: &'a dyn FileStore,
    name: &'a str,
    fresh: bool,
    snapshot: Option<Snapshot>,
}

impl<'a> BackupGate<'a> {
    /// Creates a gate for `name`; nothing is copied until
    /// [`snapshot`](Self::snapshot).
    pub fn new(files: &'a dyn FileStore, name: &'a str) -> Self {
        Self {
            files,
            name,
            fresh: false,
            snapshot: None,
        }
    }

    /// Marks the live file as created by the current open, so the
    /// snapshot is empty and restoring removes the file.
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// The snapshot's file name.
    pub fn backup_name(&self) -> String {
        backup_name(self.name)
    }

    /// Returns `true` once a snapshot has been taken.
    pub fn is_armed(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Copies the live database and records its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BackupFailed`] if the copy or fingerprint
    /// fails. No snapshot is recorded in that case.
    pub fn snapshot(&mut self) -> Result<(), StoreError> {
        if self.fresh || !self.files.exists(self.name) {
            debug!(name = self.name, "no live file, recording empty snapshot");
            self.snapshot = Some(Snapshot::Empty);
            return Ok(());
        }

        let backup = self.backup_name();
        let fingerprint = self
            .files
            .copy(self.name, &backup)
            .and_then(|()| self.files.digest(&backup))
            .map_err(|source| StoreError::BackupFailed {
                name: self.name.to_string(),
                source,
            })?;
        info!(name = self.name, backup = %backup, "snapshot taken");
        self.snapshot = Some(Snapshot::Copied { fingerprint });
        Ok(())
    }

    /// Deletes the snapshot after a successful upgrade.
    ///
    /// Failure is logged and otherwise ignored: the upgraded database is
    /// already valid.
    pub fn discard(self) {
        if let Some(Snapshot::Copied { .. }) = self.snapshot {
            let backup = self.backup_name();
            match self.files.delete(&backup) {
                Ok(()) => debug!(name = self.name, "snapshot discarded"),
                Err(e) => warn!(name = self.name, backup = %backup, error = %e, "failed to discard snapshot"),
            }
        }
    }

    /// Puts the snapshot back after the upgrade failed with `cause`.
    ///
    /// The connection must already be closed. Returns the error to report:
    /// `cause` itself when the database was restored, or
    /// [`StoreError::RestoreFailed`] wrapping it when it was not.
    pub fn restore(self, cause: StoreError) -> StoreError {
        let result = match &self.snapshot {
            None => return cause,
            Some(Snapshot::Empty) => self.files.delete(self.name),
            Some(Snapshot::Copied { fingerprint }) => self.restore_copy(fingerprint),
        };

        match result {
            Ok(()) => {
                info!(name = self.name, "database restored from snapshot");
                cause
            }
            Err(source) => StoreError::RestoreFailed {
                name: self.name.to_string(),
                upgrade: Box::new(cause),
                source,
            },
        }
    }

    fn restore_copy(&self, fingerprint: &str) -> io::Result<()> {
        let backup = self.backup_name();
        let actual = self.files.digest(&backup)?;
        if actual != fingerprint {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("snapshot '{backup}' changed since it was taken"),
            ));
        }
        self.files.copy(&backup, self.name)?;
        self.files.delete(&backup)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::files::LocalFileStore;

    /// Delegates to a local store but fails the named operations.
    struct FlakyStore {
        inner: LocalFileStore,
        fail: RefCell<Vec<&'static str>>,
    }

    impl FlakyStore {
        fn check(&self, op: &'static str) -> io::Result<()> {
            if self.fail.borrow().contains(&op) {
                Err(io::Error::other(format!("{op} refused")))
            } else {
                Ok(())
            }
        }
    }

    impl FileStore for FlakyStore {
        fn resolve_path(&self, name: &str) -> Option<PathBuf> {
            self.inner.resolve_path(name)
        }
        fn delete(&self, name: &str) -> io::Result<()> {
            self.check("delete")?;
            self.inner.delete(name)
        }
        fn copy(&self, from: &str, to: &str) -> io::Result<()> {
            self.check("copy")?;
            self.inner.copy(from, to)
        }
        fn digest(&self, name: &str) -> io::Result<String> {
            self.inner.digest(name)
        }
    }

    fn store(dir: &tempfile::TempDir, fail: &[&'static str]) -> FlakyStore {
        FlakyStore {
            inner: LocalFileStore::new(dir.path()),
            fail: RefCell::new(fail.to_vec()),
        }
    }

    #[test]
    fn test_restore_puts_back_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(&dir, &[]);
        let live = dir.path().join("app.db");
        fs::write(&live, b"before").unwrap();

        let mut gate = BackupGate::new(&files, "app");
        gate.snapshot().unwrap();
        fs::write(&live, b"half-upgraded").unwrap();

        let err = gate.restore(StoreError::NotOpen("app".into()));
        assert!(matches!(err, StoreError::NotOpen(_)));
        assert_eq!(fs::read(&live).unwrap(), b"before");
        assert!(!files.exists("backup-app"));
    }

    #[test]
    fn test_restore_of_empty_snapshot_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(&dir, &[]);

        let mut gate = BackupGate::new(&files, "fresh");
        gate.snapshot().unwrap();
        fs::write(dir.path().join("fresh.db"), b"partial").unwrap();

        gate.restore(StoreError::NotOpen("fresh".into()));
        assert!(!files.exists("fresh"));
    }

    #[test]
    fn test_tampered_snapshot_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(&dir, &[]);
        fs::write(dir.path().join("app.db"), b"before").unwrap();

        let mut gate = BackupGate::new(&files, "app");
        gate.snapshot().unwrap();
        fs::write(dir.path().join("backup-app.db"), b"tampered").unwrap();

        let err = gate.restore(StoreError::NotOpen("app".into()));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_failed_copy_back_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(&dir, &[]);
        fs::write(dir.path().join("app.db"), b"before").unwrap();

        let mut gate = BackupGate::new(&files, "app");
        gate.snapshot().unwrap();
        files.fail.borrow_mut().push("copy");

        let err = gate.restore(StoreError::NotOpen("app".into()));
        match err {
            StoreError::RestoreFailed { upgrade, .. } => {
                assert!(matches!(*upgrade, StoreError::NotOpen(_)));
            }
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_failure_reports_backup_failed() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(&dir, &["copy"]);
        fs::write(dir.path().join("app.db"), b"before").unwrap();

        let mut gate = BackupGate::new(&files, "app");
        let err = gate.snapshot().unwrap_err();
        assert!(matches!(err, StoreError::BackupFailed { .. }));
        assert!(!gate.is_armed());
    }

    #[test]
    fn test_discard_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let files = store(&dir, &["delete"]);
        fs::write(dir.path().join("app.db"), b"before").unwrap();

        let mut gate = BackupGate::new(&files, "app");
        gate.snapshot().unwrap();
        gate.discard();
        assert!(files.exists("backup-app"));
    }
}
