//! Forward-only schema upgrades.
//!
//! [`UpgradeEngine`] moves a database from its stored `user_version` to the
//! configured target by applying every step keyed in `(stored, target]` in
//! ascending order. Each step runs in its own transaction and stamps
//! `user_version` with its key on commit. The whole run is protected by a
//! [`BackupGate`]: a failure at any step closes the connection and restores
//! the snapshot.

use std::fmt;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};
use versioned_db_core::UpgradeTable;

use crate::backup::BackupGate;
use crate::error::{Result, StoreError};
use crate::executor::{Executor, in_transaction};

/// Where an upgrade run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Nothing has happened yet.
    Idle,
    /// Taking the pre-upgrade snapshot.
    Snapshotting,
    /// Applying the step for the given version.
    Applying(i64),
    /// Every step committed and the target version is stamped.
    Committed,
    /// A step failed and the snapshot was restored (or restoring failed).
    RolledBack,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::Idle => f.write_str("idle"),
            UpgradeState::Snapshotting => f.write_str("snapshotting"),
            UpgradeState::Applying(version) => write!(f, "applying({version})"),
            UpgradeState::Committed => f.write_str("committed"),
            UpgradeState::RolledBack => f.write_str("rolled-back"),
        }
    }
}

/// Outcome of a successful upgrade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    /// Version stored before the run.
    pub from: i64,
    /// Version stored after the run.
    pub to: i64,
    /// Step keys applied, in order.
    pub applied: Vec<i64>,
}

/// Reads `PRAGMA user_version`.
pub fn read_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(StoreError::sql("read schema version"))
}

/// Writes `PRAGMA user_version`.
pub(crate) fn write_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))
        .map_err(StoreError::sql("write schema version"))
}

/// Applies pending upgrade steps to one connection.
///
/// # Example
///
/// ```
/// use rusqlite::Connection;
/// use versioned_db_core::{UpgradeStep, UpgradeTable};
/// use versioned_db_sqlite::{UpgradeEngine, UpgradeState};
///
/// let mut table = UpgradeTable::default();
/// table.insert(1, UpgradeStep::new(["CREATE TABLE t (id INTEGER PRIMARY KEY)"]));
/// table.insert(2, UpgradeStep::new(["ALTER TABLE t ADD COLUMN name TEXT"]));
///
/// let conn = Connection::open_in_memory().unwrap();
/// let mut engine = UpgradeEngine::new(&table, 2);
/// let report = engine.apply(&conn, 0).unwrap();
///
/// assert_eq!(report.applied, vec![1, 2]);
/// assert_eq!(engine.state(), UpgradeState::Committed);
/// ```
pub struct UpgradeEngine<'a> {
    upgrades: &'a UpgradeTable,
    target: i64,
    state: UpgradeState,
}

impl<'a> UpgradeEngine<'a> {
    /// Creates an engine that upgrades to `target`.
    pub fn new(upgrades: &'a UpgradeTable, target: i64) -> Self {
        Self {
            upgrades,
            target,
            state: UpgradeState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Keys of the steps that apply when starting from `from`, ascending.
    pub fn pending(&self, from: i64) -> Vec<i64> {
        self.upgrades
            .pending(from, self.target)
            .map(|(k, _)| k)
            .collect()
    }

    /// Returns `true` if a database at `from` must be upgraded.
    ///
    /// A stored version above the target is logged and left alone.
    pub fn needs_upgrade(&self, from: i64) -> bool {
        if from > self.target {
            warn!(
                stored = from,
                target = self.target,
                "stored version is newer than target, not downgrading"
            );
        }
        from < self.target
    }

    fn transition(&mut self, next: UpgradeState) {
        debug!(from = %self.state, to = %next, "upgrade state");
        self.state = next;
    }

    /// Runs a guarded upgrade.
    ///
    /// Takes the snapshot, applies the steps, and discards the snapshot.
    /// The connection is handed back on success. On failure it is closed
    /// before the snapshot is restored, and the returned error is
    /// [`StoreError::UpgradeFailed`] or, if the restore also failed,
    /// [`StoreError::RestoreFailed`].
    pub fn run(
        &mut self,
        conn: Connection,
        mut gate: BackupGate<'_>,
        from: i64,
    ) -> Result<(Connection, UpgradeReport)> {
        self.transition(UpgradeState::Snapshotting);
        if let Err(e) = gate.snapshot() {
            self.transition(UpgradeState::RolledBack);
            return Err(e);
        }

        match self.apply(&conn, from) {
            Ok(report) => {
                gate.discard();
                Ok((conn, report))
            }
            Err(cause) => {
                if let Err((_, e)) = conn.close() {
                    warn!(error = %e, "closing connection before restore failed");
                }
                Err(gate.restore(cause))
            }
        }
    }

    /// Applies the steps in `(from, target]` without snapshot protection.
    ///
    /// Each step is committed on its own; a failure leaves earlier steps
    /// committed and is reported as [`StoreError::UpgradeFailed`].
    pub fn apply(&mut self, conn: &Connection, from: i64) -> Result<UpgradeReport> {
        let upgrades = self.upgrades;
        let mut applied = Vec::new();

        for (version, step) in upgrades.pending(from, self.target) {
            self.transition(UpgradeState::Applying(version));
            let result = in_transaction(conn, |tx| {
                let exec = Executor::new(tx);
                for sql in step.statements.iter().filter(|s| !s.trim().is_empty()) {
                    exec.execute_batch(sql, false)?;
                }
                exec.execute_set(&step.set, false)?;
                write_version(tx, version)
            });
            if let Err(source) = result {
                self.transition(UpgradeState::RolledBack);
                return Err(StoreError::UpgradeFailed {
                    version,
                    source: Box::new(source),
                });
            }
            info!(version, "upgrade step applied");
            applied.push(version);
        }

        if applied.last() != Some(&self.target) {
            if let Err(source) = write_version(conn, self.target) {
                self.transition(UpgradeState::RolledBack);
                return Err(StoreError::UpgradeFailed {
                    version: self.target,
                    source: Box::new(source),
                });
            }
        }

        self.transition(UpgradeState::Committed);
        info!(from, to = self.target, steps = applied.len(), "upgrade complete");
        Ok(UpgradeReport {
            from,
            to: self.target,
            applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use versioned_db_core::UpgradeStep;

    use super::*;
    use crate::files::LocalFileStore;

    fn sparse_table() -> UpgradeTable {
        let mut table = UpgradeTable::default();
        table.insert(
            5,
            UpgradeStep::new(["INSERT INTO log (step) VALUES (5)"]),
        );
        table.insert(
            1,
            UpgradeStep::new([
                "CREATE TABLE log (seq INTEGER PRIMARY KEY AUTOINCREMENT, step INTEGER)",
                "INSERT INTO log (step) VALUES (1)",
            ]),
        );
        table.insert(
            3,
            UpgradeStep::new(["INSERT INTO log (step) VALUES (3)"]),
        );
        table.insert(
            9,
            UpgradeStep::new(["INSERT INTO log (step) VALUES (9)"]),
        );
        table
    }

    fn logged_steps(conn: &Connection) -> Vec<i64> {
        let mut stmt = conn.prepare("SELECT step FROM log ORDER BY seq").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<i64>>>()
            .unwrap()
    }

    #[test]
    fn test_steps_apply_in_ascending_order_within_range() {
        let table = sparse_table();
        let conn = Connection::open_in_memory().unwrap();
        let mut engine = UpgradeEngine::new(&table, 5);

        assert_eq!(engine.pending(0), vec![1, 3, 5]);
        let report = engine.apply(&conn, 0).unwrap();

        assert_eq!(report.applied, vec![1, 3, 5]);
        assert_eq!(logged_steps(&conn), vec![1, 3, 5]);
        assert_eq!(read_version(&conn).unwrap(), 5);
    }

    #[test]
    fn test_target_above_last_key_is_stamped() {
        let table = sparse_table();
        let conn = Connection::open_in_memory().unwrap();
        let mut engine = UpgradeEngine::new(&table, 7);

        let report = engine.apply(&conn, 0).unwrap();
        assert_eq!(report.applied, vec![1, 3, 5]);
        assert_eq!(read_version(&conn).unwrap(), 7);
    }

    #[test]
    fn test_failed_step_keeps_earlier_commits() {
        let mut table = sparse_table();
        table.insert(4, UpgradeStep::new(["INSERT INTO missing VALUES (1)"]));
        let conn = Connection::open_in_memory().unwrap();
        let mut engine = UpgradeEngine::new(&table, 5);

        let err = engine.apply(&conn, 0).unwrap_err();
        assert!(matches!(err, StoreError::UpgradeFailed { version: 4, .. }));
        assert_eq!(engine.state(), UpgradeState::RolledBack);
        assert_eq!(read_version(&conn).unwrap(), 3);
        assert_eq!(logged_steps(&conn), vec![1, 3]);
    }

    #[test]
    fn test_newer_stored_version_is_left_alone() {
        let table = sparse_table();
        let engine = UpgradeEngine::new(&table, 3);
        assert!(!engine.needs_upgrade(5));
        assert!(!engine.needs_upgrade(3));
        assert!(engine.needs_upgrade(2));
    }

    #[test]
    fn test_run_restores_file_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let files = LocalFileStore::new(dir.path());
        let path = dir.path().join("app.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE kept (v TEXT); INSERT INTO kept VALUES ('x');")
                .unwrap();
        }
        let before = fs::read(&path).unwrap();

        let mut table = UpgradeTable::default();
        table.insert(1, UpgradeStep::new(["CREATE TABLE added (id INTEGER)"]));
        table.insert(2, UpgradeStep::new(["THIS IS NOT SQL"]));

        let conn = Connection::open(&path).unwrap();
        let mut engine = UpgradeEngine::new(&table, 2);
        let err = engine
            .run(conn, BackupGate::new(&files, "app"), 0)
            .map(|_| ())
            .unwrap_err();

        assert!(matches!(err, StoreError::UpgradeFailed { version: 2, .. }));
        assert!(!err.is_unrecoverable());
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!dir.path().join("backup-app.db").exists());
    }

    #[test]
    fn test_run_discards_snapshot_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let files = LocalFileStore::new(dir.path());
        let conn = Connection::open(dir.path().join("app.db")).unwrap();
        conn.execute_batch("CREATE TABLE seed (id INTEGER)").unwrap();

        let table = sparse_table();
        let mut engine = UpgradeEngine::new(&table, 9);
        let (conn, report) = engine.run(conn, BackupGate::new(&files, "app"), 0).unwrap();

        assert_eq!(report.applied, vec![1, 3, 5, 9]);
        assert_eq!(read_version(&conn).unwrap(), 9);
        assert!(!dir.path().join("backup-app.db").exists());
    }
}
