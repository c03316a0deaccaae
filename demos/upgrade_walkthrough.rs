//! Version upgrade walkthrough.
//!
//! Opens a database at version 2, reopens it with a config targeting
//! version 4, and then shows a broken step being rolled back from the
//! snapshot.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p versioned-db-demos --example upgrade_walkthrough
//! ```

use versioned_db_core::{BoundStatement, CellValue, DatabaseConfig, UpgradeStep};
use versioned_db_sqlite::{Database, LocalFileStore};

fn config(version: i64) -> DatabaseConfig {
    let mut config = DatabaseConfig::new("notes", version);
    config.upgrades.insert(
        1,
        UpgradeStep::new(["CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)"]),
    );
    config.upgrades.insert(
        2,
        UpgradeStep::new(["ALTER TABLE notes ADD COLUMN pinned INTEGER DEFAULT 0"]).with_set(
            BoundStatement::new(
                "INSERT INTO notes (body, pinned) VALUES (?, ?)",
                vec![CellValue::Text("welcome".into()), CellValue::Integer(1)],
            ),
        ),
    );
    config.upgrades.insert(
        4,
        UpgradeStep::new(["CREATE INDEX notes_pinned ON notes (pinned)"]),
    );
    config
}

fn open(dir: &std::path::Path, config: DatabaseConfig) -> Database {
    Database::builder(config)
        .files(LocalFileStore::new(dir))
        .build()
        .unwrap()
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let dir = tempfile::tempdir().unwrap();

    // === Step 1: create at version 2 ===
    println!("=== Create ===");
    let mut db = open(dir.path(), config(2));
    db.open().unwrap();
    let report = db.last_upgrade().unwrap();
    println!("Applied {:?}, now at version {}", report.applied, db.version().unwrap());
    db.close().unwrap();

    // === Step 2: reopen targeting version 4 ===
    println!("\n=== Upgrade ===");
    let mut db = open(dir.path(), config(4));
    db.open().unwrap();
    let report = db.last_upgrade().unwrap();
    println!(
        "Upgraded {} -> {}, applied {:?}",
        report.from, report.to, report.applied
    );
    db.close().unwrap();

    // === Step 3: a failing step restores the snapshot ===
    println!("\n=== Rollback ===");
    let mut broken = config(5);
    broken
        .upgrades
        .insert(5, UpgradeStep::new(["ALTER TABLE missing ADD COLUMN x"]));
    let mut db = open(dir.path(), broken);
    match db.open() {
        Ok(()) => println!("unexpected success"),
        Err(e) if e.is_unrecoverable() => println!("restore failed: {e}"),
        Err(e) => println!("rolled back: {e}"),
    }

    let mut db = open(dir.path(), config(4));
    db.open().unwrap();
    println!("Still at version {}", db.version().unwrap());
    let rows = db.query("SELECT body, pinned FROM notes", &[]).unwrap();
    println!("Rows: {rows:?}");
}
