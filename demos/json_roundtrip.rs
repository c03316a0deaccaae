//! JSON export and import example.
//!
//! Exports a populated database as a document, validates it, imports it
//! into a second database, and exports a partial document after a sync.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p versioned-db-demos --example json_roundtrip
//! ```

use versioned_db_core::{DatabaseConfig, UpgradeStep, is_json_valid};
use versioned_db_sqlite::{Database, ExportMode, LocalFileStore};

fn config(name: &str) -> DatabaseConfig {
    let mut config = DatabaseConfig::new(name, 1);
    config.upgrades.insert(
        1,
        UpgradeStep::new([
            "CREATE TABLE contacts (id INTEGER PRIMARY KEY, name TEXT NOT NULL, \
             email TEXT UNIQUE, last_modified INTEGER DEFAULT 0)",
            "CREATE INDEX contacts_name ON contacts (name)",
        ]),
    );
    config
}

fn main() {
    let dir = tempfile::tempdir().unwrap();

    let mut source = Database::builder(config("source"))
        .files(LocalFileStore::new(dir.path()))
        .build()
        .unwrap();
    source.open().unwrap();
    source
        .execute(
            "INSERT INTO contacts (name, email, last_modified) VALUES \
             ('Ada', 'ada@example.com', 100), ('Lin', 'lin@example.com', 200)",
            true,
        )
        .unwrap();

    // === Full export ===
    let doc = source.export_json(ExportMode::Full).unwrap();
    let raw = doc.to_json_pretty().unwrap();
    println!("=== Full export ({} rows) ===\n{raw}", doc.row_count());
    println!("valid: {}", is_json_valid(&raw));

    // === Import into a second database ===
    let mut target = Database::builder(config("target"))
        .files(LocalFileStore::new(dir.path()))
        .build()
        .unwrap();
    target.open().unwrap();
    let report = target.import_json(&doc).unwrap();
    println!(
        "\nImported {} table(s), {} row(s) into target",
        report.tables, report.rows
    );

    // === Partial export after a sync ===
    source.set_sync_date("1970-01-01T00:02:30Z").unwrap();
    let partial = source.export_json(ExportMode::Partial).unwrap();
    println!(
        "\n=== Partial export since {} ===\n{}",
        source.sync_date_utc().unwrap(),
        partial.to_json_pretty().unwrap()
    );
}
