use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const INVENTORY_CONFIG: &str = r#"name: inventory
encrypted: false
mode: no-encryption
version: 3
upgrades:
  - to_version: 1
    statements:
      - CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
  - to_version: 3
    statements:
      - ALTER TABLE items ADD COLUMN qty INTEGER DEFAULT 0;
    set:
      - statement: INSERT INTO items (name, qty) VALUES (?, ?)
        values: [widget, 4]
"#;

fn write_config(dir: &TempDir, file: &str, raw: &str) -> PathBuf {
    let path = dir.path().join(file);
    fs::write(&path, raw).expect("failed to write config");
    path
}

fn vdb(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vdb"))
        .args(args)
        .output()
        .expect("failed to run vdb")
}

fn vdb_db(command: &[&str], config: &Path, dir: &Path, extra: &[&str]) -> Output {
    let mut args: Vec<&str> = command.to_vec();
    args.extend(["--config", config.to_str().unwrap(), "--dir", dir.to_str().unwrap()]);
    args.extend(extra);
    vdb(&args)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "vdb failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn open_applies_upgrades_and_prints_version() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    let output = vdb_db(&["open"], &config, dir.path(), &[]);
    assert_success(&output);
    let text = stdout(&output);
    assert!(text.contains("version 3"), "unexpected output: {text}");
    assert!(text.contains("[1, 3]"), "unexpected output: {text}");
    assert!(dir.path().join("inventory.db").exists());
    assert!(!dir.path().join("backup-inventory.db").exists());

    let again = vdb_db(&["open"], &config, dir.path(), &[]);
    assert_success(&again);
    assert!(stdout(&again).contains("Opened 'inventory' at version 3."));
}

#[test]
fn status_reports_pending_steps_without_creating_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    let output = vdb_db(&["status"], &config, dir.path(), &[]);
    assert_success(&output);
    let status: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(status["exists"], false);
    assert_eq!(status["stored_version"], 0);
    assert_eq!(status["pending"], serde_json::json!([1, 3]));
    assert!(!dir.path().join("inventory.db").exists());

    assert_success(&vdb_db(&["open"], &config, dir.path(), &[]));
    let output = vdb_db(&["status"], &config, dir.path(), &[]);
    let status: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(status["stored_version"], 3);
    assert_eq!(status["pending"], serde_json::json!([]));
}

#[test]
fn exec_prints_query_rows_and_applies_writes() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    let write = vdb_db(
        &["exec"],
        &config,
        dir.path(),
        &["--sql", "INSERT INTO items (name, qty) VALUES ('bolt', 10)"],
    );
    assert_success(&write);
    assert!(stdout(&write).contains("1 row(s) changed."));

    let read = vdb_db(
        &["exec"],
        &config,
        dir.path(),
        &["--sql", "SELECT name, qty FROM items ORDER BY id"],
    );
    assert_success(&read);
    let rows: serde_json::Value = serde_json::from_str(&stdout(&read)).unwrap();
    assert_eq!(
        rows,
        serde_json::json!([
            {"name": "widget", "qty": 4},
            {"name": "bolt", "qty": 10}
        ])
    );
}

#[test]
fn export_validate_and_import_into_another_database() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);
    let export_path = dir.path().join("out").join("inventory.json");

    let export = vdb_db(
        &["export"],
        &config,
        dir.path(),
        &["--mode", "full", "--output", export_path.to_str().unwrap()],
    );
    assert_success(&export);
    assert!(export_path.exists());

    let validate = vdb(&["validate", export_path.to_str().unwrap()]);
    assert_success(&validate);
    assert!(stdout(&validate).contains("Validated 1 document(s)."));

    let copy_config = write_config(
        &dir,
        "copy.yaml",
        &INVENTORY_CONFIG.replace("name: inventory", "name: copy"),
    );
    let import = vdb_db(
        &["import"],
        &copy_config,
        dir.path(),
        &["--input", export_path.to_str().unwrap()],
    );
    assert_success(&import);
    assert!(stdout(&import).contains("1 row(s)"));

    let read = vdb_db(
        &["exec"],
        &copy_config,
        dir.path(),
        &["--sql", "SELECT name FROM items"],
    );
    let rows: serde_json::Value = serde_json::from_str(&stdout(&read)).unwrap();
    assert_eq!(rows, serde_json::json!([{"name": "widget"}]));
}

#[test]
fn export_schema_only_to_stdout_has_no_rows() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    let output = vdb_db(&["export"], &config, dir.path(), &["--mode", "schema-only"]);
    assert_success(&output);
    let doc: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(doc["database"], "inventory");
    assert_eq!(doc["version"], 3);
    let items = doc["tables"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "items")
        .expect("items table exported");
    assert_eq!(items["values"], serde_json::json!([]));
}

#[test]
fn export_rejects_unknown_mode() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    let output = vdb_db(&["export"], &config, dir.path(), &["--mode", "everything"]);
    assert!(!output.status.success());
    assert!(!dir.path().join("inventory.db").exists());
}

#[test]
fn validate_reports_invalid_documents() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.json");
    let bad = dir.path().join("bad.json");
    fs::write(&good, r#"{"database": "db", "version": 1, "tables": []}"#).unwrap();
    fs::write(&bad, r#"{"database": "", "version": 0, "tables": []}"#).unwrap();

    let output = vdb(&["validate", good.to_str().unwrap(), bad.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("database name cannot be empty"), "stderr: {stderr}");
    assert!(stderr.contains("1 of 2 document(s) invalid"), "stderr: {stderr}");
}

#[test]
fn sync_set_then_get_round_trips() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    let set = vdb_db(&["sync"], &config, dir.path(), &["set", "2024-03-01T12:00:00Z"]);
    assert_success(&set);

    let get = vdb_db(&["sync"], &config, dir.path(), &["get"]);
    assert_success(&get);
    assert_eq!(stdout(&get).trim(), "2024-03-01T12:00:00+00:00");

    let bad = vdb_db(&["sync"], &config, dir.path(), &["set", "yesterday"]);
    assert!(!bad.status.success());
}

#[test]
fn delete_removes_database_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);

    assert_success(&vdb_db(&["open"], &config, dir.path(), &[]));
    assert!(dir.path().join("inventory.db").exists());

    let output = vdb_db(&["delete"], &config, dir.path(), &[]);
    assert_success(&output);
    assert!(!dir.path().join("inventory.db").exists());

    let again = vdb_db(&["delete"], &config, dir.path(), &[]);
    assert_success(&again);
    assert!(stdout(&again).contains("does not exist"));
}

#[test]
fn failed_upgrade_exits_nonzero_and_keeps_previous_version() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "inventory.yaml", INVENTORY_CONFIG);
    assert_success(&vdb_db(&["open"], &config, dir.path(), &[]));
    let before = fs::read(dir.path().join("inventory.db")).unwrap();

    let broken = format!(
        "{}  - to_version: 4\n    statements:\n      - ALTER TABLE missing ADD COLUMN x TEXT;\n",
        INVENTORY_CONFIG.replace("\nversion: 3\n", "\nversion: 4\n")
    );
    let broken_config = write_config(&dir, "broken.yaml", &broken);

    let output = vdb_db(&["open"], &broken_config, dir.path(), &[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr: {stderr}");
    assert_eq!(fs::read(dir.path().join("inventory.db")).unwrap(), before);
}

#[test]
fn missing_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let output = vdb_db(&["open"], &dir.path().join("nope.yaml"), dir.path(), &[]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load config"));
}
