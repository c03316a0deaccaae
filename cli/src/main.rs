use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use rusqlite::{Connection, OpenFlags};
use tracing::Level;
use versioned_db_core::{DatabaseConfig, JsonDatabase, validate_document};
use versioned_db_sqlite::{
    Database, ExportMode, LocalFileStore, NoCipher, SqlCipher, StoreError, UpgradeEngine,
    read_version,
};

#[derive(Debug, Parser)]
#[command(name = "vdb")]
#[command(about = "Versioned SQLite database lifecycle tool")]
#[command(version)]
struct Cli {
    /// Log debug events to stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open the database, applying pending upgrades, and print its version.
    Open(DbArgs),
    /// Show stored and target versions without modifying the database.
    Status(DbArgs),
    /// Export the database as a JSON document.
    Export(ExportArgs),
    /// Import a JSON document into the database.
    Import(ImportArgs),
    /// Validate one or more JSON database documents.
    Validate(ValidateArgs),
    /// Delete the database file.
    Delete(DbArgs),
    /// Run one SQL statement. Read-only statements print their rows.
    Exec(ExecArgs),
    /// Read or write the last sync date.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    /// Path to the database YAML config.
    #[arg(long)]
    config: PathBuf,
    /// Directory holding the database files.
    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    db: DbArgs,
    /// Export mode: full, schema-only or partial.
    #[arg(long, default_value = "full")]
    mode: ExportMode,
    /// Output file (default: stdout).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(flatten)]
    db: DbArgs,
    /// JSON document to import.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// JSON document files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    #[command(flatten)]
    db: DbArgs,
    /// SQL statement to run.
    #[arg(long)]
    sql: String,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(subcommand)]
    operation: SyncOperation,
}

#[derive(Debug, Subcommand)]
enum SyncOperation {
    /// Store an RFC 3339 timestamp as the last sync date.
    Set {
        /// Timestamp, e.g. 2024-03-01T12:00:00Z.
        date: String,
    },
    /// Print the last sync date.
    Get,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = match cli.command {
        Command::Open(args) => run_open(args),
        Command::Status(args) => run_status(args),
        Command::Export(args) => run_export(args),
        Command::Import(args) => run_import(args),
        Command::Validate(args) => run_validate(args),
        Command::Delete(args) => run_delete(args),
        Command::Exec(args) => run_exec(args),
        Command::Sync(args) => run_sync(args),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<DatabaseConfig, String> {
    DatabaseConfig::load(path)
        .map_err(|err| format!("Failed to load config '{}': {err}", path.display()))
}

fn build_database(args: &DbArgs) -> Result<Database, String> {
    let config = load_config(&args.config)?;
    let builder = Database::builder(config.clone()).files(LocalFileStore::new(&args.dir));
    let builder = if config.encrypted {
        builder.cipher(SqlCipher)
    } else {
        builder.cipher(NoCipher)
    };
    builder.build().map_err(|e| e.to_string())
}

fn open_database(args: &DbArgs) -> Result<Database, String> {
    let mut db = build_database(args)?;
    db.open().map_err(describe_open_error)?;
    Ok(db)
}

fn describe_open_error(err: StoreError) -> String {
    if err.is_unrecoverable() {
        format!("{err} (the snapshot could not be restored, manual repair needed)")
    } else {
        err.to_string()
    }
}

fn close_database(mut db: Database) -> Result<(), String> {
    db.close().map_err(|e| e.to_string())
}

fn run_open(args: DbArgs) -> Result<(), String> {
    let db = open_database(&args)?;
    let version = db.version().map_err(|e| e.to_string())?;
    match db.last_upgrade() {
        Some(report) if !report.applied.is_empty() => println!(
            "Opened '{}' at version {version} (upgraded from {}, applied {:?}).",
            db.name(),
            report.from,
            report.applied
        ),
        Some(report) => println!(
            "Opened '{}' at version {version} (stamped from {}).",
            db.name(),
            report.from
        ),
        None => println!("Opened '{}' at version {version}.", db.name()),
    }
    close_database(db)
}

fn run_status(args: DbArgs) -> Result<(), String> {
    let db = build_database(&args)?;
    let config = db.config();

    let stored = if !db.exists() {
        Some(0)
    } else if config.encrypted {
        None
    } else {
        let conn = Connection::open_with_flags(db.path(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| format!("Failed to open '{}': {err}", db.path().display()))?;
        Some(read_version(&conn).map_err(|e| e.to_string())?)
    };

    let engine = UpgradeEngine::new(&config.upgrades, config.version);
    let status = serde_json::json!({
        "name": config.name,
        "path": db.path().display().to_string(),
        "exists": db.exists(),
        "mode": config.mode.as_str(),
        "target_version": config.version,
        "stored_version": stored,
        "pending": stored.map(|v| engine.pending(v)),
    });
    let raw = serde_json::to_string_pretty(&status)
        .map_err(|err| format!("Failed to serialize status: {err}"))?;
    println!("{raw}");
    Ok(())
}

fn run_export(args: ExportArgs) -> Result<(), String> {
    let db = open_database(&args.db)?;
    let doc = db.export_json(args.mode).map_err(|e| e.to_string())?;
    let raw = doc
        .to_json_pretty()
        .map_err(|err| format!("Failed to serialize document: {err}"))?;

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|err| {
                        format!(
                            "Failed to create output directory '{}': {err}",
                            parent.display()
                        )
                    })?;
                }
            }
            fs::write(path, raw)
                .map_err(|err| format!("Failed to write '{}': {err}", path.display()))?;
            eprintln!(
                "Exported {} table(s), {} row(s) to '{}'.",
                doc.tables.len(),
                doc.row_count(),
                path.display()
            );
        }
        None => println!("{raw}"),
    }
    close_database(db)
}

fn read_document(path: &Path) -> Result<JsonDatabase, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read '{}': {err}", path.display()))?;
    JsonDatabase::from_json(&raw).map_err(|err| format!("Invalid JSON in '{}': {err}", path.display()))
}

fn run_import(args: ImportArgs) -> Result<(), String> {
    let doc = read_document(&args.input)?;
    let db = open_database(&args.db)?;
    let report = db.import_json(&doc).map_err(|e| e.to_string())?;
    println!(
        "Imported {} table(s), {} row(s) into '{}'.",
        report.tables,
        report.rows,
        db.name()
    );
    close_database(db)
}

fn run_validate(args: ValidateArgs) -> Result<(), String> {
    let mut failed = 0usize;
    for path in &args.inputs {
        let doc = read_document(path)?;
        let errors = validate_document(&doc);
        if errors.is_empty() {
            println!("{}: ok", path.display());
        } else {
            failed += 1;
            for error in &errors {
                eprintln!("{}: {error}", path.display());
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} of {} document(s) invalid", args.inputs.len()));
    }
    println!("Validated {} document(s).", args.inputs.len());
    Ok(())
}

fn run_delete(args: DbArgs) -> Result<(), String> {
    let mut db = build_database(&args)?;
    if !db.exists() {
        println!("Database '{}' does not exist.", db.name());
        return Ok(());
    }
    db.delete_database().map_err(|e| e.to_string())?;
    println!("Deleted '{}'.", db.name());
    Ok(())
}

fn run_exec(args: ExecArgs) -> Result<(), String> {
    let db = open_database(&args.db)?;
    match db.query(&args.sql, &[]) {
        Ok(rows) => {
            let raw = serde_json::to_string_pretty(&rows)
                .map_err(|err| format!("Failed to serialize rows: {err}"))?;
            println!("{raw}");
        }
        Err(StoreError::NotReadOnly(_)) => {
            let changes = db.execute(&args.sql, true).map_err(|e| e.to_string())?;
            println!("{changes} row(s) changed.");
        }
        Err(e) => return Err(e.to_string()),
    }
    close_database(db)
}

fn run_sync(args: SyncArgs) -> Result<(), String> {
    let db = open_database(&args.db)?;
    match args.operation {
        SyncOperation::Set { date } => {
            db.set_sync_date(&date).map_err(|e| e.to_string())?;
            println!("Sync date set to {date}.");
        }
        SyncOperation::Get => {
            let date = db.sync_date_utc().map_err(|e| e.to_string())?;
            println!("{}", date.to_rfc3339());
        }
    }
    close_database(db)
}
