//! Database configuration and the upgrade-step table.
//!
//! Defines the YAML-serializable configuration that names a database, says
//! whether and how it is encrypted, and carries the upgrade steps that take
//! it from any older schema version to the current one.
//!
//! # Example YAML
//!
//! ```yaml
//! name: inventory
//! encrypted: false
//! mode: no-encryption
//! version: 3
//! upgrades:
//!   - to_version: 1
//!     statements:
//!       - CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//!   - to_version: 3
//!     statements:
//!       - ALTER TABLE items ADD COLUMN qty INTEGER DEFAULT 0;
//!     set:
//!       - statement: INSERT INTO items (name, qty) VALUES (?, ?)
//!         values: [widget, 4]
//! ```

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::ops::Bound;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{CellValue, ValidationError, validate_config};

/// Errors that can occur while loading or saving a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing or serialization failure.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// The configuration parsed but violates an invariant.
    #[error("invalid config: {0}")]
    Invalid(ValidationError),
}

/// How the database file is protected and whether the key changes on open.
///
/// # Examples
///
/// ```
/// use versioned_db_core::EncryptionMode;
///
/// assert_eq!(EncryptionMode::default(), EncryptionMode::NoEncryption);
/// assert_eq!(EncryptionMode::NewSecret.as_str(), "newsecret");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionMode {
    /// Plain SQLite file (the default).
    #[default]
    #[serde(rename = "no-encryption")]
    NoEncryption,
    /// Encrypt a previously plain file, then open it with the current secret.
    #[serde(rename = "encryption")]
    Encryption,
    /// Open an encrypted file with the current secret.
    #[serde(rename = "secret")]
    Secret,
    /// Re-key the file from the current secret to the pending new secret.
    #[serde(rename = "newsecret")]
    NewSecret,
}

impl EncryptionMode {
    /// Returns the serialized name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::NoEncryption => "no-encryption",
            EncryptionMode::Encryption => "encryption",
            EncryptionMode::Secret => "secret",
            EncryptionMode::NewSecret => "newsecret",
        }
    }
}

/// A parameter-bound statement.
///
/// # Examples
///
/// ```
/// use versioned_db_core::{BoundStatement, CellValue};
///
/// let stmt = BoundStatement::new("INSERT INTO t (a) VALUES (?)", vec![CellValue::Integer(1)]);
/// assert_eq!(stmt.values.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundStatement {
    /// SQL text with `?` placeholders.
    pub statement: String,
    /// Values bound to the placeholders, in order.
    #[serde(default)]
    pub values: Vec<CellValue>,
}

impl BoundStatement {
    /// Creates a bound statement.
    pub fn new(statement: impl Into<String>, values: Vec<CellValue>) -> Self {
        Self {
            statement: statement.into(),
            values,
        }
    }
}

/// The work needed to move the schema *to* one version.
///
/// `statements` run first, each as a batch (DDL or unbound DML); `set`
/// runs afterwards with parameter binding.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpgradeStep {
    /// Raw SQL batches, applied in order.
    #[serde(default)]
    pub statements: Vec<String>,
    /// Parameter-bound statements, applied after `statements`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<BoundStatement>,
}

impl UpgradeStep {
    /// Creates a step from raw SQL statements.
    pub fn new<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
            set: Vec::new(),
        }
    }

    /// Appends a parameter-bound statement.
    pub fn with_set(mut self, statement: BoundStatement) -> Self {
        self.set.push(statement);
        self
    }

    /// Returns `true` if the step has nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.statements.iter().all(|s| s.trim().is_empty()) && self.set.is_empty()
    }
}

/// Upgrade steps keyed by target version, iterated in ascending order.
///
/// The table may be sparse. Only steps in `(from, to]` apply.
///
/// # Examples
///
/// ```
/// use versioned_db_core::{UpgradeStep, UpgradeTable};
///
/// let mut table = UpgradeTable::default();
/// table.insert(5, UpgradeStep::new(["SELECT 5"]));
/// table.insert(1, UpgradeStep::new(["SELECT 1"]));
/// table.insert(3, UpgradeStep::new(["SELECT 3"]));
///
/// let keys: Vec<i64> = table.pending(0, 4).map(|(k, _)| k).collect();
/// assert_eq!(keys, vec![1, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpgradeTable {
    steps: BTreeMap<i64, UpgradeStep>,
}

impl UpgradeTable {
    /// Inserts a step, returning the one it replaced.
    pub fn insert(&mut self, to_version: i64, step: UpgradeStep) -> Option<UpgradeStep> {
        self.steps.insert(to_version, step)
    }

    /// Looks up the step for a version.
    pub fn get(&self, to_version: i64) -> Option<&UpgradeStep> {
        self.steps.get(&to_version)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the table has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All steps in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = (&i64, &UpgradeStep)> {
        self.steps.iter()
    }

    /// Steps with `from < key <= to`, in ascending version order.
    pub fn pending(&self, from: i64, to: i64) -> impl Iterator<Item = (i64, &UpgradeStep)> {
        let range = if from < to {
            Some(self.steps.range((Bound::Excluded(from), Bound::Included(to))))
        } else {
            None
        };
        range.into_iter().flatten().map(|(k, step)| (*k, step))
    }
}

#[derive(Serialize, Deserialize)]
struct UpgradeEntry {
    to_version: i64,
    #[serde(flatten)]
    step: UpgradeStep,
}

impl Serialize for UpgradeTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<UpgradeEntry> = self
            .steps
            .iter()
            .map(|(k, step)| UpgradeEntry {
                to_version: *k,
                step: step.clone(),
            })
            .collect();
        entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UpgradeTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<UpgradeEntry>::deserialize(deserializer)?;
        let mut table = UpgradeTable::default();
        for entry in entries {
            if table.insert(entry.to_version, entry.step).is_some() {
                return Err(serde::de::Error::custom(ValidationError::DuplicateUpgrade(
                    entry.to_version,
                )));
            }
        }
        Ok(table)
    }
}

/// Immutable description of one database: name, protection, target version
/// and upgrade steps.
///
/// # Examples
///
/// ```
/// use versioned_db_core::{DatabaseConfig, EncryptionMode};
///
/// let config = DatabaseConfig::from_yaml_str(
///     "name: app\nversion: 2\nupgrades:\n  - to_version: 2\n    statements: [\"CREATE TABLE t (id INTEGER)\"]\n",
/// )
/// .unwrap();
/// assert_eq!(config.mode, EncryptionMode::NoEncryption);
/// assert_eq!(config.upgrades.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database name, resolved to a file by the file store.
    pub name: String,
    /// Whether the file is (or is to become) encrypted.
    #[serde(default)]
    pub encrypted: bool,
    /// Encryption handling on open.
    #[serde(default)]
    pub mode: EncryptionMode,
    /// Schema version the application expects.
    pub version: i64,
    /// Upgrade steps keyed by target version.
    #[serde(default)]
    pub upgrades: UpgradeTable,
}

impl DatabaseConfig {
    /// Creates an unencrypted configuration with no upgrade steps.
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            encrypted: false,
            mode: EncryptionMode::NoEncryption,
            version,
            upgrades: UpgradeTable::default(),
        }
    }

    /// Returns `true` if opening requires secret material.
    pub fn requires_secret(&self) -> bool {
        self.encrypted && self.mode != EncryptionMode::NoEncryption
    }

    /// Returns the first validation error, if any.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match validate_config(self).into_iter().next() {
            Some(err) => Err(ConfigError::Invalid(err)),
            None => Ok(()),
        }
    }

    /// Parses and validates a configuration from YAML text.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if the file cannot be read,
    /// [`ConfigError::YamlError`] if parsing fails, or
    /// [`ConfigError::Invalid`] if the configuration is inconsistent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path)?;
        let writer = BufWriter::new(file);
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: inventory
encrypted: false
mode: no-encryption
version: 3
upgrades:
  - to_version: 3
    statements:
      - ALTER TABLE items ADD COLUMN qty INTEGER DEFAULT 0;
    set:
      - statement: INSERT INTO items (name, qty) VALUES (?, ?)
        values: [widget, 4]
  - to_version: 1
    statements:
      - CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
"#;

    #[test]
    fn test_parse_sample_orders_steps() {
        let config = DatabaseConfig::from_yaml_str(SAMPLE).unwrap();
        let keys: Vec<i64> = config.upgrades.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 3]);

        let step = config.upgrades.get(3).unwrap();
        assert_eq!(
            step.set[0].values,
            vec![CellValue::Text("widget".into()), CellValue::Integer(4)]
        );
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let raw = r#"
name: app
version: 2
upgrades:
  - to_version: 2
    statements: ["SELECT 1"]
  - to_version: 2
    statements: ["SELECT 2"]
"#;
        let err = DatabaseConfig::from_yaml_str(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate upgrade step for version 2"));
    }

    #[test]
    fn test_pending_excludes_bounds() {
        let mut table = UpgradeTable::default();
        for k in [1, 3, 5, 7] {
            table.insert(k, UpgradeStep::new([format!("SELECT {k}")]));
        }
        let keys: Vec<i64> = table.pending(1, 5).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![3, 5]);
        assert_eq!(table.pending(5, 5).count(), 0);
        assert_eq!(table.pending(7, 3).count(), 0);
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in [
            EncryptionMode::NoEncryption,
            EncryptionMode::Encryption,
            EncryptionMode::Secret,
            EncryptionMode::NewSecret,
        ] {
            let yaml = serde_yaml::to_string(&mode).unwrap();
            assert_eq!(yaml.trim(), mode.as_str());
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.yaml");
        let config = DatabaseConfig::from_yaml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();
        assert_eq!(DatabaseConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_requires_secret() {
        let mut config = DatabaseConfig::new("app", 1);
        assert!(!config.requires_secret());
        config.encrypted = true;
        config.mode = EncryptionMode::Secret;
        assert!(config.requires_secret());
    }
}
