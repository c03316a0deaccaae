//! File-system collaborator for database files and their snapshots.
//!
//! [`FileStore`] is the seam between the lifecycle controller and the disk:
//! it maps database names to paths and performs the raw copy and delete
//! operations the backup gate needs. [`LocalFileStore`] keeps every file in
//! one directory.

use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// Name-addressed file operations.
///
/// Names are logical (`"inventory"`, `"backup-inventory"`); the store decides
/// where they live.
pub trait FileStore {
    /// Returns the file path for a name, or `None` if the name cannot be
    /// mapped to a file.
    fn resolve_path(&self, name: &str) -> Option<PathBuf>;

    /// Returns `true` if a file exists for the name.
    fn exists(&self, name: &str) -> bool {
        self.resolve_path(name).is_some_and(|path| path.is_file())
    }

    /// Removes the file for a name. Removing a missing file succeeds.
    fn delete(&self, name: &str) -> io::Result<()>;

    /// Copies the file for `from` over the file for `to`.
    fn copy(&self, from: &str, to: &str) -> io::Result<()>;

    /// Returns the lowercase hex SHA-256 of the file for a name.
    fn digest(&self, name: &str) -> io::Result<String>;
}

/// Files SQLite keeps next to a database while it is in use.
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A [`FileStore`] rooted at one directory.
///
/// `inventory` maps to `<root>/inventory.db`; names that already end in
/// `.db` or `.sqlite` are used as-is. Deleting a name also removes its
/// `-journal`, `-wal` and `-shm` files.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use versioned_db_sqlite::{FileStore, LocalFileStore};
///
/// let store = LocalFileStore::new("/var/lib/app");
/// assert_eq!(
///     store.resolve_path("inventory").unwrap(),
///     Path::new("/var/lib/app/inventory.db")
/// );
/// assert!(store.resolve_path("../escape").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory files are kept in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        self.resolve_path(name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid database name '{name}'"),
            )
        })
    }
}

impl FileStore for LocalFileStore {
    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        let name = name.trim();
        if name.is_empty() || name.contains(['/', '\\']) {
            return None;
        }
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return None;
        }

        let file = if name.ends_with(".db") || name.ends_with(".sqlite") {
            name.to_string()
        } else {
            format!("{name}.db")
        };
        Some(self.root.join(file))
    }

    fn delete(&self, name: &str) -> io::Result<()> {
        let path = self.path_for(name)?;
        remove_if_present(&path)?;
        for suffix in SIDECAR_SUFFIXES {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            remove_if_present(Path::new(&sidecar))?;
        }
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        fs::copy(self.path_for(from)?, self.path_for(to)?).map(|_| ())
    }

    fn digest(&self, name: &str) -> io::Result<String> {
        let mut reader = BufReader::new(fs::File::open(self.path_for(name)?)?);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_keeps_known_extensions() {
        let store = LocalFileStore::new("/data");
        assert_eq!(
            store.resolve_path("a.sqlite").unwrap(),
            PathBuf::from("/data/a.sqlite")
        );
        assert_eq!(store.resolve_path("a.db").unwrap(), PathBuf::from("/data/a.db"));
        assert_eq!(store.resolve_path("a").unwrap(), PathBuf::from("/data/a.db"));
    }

    #[test]
    fn test_resolve_rejects_unsafe_names() {
        let store = LocalFileStore::new("/data");
        for name in ["", "  ", "..", ".", "a/b", "a\\b", "/abs"] {
            assert!(store.resolve_path(name).is_none(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_copy_digest_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        fs::write(dir.path().join("app.db"), b"hello").unwrap();

        assert!(store.exists("app"));
        store.copy("app", "backup-app").unwrap();
        assert!(store.exists("backup-app"));

        // sha256("hello")
        assert_eq!(
            store.digest("backup-app").unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        store.delete("backup-app").unwrap();
        assert!(!store.exists("backup-app"));
        store.delete("backup-app").unwrap();
    }

    #[test]
    fn test_delete_removes_sidecar_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        for file in ["app.db", "app.db-wal", "app.db-shm", "app.db-journal", "other.db-wal"] {
            fs::write(dir.path().join(file), b"x").unwrap();
        }

        store.delete("app").unwrap();
        for file in ["app.db", "app.db-wal", "app.db-shm", "app.db-journal"] {
            assert!(!dir.path().join(file).exists(), "{file} left behind");
        }
        assert!(dir.path().join("other.db-wal").exists());

        // sidecars alone are still cleaned up
        fs::write(dir.path().join("app.db-wal"), b"x").unwrap();
        store.delete("app").unwrap();
        assert!(!dir.path().join("app.db-wal").exists());
    }
}
