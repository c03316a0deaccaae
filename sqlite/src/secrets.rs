//! Secret material for encrypted databases.
//!
//! A [`SecretStore`] hands out the current secret and, for re-keying, the
//! pending new one. Once a re-key succeeds the controller promotes the new
//! secret so later opens use it.

use std::env;

use crate::error::{Result, StoreError};

/// Source of the current and pending database secrets.
pub trait SecretStore {
    /// The secret the database is currently keyed with.
    fn secret(&self) -> Result<String>;

    /// The secret the database should be re-keyed to.
    fn new_secret(&self) -> Result<String>;

    /// Returns `true` while a new secret is waiting to be applied.
    fn has_new_secret(&self) -> bool {
        self.new_secret().is_ok()
    }

    /// Makes the pending new secret the current one.
    fn promote_new_secret(&mut self) -> Result<()>;
}

fn require(value: Option<&str>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(StoreError::Secret(format!("no {what} available"))),
    }
}

/// Secrets held in memory.
///
/// # Examples
///
/// ```
/// use versioned_db_sqlite::{SecretStore, StaticSecretStore};
///
/// let mut store = StaticSecretStore::new("old").with_new_secret("new");
/// store.promote_new_secret().unwrap();
/// assert_eq!(store.secret().unwrap(), "new");
/// assert!(store.new_secret().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secret: Option<String>,
    new_secret: Option<String>,
}

impl StaticSecretStore {
    /// Creates a store holding `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            new_secret: None,
        }
    }

    /// Sets the pending new secret.
    pub fn with_new_secret(mut self, secret: impl Into<String>) -> Self {
        self.new_secret = Some(secret.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn secret(&self) -> Result<String> {
        require(self.secret.as_deref(), "secret")
    }

    fn new_secret(&self) -> Result<String> {
        require(self.new_secret.as_deref(), "new secret")
    }

    fn promote_new_secret(&mut self) -> Result<()> {
        let next = self.new_secret()?;
        self.secret = Some(next);
        self.new_secret = None;
        Ok(())
    }
}

/// Secrets read from environment variables.
///
/// Defaults to `VDB_SECRET` and `VDB_NEW_SECRET`. Promotion is kept in
/// memory; the environment is never written.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    secret_var: String,
    new_secret_var: String,
    promoted: Option<String>,
}

impl EnvSecretStore {
    /// Reads from the given variable names.
    pub fn new(secret_var: impl Into<String>, new_secret_var: impl Into<String>) -> Self {
        Self {
            secret_var: secret_var.into(),
            new_secret_var: new_secret_var.into(),
            promoted: None,
        }
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new("VDB_SECRET", "VDB_NEW_SECRET")
    }
}

impl SecretStore for EnvSecretStore {
    fn secret(&self) -> Result<String> {
        if let Some(promoted) = &self.promoted {
            return Ok(promoted.clone());
        }
        require(env::var(&self.secret_var).ok().as_deref(), &self.secret_var)
    }

    fn new_secret(&self) -> Result<String> {
        require(
            env::var(&self.new_secret_var).ok().as_deref(),
            &self.new_secret_var,
        )
    }

    fn has_new_secret(&self) -> bool {
        self.new_secret()
            .is_ok_and(|next| self.promoted.as_deref() != Some(next.as_str()))
    }

    fn promote_new_secret(&mut self) -> Result<()> {
        self.promoted = Some(self.new_secret()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_store_requires_values() {
        let store = StaticSecretStore::default();
        assert!(matches!(store.secret(), Err(StoreError::Secret(_))));
        assert!(StaticSecretStore::new("").secret().is_err());
    }

    #[test]
    fn test_promote_without_new_secret_keeps_current() {
        let mut store = StaticSecretStore::new("old");
        assert!(store.promote_new_secret().is_err());
        assert_eq!(store.secret().unwrap(), "old");
    }

    #[test]
    fn test_promotion_clears_pending_secret() {
        let mut store = StaticSecretStore::new("old").with_new_secret("new");
        assert!(store.has_new_secret());
        store.promote_new_secret().unwrap();
        assert!(!store.has_new_secret());
    }

    #[test]
    fn test_env_store_missing_variable() {
        let store = EnvSecretStore::new("VDB_TEST_UNSET_SECRET", "VDB_TEST_UNSET_NEW");
        let err = store.secret().unwrap_err();
        assert!(err.to_string().contains("VDB_TEST_UNSET_SECRET"));
    }
}
