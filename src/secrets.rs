//! Credential retrieval boundary.
//!
//! The original deployment pulls credentials from a managed vault; the
//! sync run only needs `get_secret(name)`, so that is the whole interface.
//! The default store resolves an environment variable first (so CI and
//! local runs need no file on disk), then falls back to a JSON object file
//! of `{"name": "value"}` pairs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("failed to read secrets file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

pub trait SecretStore {
    fn get_secret(&self, name: &str) -> Result<String, SecretError>;
}

/// Environment prefix checked before the secrets file.
///
/// `get_secret("api_token")` reads `CONTACT_SYNC_SECRET_API_TOKEN`.
const ENV_PREFIX: &str = "CONTACT_SYNC_SECRET_";

/// Default store: env var override, then a JSON secrets file.
pub struct FileSecretStore {
    path: PathBuf,
    cache: OnceLock<HashMap<String, String>>,
}

impl FileSecretStore {
    /// Create a store backed by `path`. The file is read lazily on first
    /// lookup that misses the environment, so an env-only setup never
    /// touches disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: OnceLock::new(),
        }
    }

    /// Conventional secrets file location.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".contact-sync")
            .join("secrets.json")
    }

    fn load_file(path: &Path) -> Result<HashMap<String, String>, SecretError> {
        let content = std::fs::read_to_string(path).map_err(|e| SecretError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SecretError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn from_env(name: &str) -> Option<String> {
        let key = format!("{}{}", ENV_PREFIX, name.to_uppercase());
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl SecretStore for FileSecretStore {
    fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        if let Some(value) = Self::from_env(name) {
            return Ok(value);
        }

        let secrets = match self.cache.get() {
            Some(cached) => cached,
            None => {
                if !self.path.exists() {
                    return Err(SecretError::SecretNotFound(name.to_string()));
                }
                let loaded = Self::load_file(&self.path)?;
                self.cache.get_or_init(|| loaded)
            }
        };

        secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::SecretNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_get_secret_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"api_token": "tok-123", "other": "x"}}"#).unwrap();

        let store = FileSecretStore::new(&path);
        assert_eq!(store.get_secret("api_token").unwrap(), "tok-123");
    }

    #[test]
    fn test_missing_secret_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "{}").unwrap();

        let store = FileSecretStore::new(&path);
        let err = store.get_secret("nonexistent_secret_zz").unwrap_err();
        assert!(matches!(err, SecretError::SecretNotFound(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let store = FileSecretStore::new("/nonexistent/secrets.json");
        let err = store.get_secret("api_token_zz_no_env").unwrap_err();
        assert!(matches!(err, SecretError::SecretNotFound(_)));
    }

    #[test]
    fn test_malformed_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileSecretStore::new(&path);
        let err = store.get_secret("api_token_zz_no_env").unwrap_err();
        assert!(matches!(err, SecretError::Unreadable { .. }));
    }
}
