use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

pub const TMDB_API_KEY_ENV: &str = "TMDB_API_KEY";
pub const TMDB_BEARER_TOKEN_ENV: &str = "TMDB_BEARER_TOKEN";

const TMDB_API_KEY: &str = "tmdb_api_key";
const TMDB_BEARER_TOKEN: &str = "tmdb_bearer_token";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no TMDB credentials found: set {TMDB_API_KEY_ENV} or {TMDB_BEARER_TOKEN_ENV}, or run `cinesync config credentials`")]
    MissingTmdb,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CredentialsData {
    #[serde(flatten)]
    data: HashMap<String, String>,
}

/// Resolved TMDB credentials. At least one of the two is present.
#[derive(Clone, PartialEq, Eq)]
pub struct TmdbCredentials {
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

impl std::fmt::Debug for TmdbCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmdbCredentials")
            .field("api_key", &self.api_key.as_deref().map(mask))
            .field("bearer_token", &self.bearer_token.as_deref().map(mask))
            .finish()
    }
}

/// Keep the last four characters, hide the rest.
pub fn mask(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", visible)
    }
}

pub struct CredentialStore {
    path: PathBuf,
    credentials: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            credentials: HashMap::new(),
        }
    }

    pub fn load(&mut self) -> Result<()> {
        if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)?;
            let creds_data: CredentialsData = toml::from_str(&content)?;
            self.credentials = creds_data.data;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let creds_data = CredentialsData {
            data: self.credentials.clone(),
        };
        let content = toml::to_string_pretty(&creds_data)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.credentials.get(key)
    }

    pub fn set(&mut self, key: String, value: String) {
        self.credentials.insert(key, value);
    }

    pub fn get_tmdb_api_key(&self) -> Option<&String> {
        self.get(TMDB_API_KEY)
    }

    pub fn set_tmdb_api_key(&mut self, key: String) {
        self.set(TMDB_API_KEY.to_string(), key);
    }

    pub fn get_tmdb_bearer_token(&self) -> Option<&String> {
        self.get(TMDB_BEARER_TOKEN)
    }

    pub fn set_tmdb_bearer_token(&mut self, token: String) {
        self.set(TMDB_BEARER_TOKEN.to_string(), token);
    }

    /// Resolve TMDB credentials, letting the environment override the file.
    pub fn tmdb_credentials(&self) -> Result<TmdbCredentials, CredentialError> {
        self.tmdb_credentials_with(|name| std::env::var(name).ok())
    }

    fn tmdb_credentials_with<F>(&self, env: F) -> Result<TmdbCredentials, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let api_key = non_empty(env(TMDB_API_KEY_ENV)).or_else(|| non_empty(self.get_tmdb_api_key().cloned()));
        let bearer_token =
            non_empty(env(TMDB_BEARER_TOKEN_ENV)).or_else(|| non_empty(self.get_tmdb_bearer_token().cloned()));

        if api_key.is_none() && bearer_token.is_none() {
            return Err(CredentialError::MissingTmdb);
        }
        Ok(TmdbCredentials { api_key, bearer_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_credential_store_load_and_save() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        let mut store = CredentialStore::new(path.clone());
        store.set_tmdb_api_key("abc123".to_string());
        store.set_tmdb_bearer_token("eyJhbGciOi".to_string());
        store.save().unwrap();

        let mut loaded_store = CredentialStore::new(path);
        loaded_store.load().unwrap();
        assert_eq!(loaded_store.get_tmdb_api_key(), Some(&"abc123".to_string()));
        assert_eq!(loaded_store.get_tmdb_bearer_token(), Some(&"eyJhbGciOi".to_string()));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut store = CredentialStore::new(PathBuf::from("/tmp/unused"));
        store.set_tmdb_api_key("from-file".to_string());

        let creds = store
            .tmdb_credentials_with(|name| (name == TMDB_API_KEY_ENV).then(|| "from-env".to_string()))
            .unwrap();
        assert_eq!(creds.api_key.as_deref(), Some("from-env"));
        assert_eq!(creds.bearer_token, None);
    }

    #[test]
    fn test_missing_credentials_is_an_error() {
        let mut store = CredentialStore::new(PathBuf::from("/tmp/unused"));
        store.set_tmdb_api_key("   ".to_string());

        let result = store.tmdb_credentials_with(|_| None);
        assert!(matches!(result, Err(CredentialError::MissingTmdb)));
    }

    #[test]
    fn test_mask_hides_secret() {
        assert_eq!(mask("abcdef123456"), "****3456");
        assert_eq!(mask("abc"), "****");
        let creds = TmdbCredentials {
            api_key: Some("abcdef123456".to_string()),
            bearer_token: None,
        };
        assert!(!format!("{:?}", creds).contains("abcdef"));
    }
}
