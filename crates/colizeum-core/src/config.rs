use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

use crate::api::ApiConfig;
use crate::auth::{CallbackStrategy, OAuthEndpoints, DEFAULT_SCOPES};

pub const STORAGE_KEY_ENV: &str = "COLIZEUM_RS_STORAGE_KEY";
pub const STORAGE_SALT_ENV: &str = "COLIZEUM_RS_STORAGE_SALT";

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("com", "colizeum", "colizeum-rs")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    /// Path to the encrypted token file for the given profile.
    pub fn tokens_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("tokens-{profile}.json"))
    }

    #[cfg(test)]
    pub(crate) fn from_root_for_tests(root: PathBuf) -> Self {
        Self { root }
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur when assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for colizeum-rs")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// Key material for the at-rest token cipher.
///
/// Both values come from the embedding application or its environment,
/// never from constants compiled into this crate.
#[derive(Clone)]
pub struct StorageKey {
    passphrase: String,
    salt: String,
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey")
            .field("passphrase", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

impl StorageKey {
    pub fn new(passphrase: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            salt: salt.into(),
        }
    }

    /// Read key material from `COLIZEUM_RS_STORAGE_KEY` / `COLIZEUM_RS_STORAGE_SALT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let passphrase = require_env(STORAGE_KEY_ENV)?;
        let salt = require_env(STORAGE_SALT_ENV)?;
        Ok(Self { passphrase, salt })
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

/// Aggregate configuration for a [`Session`](crate::auth::Session).
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub endpoints: OAuthEndpoints,
    pub api: ApiConfig,
    pub callback: CallbackStrategy,
    /// Redirect URI for [`CallbackStrategy::Redirect`]; derived from the
    /// strategy otherwise.
    pub redirect_uri: Option<Url>,
    pub storage: StorageKey,
    pub profile: String,
}

impl SdkConfig {
    pub fn new(client_id: impl Into<String>, storage: StorageKey) -> Self {
        Self {
            client_id: client_id.into(),
            scopes: DEFAULT_SCOPES
                .iter()
                .map(|scope| scope.to_string())
                .collect(),
            endpoints: OAuthEndpoints::default(),
            api: ApiConfig::default(),
            callback: CallbackStrategy::default(),
            redirect_uri: None,
            storage,
            profile: "default".to_owned(),
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }

    pub fn with_callback(mut self, callback: CallbackStrategy) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: Url) -> Self {
        self.redirect_uri = Some(redirect_uri);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }
}
