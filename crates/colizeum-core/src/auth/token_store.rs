use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::ConfigLocator;

use super::crypto::{CryptoError, TokenCipher};
use super::oauth::{OAuthClient, TokenGrant};
use super::AuthError;

/// Fixed lifetime granted to refresh tokens at creation. The provider does
/// not report one, so a 14 day policy window is applied locally.
pub const REFRESH_TOKEN_TTL_SECS: i64 = 14 * 24 * 60 * 60;

/// Decrypted, in-memory view of the persisted tokens.
#[derive(Debug, Clone, Default)]
pub struct Tokens {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    access_expires_at: i64,
    refresh_expires_at: i64,
}

impl Tokens {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    /// Unix second at which the access token stops being valid.
    pub fn access_expires_at(&self) -> i64 {
        self.access_expires_at
    }

    /// Unix second at which the refresh token stops being usable.
    pub fn refresh_expires_at(&self) -> i64 {
        self.refresh_expires_at
    }

    /// Whether the access token is present and unexpired at `now`.
    pub fn valid_at(&self, now: i64) -> bool {
        self.access_token.is_some() && now < self.access_expires_at
    }

    /// Whether the refresh token is present and unexpired at `now`.
    pub fn refreshable_at(&self, now: i64) -> bool {
        self.refresh_token.is_some() && now < self.refresh_expires_at
    }
}

/// Persisted record: three cipher payloads and two plain expiries.
/// Absent tokens are stored as empty strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

/// Persistence abstraction for the encrypted token record.
pub trait TokenVault {
    fn read(&self, profile: &str) -> Result<Option<StoredTokens>, AuthError>;
    fn write(&self, profile: &str, tokens: &StoredTokens) -> Result<(), AuthError>;
    fn clear(&self, profile: &str) -> Result<(), AuthError>;
}

/// Filesystem vault storing the record in the user configuration directory.
pub struct FileTokenVault {
    locator: ConfigLocator,
}

impl FileTokenVault {
    pub fn new(locator: ConfigLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(payload.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o600);
            fs::set_permissions(path, perm)?;
        }

        Ok(())
    }
}

impl TokenVault for FileTokenVault {
    fn read(&self, profile: &str) -> Result<Option<StoredTokens>, AuthError> {
        let path = self.locator.tokens_file(profile);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let envelope: VaultEnvelope = serde_json::from_str(&raw)?;
        Ok(Some(envelope.tokens))
    }

    fn write(&self, profile: &str, tokens: &StoredTokens) -> Result<(), AuthError> {
        let path = self.locator.tokens_file(profile);
        let envelope = VaultEnvelope {
            version: 1,
            profile: profile.to_owned(),
            tokens: tokens.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        Self::write_file(&path, &payload)
    }

    fn clear(&self, profile: &str) -> Result<(), AuthError> {
        let path = self.locator.tokens_file(profile);
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultEnvelope {
    version: u32,
    profile: String,
    tokens: StoredTokens,
}

/// In-memory vault for tests and hosts that keep sessions ephemeral.
#[derive(Clone, Default)]
pub struct MemoryVault {
    inner: Arc<StdMutex<Option<StoredTokens>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenVault for MemoryVault {
    fn read(&self, _profile: &str) -> Result<Option<StoredTokens>, AuthError> {
        let guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        Ok(guard.clone())
    }

    fn write(&self, _profile: &str, tokens: &StoredTokens) -> Result<(), AuthError> {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        *guard = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self, _profile: &str) -> Result<(), AuthError> {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        *guard = None;
        Ok(())
    }
}

/// Owns the encrypted token record and its decrypted in-memory view.
///
/// Every mutation goes through the vault and re-derives the view from what
/// was actually persisted, so the two can never disagree after a write.
pub struct TokenStore<V> {
    vault: V,
    cipher: TokenCipher,
    profile: String,
    memory: Tokens,
}

impl<V: TokenVault> TokenStore<V> {
    /// Open the store and decrypt any persisted record into memory.
    pub fn open(vault: V, cipher: TokenCipher, profile: impl Into<String>) -> Result<Self, AuthError> {
        let mut store = Self {
            vault,
            cipher,
            profile: profile.into(),
            memory: Tokens::default(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-derive the in-memory view from the persisted record.
    pub fn reload(&mut self) -> Result<(), AuthError> {
        let stored = self.vault.read(&self.profile)?;
        self.memory = match stored {
            Some(record) => self.decrypt_record(&record)?,
            None => Tokens::default(),
        };
        Ok(())
    }

    pub fn tokens(&self) -> &Tokens {
        &self.memory
    }

    /// Whether an access token is currently held for this profile.
    pub fn exists(&self) -> bool {
        self.memory.access_token.is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.memory.valid_at(unix_now())
    }

    pub fn can_be_refreshed(&self) -> bool {
        self.memory.refreshable_at(unix_now())
    }

    /// Encrypt and persist a token grant, then refresh the in-memory view.
    ///
    /// The access token is always stored. Refresh and id tokens are blanked
    /// when the grant carries no refresh token, so a refresh-less grant
    /// still yields a usable session until its access token expires.
    pub fn create(&mut self, grant: &TokenGrant) -> Result<(), AuthError> {
        let record = self.encrypt_record(grant, unix_now())?;
        self.vault.write(&self.profile, &record)?;
        self.reload()
    }

    /// Remove the persisted record and clear the in-memory view.
    pub fn destroy(&mut self) -> Result<(), AuthError> {
        self.vault.clear(&self.profile)?;
        self.memory = Tokens::default();
        Ok(())
    }

    /// Exchange the refresh token for a new grant and persist it.
    ///
    /// The in-memory access token is dropped before the network call so a
    /// failed refresh can never leave a stale token in use.
    pub async fn refresh(&mut self, oauth: &OAuthClient) -> Result<(), AuthError> {
        self.memory.access_token = None;
        let refresh_token = self
            .memory
            .refresh_token
            .clone()
            .ok_or(AuthError::MissingRefreshToken)?;
        let grant = oauth.refresh_grant(&refresh_token).await?;
        self.create(&grant)
    }

    fn encrypt_record(&self, grant: &TokenGrant, now: i64) -> Result<StoredTokens, AuthError> {
        let access_token = self.cipher.encrypt_to_string(grant.access_token.as_bytes())?;
        let (refresh_token, id_token) = match grant.refresh_token.as_deref() {
            Some(refresh) if !refresh.is_empty() => {
                let refresh = self.cipher.encrypt_to_string(refresh.as_bytes())?;
                let id = match grant.id_token.as_deref() {
                    Some(id) if !id.is_empty() => self.cipher.encrypt_to_string(id.as_bytes())?,
                    _ => String::new(),
                };
                (refresh, id)
            }
            _ => (String::new(), String::new()),
        };
        Ok(StoredTokens {
            access_token,
            refresh_token,
            id_token,
            access_expires_at: now + grant.expires_in,
            refresh_expires_at: now + REFRESH_TOKEN_TTL_SECS,
        })
    }

    fn decrypt_record(&self, record: &StoredTokens) -> Result<Tokens, AuthError> {
        Ok(Tokens {
            access_token: self.decrypt_field(&record.access_token)?,
            refresh_token: self.decrypt_field(&record.refresh_token)?,
            id_token: self.decrypt_field(&record.id_token)?,
            access_expires_at: record.access_expires_at,
            refresh_expires_at: record.refresh_expires_at,
        })
    }

    fn decrypt_field(&self, value: &str) -> Result<Option<String>, AuthError> {
        if value.is_empty() {
            return Ok(None);
        }
        let bytes = self.cipher.decrypt_from_string(value)?;
        let token = String::from_utf8(bytes)
            .map_err(|err| AuthError::Crypto(CryptoError::Payload(err.to_string())))?;
        Ok(Some(token))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
