use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;

use super::crypto::CryptoError;

/// Errors surfaced by the authorization flow and token management.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("system randomness unavailable: {0}")]
    CryptoUnavailable(String),
    #[error("callback strategy '{0}' is not supported on this platform")]
    PlatformNotSupported(&'static str),
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("authorization request denied ({0})")]
    CodeDenied(String),
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("timed out waiting for authorization callback")]
    Timeout,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("invalid authorization callback: {0}")]
    InvalidCallback(String),
    #[error("redirect strategy requires a configured redirect URI")]
    MissingRedirectUri,
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Api(ApiError::Network(err))
    }
}
