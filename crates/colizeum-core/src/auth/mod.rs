mod callback;
mod crypto;
mod error;
mod loopback;
mod oauth;
mod pkce;
mod session;
mod token_store;

pub use callback::{
    parse_deep_link, CallbackSink, CallbackStrategy, CodeResponse, DEEP_LINK_HOST,
    DEFAULT_LOOPBACK_PORT,
};
pub use crypto::{CryptoError, EncryptedData, TokenCipher};
pub use error::AuthError;
pub use loopback::LoopbackServer;
pub use oauth::{
    OAuthClient, OAuthConfig, OAuthEndpoints, TokenGrant, DEFAULT_AUTHORIZATION_URL,
    DEFAULT_REVOCATION_URL, DEFAULT_SCOPES, DEFAULT_TOKEN_URL,
};
pub use pkce::PkcePair;
pub use session::{LoginOptions, Session, SessionState};
pub use token_store::{
    FileTokenVault, MemoryVault, StoredTokens, TokenStore, TokenVault, Tokens,
    REFRESH_TOKEN_TTL_SECS,
};
