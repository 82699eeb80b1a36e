use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use url::Url;

use crate::api::{ApiClient, User};
use crate::config::SdkConfig;

use super::callback::{parse_deep_link, CallbackSink, CallbackStrategy, CodeResponse};
use super::crypto::TokenCipher;
use super::loopback::LoopbackServer;
use super::oauth::{OAuthClient, OAuthConfig};
use super::pkce::{self, PkcePair};
use super::token_store::{FileTokenVault, TokenStore, TokenVault};
use super::AuthError;

const STATE_LEN: usize = 32;

/// Observable phase of the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingCallback,
    ExchangingCode,
    FetchingProfile,
    LoggedIn,
    Failed,
}

/// Per-call knobs for [`Session::login`].
#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// Open the authorization URL in the system browser.
    pub open_browser: bool,
    /// Activation URL the process was launched with, for deep-link hosts.
    /// A matching URL resolves the attempt without opening a browser.
    pub launch_url: Option<String>,
    /// Upper bound on the callback wait. Without one the wait is unbounded.
    pub timeout: Option<Duration>,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            open_browser: true,
            launch_url: None,
            timeout: None,
        }
    }
}

/// An authenticated session against the Colizeum platform.
///
/// Owns the OAuth client, the encrypted token store, and the resource API
/// client. Hosts create one per profile; nothing here is global.
pub struct Session<V> {
    oauth: OAuthClient,
    api: ApiClient<V>,
    tokens: Arc<Mutex<TokenStore<V>>>,
    strategy: CallbackStrategy,
    sink: CallbackSink,
    loopback: Option<LoopbackServer>,
    state: SessionState,
    user: Option<User>,
}

impl Session<FileTokenVault> {
    /// Build a session persisting tokens in the user configuration directory.
    pub fn new(config: SdkConfig) -> Result<Self, AuthError> {
        let vault = FileTokenVault::with_default_locator()?;
        Self::with_vault(config, vault)
    }
}

impl<V: TokenVault> Session<V> {
    /// Build a session over a custom token vault.
    pub fn with_vault(config: SdkConfig, vault: V) -> Result<Self, AuthError> {
        let redirect_uri = config.callback.redirect_uri(config.redirect_uri.as_ref())?;
        let oauth_config =
            OAuthConfig::new(config.client_id, redirect_uri).with_scopes(config.scopes);
        let oauth = OAuthClient::with_endpoints(oauth_config, config.endpoints)?;
        let cipher = TokenCipher::derive(config.storage.passphrase(), config.storage.salt())?;
        let tokens = TokenStore::open(vault, cipher, config.profile)?;
        let tokens = Arc::new(Mutex::new(tokens));
        let api = ApiClient::new(config.api, oauth.clone(), Arc::clone(&tokens))?;

        Ok(Self {
            oauth,
            api,
            tokens,
            strategy: config.callback,
            sink: CallbackSink::new(),
            loopback: None,
            state: SessionState::Idle,
            user: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::LoggedIn
    }

    /// Profile fetched by the last successful login.
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Resource API client bound to this session's tokens.
    pub fn api(&self) -> &ApiClient<V> {
        &self.api
    }

    /// Sink for hosts that receive callback URLs themselves, such as
    /// deep-link activations or embedded redirect views.
    pub fn callback_sink(&self) -> CallbackSink {
        self.sink.clone()
    }

    pub fn token_store(&self) -> Arc<Mutex<TokenStore<V>>> {
        Arc::clone(&self.tokens)
    }

    /// Run the login flow to completion.
    ///
    /// `notify` receives the authorization URL before any waiting starts,
    /// whether or not a browser is opened. Stored tokens that are still
    /// valid or refreshable skip the interactive flow entirely.
    pub async fn login<F>(&mut self, options: LoginOptions, notify: F) -> Result<User, AuthError>
    where
        F: FnOnce(&Url) -> Result<(), AuthError>,
    {
        match self.try_login(options, notify).await {
            Ok(user) => {
                self.state = SessionState::LoggedIn;
                self.user = Some(user.clone());
                Ok(user)
            }
            Err(err) => {
                self.sink.disarm();
                if let Some(mut server) = self.loopback.take() {
                    server.stop();
                }
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    async fn try_login<F>(&mut self, options: LoginOptions, notify: F) -> Result<User, AuthError>
    where
        F: FnOnce(&Url) -> Result<(), AuthError>,
    {
        let has_session = {
            let store = self.tokens.lock().await;
            store.is_valid() || store.can_be_refreshed()
        };
        if has_session {
            self.state = SessionState::FetchingProfile;
            return Ok(self.api.me().await?);
        }

        let pkce = PkcePair::generate()?;
        let state_token = pkce::random_state(STATE_LEN);

        enum Pending {
            Ready(CodeResponse),
            Wait(oneshot::Receiver<Result<CodeResponse, AuthError>>),
        }

        let mut oauth = self.oauth.clone();
        let pending = match self.strategy.clone() {
            CallbackStrategy::Loopback { port } => {
                if let Some(server) = self.loopback.take() {
                    server.shutdown().await;
                }
                let (server, rx) = LoopbackServer::start(port).await?;
                oauth = self.oauth.clone_with_redirect(server.redirect_uri()?);
                self.loopback = Some(server);
                Pending::Wait(rx)
            }
            CallbackStrategy::DeepLink { scheme } => {
                let cold_start = match options.launch_url.as_deref() {
                    Some(raw) => parse_deep_link(raw, &scheme)?,
                    None => None,
                };
                match cold_start {
                    Some(response) => Pending::Ready(response),
                    None => Pending::Wait(self.sink.arm()),
                }
            }
            CallbackStrategy::Redirect => Pending::Wait(self.sink.arm()),
        };

        let response = match pending {
            Pending::Ready(response) => response,
            Pending::Wait(rx) => {
                let auth_url = oauth.authorization_url(&pkce, &state_token)?;
                notify(&auth_url)?;
                if options.open_browser {
                    open::that(auth_url.as_str())
                        .map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
                }
                self.state = SessionState::AwaitingCallback;
                await_callback(rx, options.timeout).await?
            }
        };

        if let Some(server) = self.loopback.take() {
            server.shutdown().await;
        }

        if response.state.as_deref() != Some(state_token.as_str()) {
            return Err(AuthError::StateMismatch);
        }

        self.state = SessionState::ExchangingCode;
        let grant = oauth.exchange_code(&response.code, &pkce).await?;
        {
            let mut store = self.tokens.lock().await;
            store.create(&grant)?;
        }

        self.state = SessionState::FetchingProfile;
        Ok(self.api.me().await?)
    }

    /// Revoke the refresh token with the provider and clear local state.
    ///
    /// Revocation failures are logged; local destruction happens regardless.
    pub async fn logout(&mut self) -> Result<(), AuthError> {
        {
            let mut store = self.tokens.lock().await;
            let refresh = store.tokens().refresh_token().map(ToOwned::to_owned);
            if let Some(refresh) = refresh {
                if let Err(err) = self.oauth.revoke(&refresh).await {
                    tracing::warn!(error = %err, "token revocation failed, clearing local session anyway");
                }
            }
            store.destroy()?;
        }

        self.sink.disarm();
        if let Some(server) = self.loopback.take() {
            server.shutdown().await;
        }
        self.user = None;
        self.state = SessionState::Idle;
        Ok(())
    }
}

async fn await_callback(
    rx: oneshot::Receiver<Result<CodeResponse, AuthError>>,
    timeout: Option<Duration>,
) -> Result<CodeResponse, AuthError> {
    let received = match timeout {
        Some(limit) => tokio::time::timeout(limit, rx)
            .await
            .map_err(|_| AuthError::Timeout)?,
        None => rx.await,
    };
    match received {
        Ok(result) => result,
        Err(_) => Err(AuthError::ListenerClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiConfig, ApiMode};
    use crate::auth::{MemoryVault, OAuthEndpoints, TokenGrant};
    use crate::config::StorageKey;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(server: &MockServer) -> SdkConfig {
        let endpoints = OAuthEndpoints {
            authorization_url: Url::parse(&server.url("/auth")).unwrap(),
            token_url: Url::parse(&server.url("/token")).unwrap(),
            revocation_url: Url::parse(&server.url("/token/revocation")).unwrap(),
        };
        let api = ApiConfig {
            base_url: Url::parse(&server.base_url()).unwrap(),
            mode: ApiMode::Sandbox,
        };
        SdkConfig::new("test-client", StorageKey::new("test-pass", "unit-test-salt"))
            .with_endpoints(endpoints)
            .with_api(api)
            .with_callback(CallbackStrategy::Loopback { port: 0 })
    }

    fn user_json() -> serde_json::Value {
        serde_json::json!({
            "item": {
                "id": "user-1",
                "email": "ada@example.com",
                "username": "ada",
                "created_at": "2024-01-01T00:00:00Z",
                "energy": { "total_energy": 5, "max_energy": 10, "tokens": [] },
                "secondaryCurrency": { "total": 1.5 }
            }
        })
    }

    fn query_param(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Plays the browser: hits the loopback redirect with an authorization
    /// code, overriding the state parameter when asked to.
    fn drive_callback(auth_url: &Url, code: &str, state_override: Option<&str>) {
        let redirect = query_param(auth_url, "redirect_uri").expect("redirect_uri param");
        let redirect = Url::parse(&redirect).expect("redirect uri parses");
        let state = match state_override {
            Some(value) => value.to_owned(),
            None => query_param(auth_url, "state").expect("state param"),
        };
        let target = format!(
            "{}:{}",
            redirect.host_str().expect("redirect host"),
            redirect.port().expect("redirect port")
        );
        let path = format!("/?code={code}&state={state}");
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(target).await.expect("connect to loopback");
            let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
            stream
                .write_all(request.as_bytes())
                .await
                .expect("send callback");
            let mut body = Vec::new();
            let _ = stream.read_to_end(&mut body).await;
        });
    }

    #[tokio::test]
    async fn login_via_loopback_end_to_end() {
        let server = MockServer::start();
        let token_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=authorization_code")
                .body_contains("code=test-code")
                .body_contains("code_verifier=");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "acc-1",
                "refresh_token": "ref-1",
                "expires_in": 3600
            }));
        });
        let me_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/users/me")
                .header("authorization", "Bearer acc-1");
            then.status(200).json_body_obj(&user_json());
        });

        let mut session = Session::with_vault(test_config(&server), MemoryVault::new()).unwrap();
        let options = LoginOptions {
            open_browser: false,
            ..Default::default()
        };
        let user = session
            .login(options, |url| {
                drive_callback(url, "test-code", None);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(user.id, "user-1");
        assert_eq!(user.username.as_deref(), Some("ada"));
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert!(session.is_logged_in());
        assert_eq!(session.user().map(|u| u.id.as_str()), Some("user-1"));
        token_mock.assert();
        me_mock.assert();
        assert!(session.token_store().lock().await.is_valid());
    }

    #[tokio::test]
    async fn login_with_valid_tokens_skips_flow() {
        let server = MockServer::start();
        let me_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/users/me")
                .header("authorization", "Bearer acc-live");
            then.status(200).json_body_obj(&user_json());
        });

        let mut session = Session::with_vault(test_config(&server), MemoryVault::new()).unwrap();
        {
            let store = session.token_store();
            let mut store = store.lock().await;
            store
                .create(&TokenGrant {
                    access_token: "acc-live".into(),
                    refresh_token: Some("ref-live".into()),
                    id_token: None,
                    expires_in: 3600,
                })
                .unwrap();
        }

        let options = LoginOptions {
            open_browser: false,
            ..Default::default()
        };
        let user = session
            .login(options, |_| panic!("interactive flow should not start"))
            .await
            .unwrap();

        assert_eq!(user.id, "user-1");
        assert_eq!(session.state(), SessionState::LoggedIn);
        me_mock.assert();
    }

    #[tokio::test]
    async fn state_mismatch_then_clean_retry() {
        let server = MockServer::start();
        let token_mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "acc-1",
                "refresh_token": "ref-1",
                "expires_in": 3600
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/users/me");
            then.status(200).json_body_obj(&user_json());
        });

        let mut session = Session::with_vault(test_config(&server), MemoryVault::new()).unwrap();
        let options = LoginOptions {
            open_browser: false,
            ..Default::default()
        };

        let err = session
            .login(options.clone(), |url| {
                drive_callback(url, "test-code", Some("forged-state"));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));
        assert_eq!(session.state(), SessionState::Failed);
        // The forged callback never reached the token endpoint.
        assert_eq!(token_mock.hits(), 0);

        // A fresh attempt generates fresh proof values and succeeds.
        let user = session
            .login(options, |url| {
                drive_callback(url, "test-code", None);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(user.id, "user-1");
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert_eq!(token_mock.hits(), 1);
    }

    #[tokio::test]
    async fn login_timeout_fails_cleanly() {
        let server = MockServer::start();
        let mut session = Session::with_vault(test_config(&server), MemoryVault::new()).unwrap();
        let options = LoginOptions {
            open_browser: false,
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let err = session.login(options, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn deep_link_login_via_sink() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token").body_contains("code=dl-code");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "acc-1",
                "refresh_token": "ref-1",
                "expires_in": 3600
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/users/me");
            then.status(200).json_body_obj(&user_json());
        });

        let config = test_config(&server).with_callback(CallbackStrategy::DeepLink {
            scheme: "colizeumtest".to_owned(),
        });
        let mut session = Session::with_vault(config, MemoryVault::new()).unwrap();
        let sink = session.callback_sink();

        let options = LoginOptions {
            open_browser: false,
            ..Default::default()
        };
        let user = session
            .login(options, move |url| {
                let state = query_param(url, "state").expect("state param");
                let link = format!("colizeumtest://colizeum-auth?code=dl-code&state={state}");
                assert!(sink.deliver_deep_link(&link, "colizeumtest"));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(user.id, "user-1");
        assert_eq!(session.state(), SessionState::LoggedIn);
    }

    #[tokio::test]
    async fn cold_start_denial_fails_without_browser() {
        let server = MockServer::start();
        let config = test_config(&server).with_callback(CallbackStrategy::DeepLink {
            scheme: "colizeumtest".to_owned(),
        });
        let mut session = Session::with_vault(config, MemoryVault::new()).unwrap();

        let options = LoginOptions {
            open_browser: false,
            launch_url: Some(
                "colizeumtest://colizeum-auth?error=access_denied&error_description=user%20cancelled"
                    .to_owned(),
            ),
            ..Default::default()
        };
        let err = session
            .login(options, |_| panic!("browser flow must not start"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::CodeDenied(_)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn cold_start_code_with_stale_state_is_rejected() {
        let server = MockServer::start();
        let config = test_config(&server).with_callback(CallbackStrategy::DeepLink {
            scheme: "colizeumtest".to_owned(),
        });
        let mut session = Session::with_vault(config, MemoryVault::new()).unwrap();

        // The code was minted for a previous process, so its state can
        // never match the fresh attempt.
        let options = LoginOptions {
            open_browser: false,
            launch_url: Some(
                "colizeumtest://colizeum-auth?code=old-code&state=old-state".to_owned(),
            ),
            ..Default::default()
        };
        let err = session
            .login(options, |_| panic!("browser flow must not start"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::StateMismatch));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn foreign_cold_start_proceeds_to_interactive_wait() {
        let server = MockServer::start();
        let config = test_config(&server).with_callback(CallbackStrategy::DeepLink {
            scheme: "colizeumtest".to_owned(),
        });
        let mut session = Session::with_vault(config, MemoryVault::new()).unwrap();

        let notified = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&notified);
        let options = LoginOptions {
            open_browser: false,
            launch_url: Some("https://example.com/welcome".to_owned()),
            timeout: Some(Duration::from_millis(50)),
        };
        let err = session
            .login(options, move |_| {
                seen.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Timeout));
        assert!(notified.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn logout_revokes_and_destroys() {
        let server = MockServer::start();
        let revoke_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token/revocation")
                .body_contains("token=ref-live");
            then.status(200);
        });

        let mut session = Session::with_vault(test_config(&server), MemoryVault::new()).unwrap();
        {
            let store = session.token_store();
            let mut store = store.lock().await;
            store
                .create(&TokenGrant {
                    access_token: "acc-live".into(),
                    refresh_token: Some("ref-live".into()),
                    id_token: None,
                    expires_in: 3600,
                })
                .unwrap();
        }

        session.logout().await.unwrap();
        assert!(!session.token_store().lock().await.exists());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.user().is_none());

        // A second logout has no refresh token left to revoke.
        session.logout().await.unwrap();
        revoke_mock.assert();
    }

    #[tokio::test]
    async fn logout_survives_revocation_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token/revocation");
            then.status(503).body("unavailable");
        });

        let mut session = Session::with_vault(test_config(&server), MemoryVault::new()).unwrap();
        {
            let store = session.token_store();
            let mut store = store.lock().await;
            store
                .create(&TokenGrant {
                    access_token: "acc-live".into(),
                    refresh_token: Some("ref-live".into()),
                    id_token: None,
                    expires_in: 3600,
                })
                .unwrap();
        }

        session.logout().await.unwrap();
        assert!(!session.token_store().lock().await.exists());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
