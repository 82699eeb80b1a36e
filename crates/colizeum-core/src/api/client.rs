use std::sync::{Arc, Mutex as StdMutex};

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use url::Url;

use crate::auth::{OAuthClient, TokenStore, TokenVault};

use super::error::ApiError;
use super::models::{Earnings, Energy, EnergyConsumption, Item, SecondaryCurrency, User};

pub const DEFAULT_API_URL: &str = "https://api.colizeum.com";

const USER_AGENT: &str = "colizeum-rs/0.1.0";

/// Target environment for resource requests. Sandbox requests carry an
/// `X-Sandbox: true` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiMode {
    #[default]
    Sandbox,
    Production,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub mode: ApiMode,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_API_URL).unwrap(),
            mode: ApiMode::default(),
        }
    }
}

type SessionInvalidHook = Box<dyn Fn() + Send + Sync>;

struct ApiRequest {
    method: Method,
    path: &'static str,
    form: Vec<(String, String)>,
    requires_auth: bool,
}

impl ApiRequest {
    fn get(path: &'static str) -> Self {
        Self {
            method: Method::GET,
            path,
            form: Vec::new(),
            requires_auth: true,
        }
    }

    fn post(path: &'static str, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            path,
            form,
            requires_auth: true,
        }
    }
}

/// Typed client for the Colizeum resource API.
///
/// Requests carry the stored access token. A token rejection triggers one
/// refresh followed by one replay; a second rejection surfaces to the
/// caller. A failed refresh destroys the token store and notifies the
/// session-invalid hook.
pub struct ApiClient<V> {
    http: Client,
    config: ApiConfig,
    oauth: OAuthClient,
    tokens: Arc<Mutex<TokenStore<V>>>,
    on_session_invalid: Arc<StdMutex<Option<SessionInvalidHook>>>,
}

impl<V> Clone for ApiClient<V> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            config: self.config.clone(),
            oauth: self.oauth.clone(),
            tokens: Arc::clone(&self.tokens),
            on_session_invalid: Arc::clone(&self.on_session_invalid),
        }
    }
}

impl<V: TokenVault> ApiClient<V> {
    pub fn new(
        config: ApiConfig,
        oauth: OAuthClient,
        tokens: Arc<Mutex<TokenStore<V>>>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            config,
            oauth,
            tokens,
            on_session_invalid: Arc::new(StdMutex::new(None)),
        })
    }

    /// Register a hook fired when the session dies to a failed refresh.
    pub fn on_session_invalid<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut guard = self
            .on_session_invalid
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *guard = Some(Box::new(hook));
    }

    /// Profile of the signed-in account.
    pub async fn me(&self) -> Result<User, ApiError> {
        let response: Item<User> = self.execute(ApiRequest::get("/users/me")).await?;
        Ok(response.item)
    }

    /// Aggregate and per-token energy balance.
    pub async fn energy(&self) -> Result<Energy, ApiError> {
        let response: Item<Energy> = self.execute(ApiRequest::get("/funds/energy")).await?;
        Ok(response.item)
    }

    /// Spend energy, optionally against a specific owned token.
    pub async fn consume_energy(
        &self,
        amount: i64,
        token_id: Option<&str>,
    ) -> Result<EnergyConsumption, ApiError> {
        let mut form = vec![("amount".to_string(), amount.to_string())];
        if let Some(token_id) = token_id {
            form.push(("token_id".to_string(), token_id.to_string()));
        }
        let response: Item<EnergyConsumption> = self
            .execute(ApiRequest::post("/funds/energy/consume", form))
            .await?;
        Ok(response.item)
    }

    pub async fn secondary_currency(&self) -> Result<SecondaryCurrency, ApiError> {
        let response: Item<SecondaryCurrency> = self
            .execute(ApiRequest::get("/funds/secondary_currency"))
            .await?;
        Ok(response.item)
    }

    pub async fn earnings(&self) -> Result<Earnings, ApiError> {
        let response: Item<Earnings> = self.execute(ApiRequest::get("/funds/earnings")).await?;
        Ok(response.item)
    }

    async fn execute<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        match self.send_once(&request).await {
            Ok(value) => Ok(value),
            Err(err) if request.requires_auth && err.requires_refresh() => {
                tracing::debug!(error = %err, "access token rejected, attempting refresh");
                self.refresh_tokens().await?;
                // The replayed result is final, so one rejection can only
                // ever trigger one refresh.
                self.send_once(&request).await
            }
            Err(err) => Err(err),
        }
    }

    async fn send_once<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let url = self.config.base_url.join(request.path)?;
        let mut builder = self.http.request(request.method.clone(), url);
        if request.requires_auth {
            if let Some(token) = self.access_token().await {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
        }
        if self.config.mode == ApiMode::Sandbox {
            builder = builder.header("X-Sandbox", "true");
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::classify(status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn refresh_tokens(&self) -> Result<(), ApiError> {
        let mut store = self.tokens.lock().await;
        if let Err(err) = store.refresh(&self.oauth).await {
            tracing::warn!(error = %err, "token refresh failed, destroying session");
            if let Err(destroy_err) = store.destroy() {
                tracing::warn!(error = %destroy_err, "failed to clear token store");
            }
            drop(store);
            self.fire_session_invalid();
            return Err(ApiError::Refresh(Box::new(err)));
        }
        Ok(())
    }

    async fn access_token(&self) -> Option<String> {
        let store = self.tokens.lock().await;
        store.tokens().access_token().map(ToOwned::to_owned)
    }

    fn fire_session_invalid(&self) {
        let guard = self
            .on_session_invalid
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if let Some(hook) = guard.as_ref() {
            hook();
        }
    }
}
