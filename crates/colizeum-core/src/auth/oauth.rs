use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::api::ApiError;

use super::{AuthError, PkcePair};

pub const DEFAULT_AUTHORIZATION_URL: &str = "https://identity.colizeum.com/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://identity.colizeum.com/token";
pub const DEFAULT_REVOCATION_URL: &str = "https://identity.colizeum.com/token/revocation";
pub const DEFAULT_SCOPES: &[&str; 4] = &["openid", "offline_access", "profile", "email"];

const DEFAULT_USER_AGENT: &str = "colizeum-rs/0.1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth client configuration supplied by consumers.
///
/// This is a public client: there is no client secret anywhere in the
/// flow, only the PKCE proof.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    pub fn new<S: Into<String>>(client_id: S, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri,
            scopes: vec![],
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
}

/// Identity provider endpoints.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
    pub revocation_url: Url,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorization_url: Url::parse(DEFAULT_AUTHORIZATION_URL).unwrap(),
            token_url: Url::parse(DEFAULT_TOKEN_URL).unwrap(),
            revocation_url: Url::parse(DEFAULT_REVOCATION_URL).unwrap(),
        }
    }
}

/// Token payload returned by the provider on exchange and refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: i64,
}

/// Performs the token-endpoint exchanges with the identity provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: OAuthConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self, AuthError> {
        Self::with_endpoints(config, OAuthEndpoints::default())
    }

    pub fn with_endpoints(
        config: OAuthConfig,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(DEFAULT_USER_AGENT).build()?;
        Ok(Self {
            http,
            config,
            endpoints,
        })
    }

    /// Clone the OAuth client while overriding the redirect URI.
    pub fn clone_with_redirect(&self, redirect_uri: Url) -> Self {
        let mut config = self.config.clone();
        config.redirect_uri = redirect_uri;
        Self {
            http: self.http.clone(),
            config,
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// Build the authorization URL for one attempt.
    ///
    /// Parameter order matches what the provider's consent screen expects;
    /// `prompt=consent` forces re-approval so refresh tokens are reissued.
    pub fn authorization_url(&self, pkce: &PkcePair, state: &str) -> Result<Url, AuthError> {
        let mut url = self.endpoints.authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
            pairs.append_pair("scope", &self.config.scopes.join(" "));
            pairs.append_pair("state", state);
            pairs.append_pair("code_challenge", pkce.challenge());
            pairs.append_pair("code_challenge_method", "S256");
            pairs.append_pair("prompt", "consent");
        }
        Ok(url)
    }

    /// Exchange an authorization code for a token grant.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce: &PkcePair,
    ) -> Result<TokenGrant, AuthError> {
        let form = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_owned()),
            (
                "redirect_uri".to_string(),
                self.config.redirect_uri.to_string(),
            ),
            ("code_verifier".to_string(), pkce.verifier().to_owned()),
        ];

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .send()
            .await?;

        self.handle_token_response(response).await
    }

    /// Exchange a refresh token for a new grant.
    pub async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let form = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_owned()),
            (
                "redirect_uri".to_string(),
                self.config.redirect_uri.to_string(),
            ),
            ("scope".to_string(), self.config.scopes.join(" ")),
        ];

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        self.handle_token_response(response).await
    }

    /// Revoke a token at the provider.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let form = vec![("token".to_string(), token.to_owned())];

        let response = self
            .http
            .post(self.endpoints.revocation_url.clone())
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".into());
            return Err(ApiError::classify(status, &body).into());
        }
        Ok(())
    }

    async fn handle_token_response(
        &self,
        response: reqwest::Response,
    ) -> Result<TokenGrant, AuthError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".into());
            return Err(ApiError::classify(status, &body).into());
        }

        let grant: TokenGrant = response.json().await?;
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new().unwrap()
    }

    fn test_client(server: &MockServer) -> OAuthClient {
        let config = OAuthConfig::new(
            "client-id",
            Url::parse("http://127.0.0.1:50100/").unwrap(),
        )
        .with_scopes(DEFAULT_SCOPES.iter().copied());
        let endpoints = OAuthEndpoints {
            authorization_url: Url::parse("http://localhost/auth").unwrap(),
            token_url: Url::parse(&format!("{}{}", server.base_url(), "/token")).unwrap(),
            revocation_url: Url::parse(&format!("{}{}", server.base_url(), "/token/revocation"))
                .unwrap(),
        };
        OAuthClient::with_endpoints(config, endpoints).unwrap()
    }

    #[test]
    fn authorization_url_parameter_order() {
        let server = MockServer::start();
        let client = test_client(&server);
        let pkce = PkcePair::generate().unwrap();
        let url = client.authorization_url(&pkce, "state-123").unwrap();

        let keys: Vec<String> = url
            .query_pairs()
            .map(|(key, _)| key.into_owned())
            .collect();
        assert_eq!(
            keys,
            vec![
                "response_type",
                "client_id",
                "redirect_uri",
                "scope",
                "state",
                "code_challenge",
                "code_challenge_method",
                "prompt"
            ]
        );

        let find = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .unwrap()
        };
        assert_eq!(find("response_type"), "code");
        assert_eq!(find("scope"), "openid offline_access profile email");
        assert_eq!(find("code_challenge"), pkce.challenge());
        assert_eq!(find("code_challenge_method"), "S256");
        assert_eq!(find("prompt"), "consent");
    }

    #[test]
    fn exchange_code_success() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST)
                    .path("/token")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body_contains("grant_type=authorization_code")
                    .body_contains("code=code123")
                    .body_contains("code_verifier=");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "abc123",
                    "refresh_token": "refresh456",
                    "id_token": "id789",
                    "expires_in": 3600
                }));
            });

            let client = test_client(&server);
            let pkce = PkcePair::generate().unwrap();
            let grant = client.exchange_code("code123", &pkce).await.unwrap();
            mock.assert();
            assert_eq!(grant.access_token, "abc123");
            assert_eq!(grant.refresh_token.as_deref(), Some("refresh456"));
            assert_eq!(grant.id_token.as_deref(), Some("id789"));
            assert_eq!(grant.expires_in, 3600);
        });
    }

    #[test]
    fn refresh_grant_success() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=refresh_token")
                    .body_contains("refresh_token=refresh456")
                    .body_contains("scope=openid");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "new-access",
                    "refresh_token": "new-refresh",
                    "expires_in": 7200
                }));
            });

            let client = test_client(&server);
            let grant = client.refresh_grant("refresh456").await.unwrap();
            mock.assert();
            assert_eq!(grant.access_token, "new-access");
            assert_eq!(grant.refresh_token.as_deref(), Some("new-refresh"));
            assert!(grant.id_token.is_none());
        });
    }

    #[test]
    fn token_endpoint_error_is_classified() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST).path("/token");
                then.status(400).json_body_obj(&serde_json::json!({
                    "error": "invalid_request",
                    "error_description": "redirect mismatch"
                }));
            });

            let client = test_client(&server);
            let pkce = PkcePair::generate().unwrap();
            let err = client.exchange_code("bad", &pkce).await.unwrap_err();
            mock.assert();
            match err {
                AuthError::Api(ApiError::InvalidRequest(message)) => {
                    assert_eq!(message, "redirect mismatch");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }

    #[test]
    fn expired_refresh_token_maps_to_invalid_token() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            server.mock(|when, then| {
                when.method(POST).path("/token");
                then.status(401).json_body_obj(&serde_json::json!({
                    "error": "invalid_token",
                    "error_description": "refresh token expired"
                }));
            });

            let client = test_client(&server);
            let err = client.refresh_grant("stale").await.unwrap_err();
            assert!(matches!(
                err,
                AuthError::Api(ApiError::InvalidToken(ref message)) if message == "refresh token expired"
            ));
        });
    }

    #[test]
    fn revoke_posts_token() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST)
                    .path("/token/revocation")
                    .body_contains("token=refresh456");
                then.status(200);
            });

            let client = test_client(&server);
            client.revoke("refresh456").await.unwrap();
            mock.assert();
        });
    }
}
