use reqwest::StatusCode;
use serde::Deserialize;

use crate::auth::AuthError;

/// Errors surfaced by the resource API client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("provider error {status}: {message}")]
    Provider { status: StatusCode, message: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("token refresh failed: {0}")]
    Refresh(Box<AuthError>),
}

/// OAuth-style error body: `{"error": ..., "error_description": ...}`.
#[derive(Debug, Deserialize)]
struct ProviderError {
    error: Option<String>,
    error_description: Option<String>,
}

/// Resource-style error body: `{"message": ...}`.
#[derive(Debug, Deserialize)]
struct ProviderMessage {
    message: Option<String>,
}

impl ApiError {
    /// Map a non-success response to a typed error.
    ///
    /// Recognizes the two body shapes the platform produces before falling
    /// back to the raw body text.
    pub fn classify(status: StatusCode, body: &str) -> ApiError {
        if let Ok(parsed) = serde_json::from_str::<ProviderError>(body) {
            if let Some(error) = parsed.error.filter(|value| !value.is_empty()) {
                let description = parsed
                    .error_description
                    .filter(|value| !value.is_empty())
                    .unwrap_or_default();
                return match error.as_str() {
                    "invalid_token" => ApiError::InvalidToken(description),
                    "invalid_request" => ApiError::InvalidRequest(description),
                    _ => ApiError::Provider {
                        status,
                        message: format!("{error} - {description}"),
                    },
                };
            }
        }

        if let Ok(parsed) = serde_json::from_str::<ProviderMessage>(body) {
            if let Some(message) = parsed.message.filter(|value| !value.is_empty()) {
                if status == StatusCode::UNAUTHORIZED {
                    return ApiError::Unauthorized(message);
                }
                return ApiError::Provider { status, message };
            }
        }

        ApiError::Provider {
            status,
            message: body.to_owned(),
        }
    }

    /// Whether a token refresh and replay could make the request succeed.
    pub fn requires_refresh(&self) -> bool {
        matches!(self, ApiError::InvalidToken(_) | ApiError::Unauthorized(_))
    }
}
