use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::oneshot;
use url::Url;

use super::AuthError;

pub const DEFAULT_LOOPBACK_PORT: u16 = 50100;
pub const DEEP_LINK_HOST: &str = "colizeum-auth";

/// Authorization response delivered by a callback strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeResponse {
    pub code: String,
    pub state: Option<String>,
}

/// How the authorization redirect finds its way back into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackStrategy {
    /// The embedding application receives the redirect itself and forwards
    /// the landing URL or code through the session's [`CallbackSink`].
    Redirect,
    /// The OS activates the application with a `{scheme}://colizeum-auth`
    /// URL, which the application forwards to the [`CallbackSink`].
    DeepLink { scheme: String },
    /// The engine listens on 127.0.0.1 and captures the redirect itself.
    Loopback { port: u16 },
}

impl Default for CallbackStrategy {
    fn default() -> Self {
        CallbackStrategy::Loopback {
            port: DEFAULT_LOOPBACK_PORT,
        }
    }
}

impl CallbackStrategy {
    /// Redirect URI implied by the strategy.
    pub fn redirect_uri(&self, configured: Option<&Url>) -> Result<Url, AuthError> {
        match self {
            CallbackStrategy::Redirect => {
                configured.cloned().ok_or(AuthError::MissingRedirectUri)
            }
            CallbackStrategy::DeepLink { scheme } => {
                Ok(Url::parse(&format!("{scheme}://{DEEP_LINK_HOST}"))?)
            }
            CallbackStrategy::Loopback { port } => {
                Ok(Url::parse(&format!("http://127.0.0.1:{port}"))?)
            }
        }
    }
}

/// Parse `code`/`state`/`error` out of a callback URL's query.
pub(crate) fn parse_callback_query(url: &Url) -> Result<CodeResponse, AuthError> {
    let mut code: Option<String> = None;
    let mut state: Option<String> = None;
    let mut error: Option<String> = None;
    let mut error_description: Option<String> = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        let reason = match error_description {
            Some(description) => format!("{error} - {description}"),
            None => error,
        };
        return Err(AuthError::CodeDenied(reason));
    }

    let code = code.ok_or(AuthError::MissingAuthorizationCode)?;
    Ok(CodeResponse { code, state })
}

/// Interpret an OS activation URL.
///
/// Returns `Ok(None)` when the URL is not an authorization callback for this
/// scheme, so unrelated activations never consume a pending attempt. An
/// `Err` means the URL was ours and carried a denial or no code.
pub fn parse_deep_link(url: &str, scheme: &str) -> Result<Option<CodeResponse>, AuthError> {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(None),
    };
    if !parsed.scheme().eq_ignore_ascii_case(scheme) || parsed.host_str() != Some(DEEP_LINK_HOST) {
        return Ok(None);
    }
    parse_callback_query(&parsed).map(Some)
}

type CodeSender = oneshot::Sender<Result<CodeResponse, AuthError>>;

/// Hand-off point between the embedding application and a pending login.
///
/// Cloned handles share one slot. The first delivery resolves the pending
/// attempt and disarms the sink; later deliveries return `false`.
#[derive(Debug, Clone, Default)]
pub struct CallbackSink {
    slot: Arc<StdMutex<Option<CodeSender>>>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the sink for a new attempt, returning the receiving end.
    pub(crate) fn arm(&self) -> oneshot::Receiver<Result<CodeResponse, AuthError>> {
        let (tx, rx) = oneshot::channel();
        *self.lock() = Some(tx);
        rx
    }

    pub(crate) fn disarm(&self) {
        self.lock().take();
    }

    /// Whether a login attempt is currently waiting on this sink.
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Deliver a parsed authorization response.
    pub fn deliver(&self, response: CodeResponse) -> bool {
        self.send(Ok(response))
    }

    /// Deliver a terminal failure, such as a user denial.
    pub fn deliver_error(&self, error: AuthError) -> bool {
        self.send(Err(error))
    }

    /// Deliver a redirect landing URL, parsing `code`/`state`/`error`.
    pub fn deliver_url(&self, url: &Url) -> bool {
        match parse_callback_query(url) {
            Ok(response) => self.deliver(response),
            Err(err) => self.deliver_error(err),
        }
    }

    /// Forward an OS activation URL. Foreign URLs leave the sink armed.
    pub fn deliver_deep_link(&self, url: &str, scheme: &str) -> bool {
        match parse_deep_link(url, scheme) {
            Ok(Some(response)) => self.deliver(response),
            Ok(None) => {
                tracing::debug!(url, "ignoring activation url not addressed to auth callback");
                false
            }
            Err(err) => self.deliver_error(err),
        }
    }

    fn send(&self, result: Result<CodeResponse, AuthError>) -> bool {
        match self.lock().take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<CodeSender>> {
        self.slot.lock().unwrap_or_else(|err| err.into_inner())
    }
}
