use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use super::callback::{parse_callback_query, CodeResponse};
use super::AuthError;

const INDEX_HTML: &str = include_str!("../../assets/loopback/index.html");
const STYLE_CSS: &str = include_str!("../../assets/loopback/style.css");

fn bundled_asset(path: &str) -> Option<(&'static str, &'static str)> {
    match path.trim_start_matches('/') {
        "index.html" => Some((INDEX_HTML, "text/html; charset=utf-8")),
        "style.css" => Some((STYLE_CSS, "text/css; charset=utf-8")),
        _ => None,
    }
}

/// Handle to the loopback callback listener.
///
/// Paths containing a dot are served from the bundled asset set and leave
/// the listener running. The first other request resolves the attempt,
/// receives the landing page, and closes the listener, so at most one
/// code-bearing callback is accepted per attempt.
pub struct LoopbackServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LoopbackServer {
    /// Bind the listener and spawn the accept loop.
    ///
    /// Port 0 binds an ephemeral port; [`LoopbackServer::redirect_uri`]
    /// reports whichever port was actually bound.
    pub async fn start(
        port: u16,
    ) -> Result<(Self, oneshot::Receiver<Result<CodeResponse, AuthError>>), AuthError> {
        if cfg!(target_family = "wasm") {
            return Err(AuthError::PlatformNotSupported("loopback"));
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, result_tx, shutdown_rx));
        tracing::debug!(%addr, "loopback callback listener started");

        Ok((
            Self {
                addr,
                shutdown: Some(shutdown_tx),
                task: Some(task),
            },
            result_rx,
        ))
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Redirect URI pointing at the bound listener.
    pub fn redirect_uri(&self) -> Result<Url, AuthError> {
        Ok(Url::parse(&format!("http://{}", self.addr))?)
    }

    /// Signal the accept loop to stop. Safe to call repeatedly, or when the
    /// listener already completed on its own.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Stop and wait for the accept loop to exit, releasing the port.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: TcpListener,
    result: oneshot::Sender<Result<CodeResponse, AuthError>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let outcome = loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown => break None,
        };
        let (mut stream, _addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => break Some(Err(err.into())),
        };
        match handle_connection(&mut stream).await {
            Ok(Handled::Asset) => continue,
            Ok(Handled::Callback(response)) => break Some(response),
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed loopback request");
                continue;
            }
        }
    };

    // The listener must be gone before the result is observable, so a
    // second callback can never race the first.
    drop(listener);
    tracing::debug!("loopback callback listener stopped");
    if let Some(outcome) = outcome {
        let _ = result.send(outcome);
    }
}

enum Handled {
    Asset,
    Callback(Result<CodeResponse, AuthError>),
}

async fn handle_connection(stream: &mut TcpStream) -> Result<Handled, AuthError> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = parse_request_path(&request)?;
    let url = Url::parse(&format!("http://localhost{path}"))?;

    if url.path().contains('.') {
        match bundled_asset(url.path()) {
            Some((body, content_type)) => respond(stream, 200, content_type, body).await?,
            None => respond(stream, 404, "text/plain; charset=utf-8", "not found").await?,
        }
        return Ok(Handled::Asset);
    }

    respond(stream, 200, "text/html; charset=utf-8", INDEX_HTML).await?;
    let _ = stream.shutdown().await;
    Ok(Handled::Callback(parse_callback_query(&url)))
}

fn parse_request_path(request: &str) -> Result<&str, AuthError> {
    let mut lines = request.lines();
    let first_line = lines
        .next()
        .ok_or_else(|| AuthError::InvalidCallback("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidCallback("missing method".into()))?;
    let path = parts
        .next()
        .ok_or_else(|| AuthError::InvalidCallback("missing path".into()))?;
    Ok(path)
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    async fn fetch(addr: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {target} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn callback_resolves_attempt_and_closes_listener() {
        let (server, rx) = LoopbackServer::start(0).await.unwrap();
        let addr = server.local_addr();

        let body = fetch(addr, "/?code=test-code&state=xyz").await;
        assert!(body.contains("200 OK"));
        assert!(body.contains("close this window"));

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.code, "test-code");
        assert_eq!(response.state.as_deref(), Some("xyz"));

        // The listener drops before the result is delivered.
        assert!(TcpStream::connect(addr).await.is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn assets_are_served_before_the_callback() {
        let (server, rx) = LoopbackServer::start(0).await.unwrap();
        let addr = server.local_addr();

        let css = fetch(addr, "/style.css").await;
        assert!(css.contains("200 OK"));
        assert!(css.contains("text/css"));

        let missing = fetch(addr, "/missing.png").await;
        assert!(missing.contains("404 Not Found"));

        let _ = fetch(addr, "/?code=after-assets").await;
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.code, "after-assets");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn provider_error_resolves_with_denial() {
        let (server, rx) = LoopbackServer::start(0).await.unwrap();
        let addr = server.local_addr();

        let body = fetch(addr, "/?error=access_denied&error_description=user%20cancelled").await;
        assert!(body.contains("200 OK"));

        let err = rx.await.unwrap().unwrap_err();
        match err {
            AuthError::CodeDenied(reason) => assert_eq!(reason, "access_denied - user cancelled"),
            other => panic!("unexpected error: {other:?}"),
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn request_without_code_resolves_with_missing_code() {
        let (server, rx) = LoopbackServer::start(0).await.unwrap();
        let addr = server.local_addr();

        let _ = fetch(addr, "/").await;
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::MissingAuthorizationCode));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drops_the_result_channel() {
        let (mut server, rx) = LoopbackServer::start(0).await.unwrap();
        server.stop();
        server.stop();
        assert!(rx.await.is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn redirect_uri_reports_bound_port() {
        let (server, _rx) = LoopbackServer::start(0).await.unwrap();
        let uri = server.redirect_uri().unwrap();
        assert_eq!(uri.host_str(), Some("127.0.0.1"));
        assert_eq!(uri.port(), Some(server.local_addr().port()));
        server.shutdown().await;
    }
}
