//! Local HTTP callback listener for the OAuth redirect.
//!
//! When the user approves the authorization request, Twitch redirects the
//! browser to `http://localhost:5000/callback?code=xxx&state=yyy`. The
//! [`CallbackListener`] binds that address, answers exactly one request with
//! a static confirmation page, hands back the query parameters and closes.
//! It never serves a second request.
//!
//! Raw [`tokio::net::TcpListener`] is enough here; no HTTP server framework
//! is pulled in for a single GET.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::error::{AuthError, Result};

/// The page returned to the browser once the code has been captured.
const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Cartagena</title></head>
<body>
    <h1>Login complete</h1>
    <p>You may now close this window.</p>
</body>
</html>"#;

/// The page returned when the redirect carried no code.
const FAILURE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Cartagena</title></head>
<body>
    <h1>Login failed</h1>
    <p>No authorization code was received. Return to the console and try again.</p>
</body>
</html>"#;

/// Upper bound on the request head read from one connection.
const MAX_REQUEST_HEAD: u64 = 16 * 1024;

/// Query parameters captured from the single callback request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub state: Option<String>,
    /// `error` (and `error_description`, if any) sent by the provider when
    /// the user denies access.
    pub error: Option<String>,
}

/// A bound, not yet consumed, callback listener.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    path: String,
}

impl CallbackListener {
    /// Bind the host and port named in `redirect_uri`.
    ///
    /// A `localhost` host is bound as `127.0.0.1`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UrlParse`] if `redirect_uri` is not a URL.
    /// - [`AuthError::ListenerBindFailed`] if the port is taken.
    pub async fn bind(redirect_uri: &str) -> Result<Self> {
        let url = Url::parse(redirect_uri)?;
        let host = match url.host_str() {
            Some("localhost") | None => "127.0.0.1".to_string(),
            Some(other) => other.trim_matches(|c| c == '[' || c == ']').to_string(),
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| AuthError::ListenerBindFailed {
                addr: addr.clone(),
                source,
            })?;

        tracing::info!(addr = %addr, path = url.path(), "callback listener bound");

        Ok(Self {
            listener,
            path: url.path().to_string(),
        })
    }

    /// The address actually bound (useful when the redirect names port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the callback, answer it, and shut the listener down.
    ///
    /// Consumes the listener: whatever happens, the port is released when
    /// this returns.
    ///
    /// # Errors
    ///
    /// - [`AuthError::ListenerTimeout`] if no request arrives in time.
    /// - [`AuthError::Io`] on a socket error.
    pub async fn wait(self, timeout: Duration) -> Result<CallbackResult> {
        let result = tokio::time::timeout(timeout, self.accept_one()).await;
        drop(self);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AuthError::ListenerTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Accept connections until one carries a request, then answer it.
    async fn accept_one(&self) -> Result<CallbackResult> {
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            tracing::debug!(peer = %peer, "accepted callback connection");

            let request_line = read_request_line(&mut stream).await?;
            if request_line.is_empty() {
                // Browser pre-connect closed without a request.
                tracing::debug!(peer = %peer, "connection closed before any request");
                continue;
            }

            let target = request_target(&request_line).unwrap_or("/");
            let Some(result) = parse_callback_target(target, &self.path) else {
                tracing::warn!(target = target, "request did not hit the callback path");
                respond(&mut stream, "404 Not Found", FAILURE_HTML).await?;
                return Ok(CallbackResult::default());
            };

            let page = if result.code.as_deref().is_some_and(|c| !c.is_empty()) {
                SUCCESS_HTML
            } else {
                FAILURE_HTML
            };
            respond(&mut stream, "200 OK", page).await?;

            tracing::info!("callback received");
            return Ok(result);
        }
    }
}

/// Bind `redirect_uri`, wait for exactly one callback, then close.
pub async fn await_callback(redirect_uri: &str, timeout: Duration) -> Result<CallbackResult> {
    CallbackListener::bind(redirect_uri).await?.wait(timeout).await
}

/// Read the request line, however it is segmented, and drain the headers
/// behind it. Returns an empty string if the peer closed without sending.
async fn read_request_line(stream: &mut TcpStream) -> Result<String> {
    let mut reader = BufReader::new(stream.take(MAX_REQUEST_HEAD));

    let mut first = Vec::new();
    if reader.read_until(b'\n', &mut first).await? == 0 {
        return Ok(String::new());
    }

    let mut header = Vec::new();
    loop {
        header.clear();
        let n = reader.read_until(b'\n', &mut header).await?;
        if n == 0 || header == b"\r\n" || header == b"\n" {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&first).into_owned())
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// The request target from `GET /callback?code=x HTTP/1.1`.
fn request_target(request: &str) -> Option<&str> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let _method = parts.next()?;
    parts.next()
}

/// Extract the callback parameters if `target` hits `expected_path`.
fn parse_callback_target(target: &str, expected_path: &str) -> Option<CallbackResult> {
    let url = Url::parse(&format!("http://localhost{target}")).ok()?;
    if url.path() != expected_path {
        return None;
    }

    let mut result = CallbackResult::default();
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => result.code = Some(value.into_owned()),
            "state" => result.state = Some(value.into_owned()),
            "error" => result.error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }
    if let (Some(error), Some(description)) = (result.error.as_mut(), description) {
        error.push_str(": ");
        error.push_str(&description);
    }
    Some(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
