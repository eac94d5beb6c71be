//! Loopback callback listener for the popup surface.
//!
//! When an interactive sign-in completes in the browser, the identity
//! provider redirects to the registered loopback URI with either
//! `?code=..&state=..` or `?error=..&error_description=..`. The
//! [`CallbackServer`] accepts connections until one of them carries such a
//! query on the expected path, answers it with a small HTML page, and shuts
//! down.
//!
//! [`parse_callback_url`] is shared with the redirect surface, where the
//! callback URL is handed to the next boot instead of being received here.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use crate::error::ProviderError;

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Signed in</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
    <h1>Sign-in complete</h1>
    <p>You can close this window and return to Portal.</p>
</body>
</html>"#;

const FAILURE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Sign-in failed</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
    <h1>Sign-in did not complete</h1>
    <p>Return to Portal for details.</p>
</body>
</html>"#;

/// What the identity provider sent back to the redirect URI.
#[derive(Clone, PartialEq, Eq)]
pub enum CallbackResponse {
    /// Authorization succeeded.
    Code { code: String, state: String },
    /// Authorization failed or was cancelled.
    Error {
        error: String,
        description: Option<String>,
        state: Option<String>,
    },
}

impl std::fmt::Debug for CallbackResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code { .. } => f.write_str("CallbackResponse::Code(<redacted>)"),
            Self::Error {
                error, description, ..
            } => f
                .debug_struct("CallbackResponse::Error")
                .field("error", error)
                .field("description", description)
                .finish_non_exhaustive(),
        }
    }
}

impl CallbackResponse {
    /// The `state` echoed by the provider, if any.
    pub fn state(&self) -> Option<&str> {
        match self {
            Self::Code { state, .. } => Some(state),
            Self::Error { state, .. } => state.as_deref(),
        }
    }

    /// Convert an error response into a [`ProviderError`]. `access_denied`
    /// is how providers report that the user dismissed the sign-in page.
    pub fn into_error(self) -> Option<ProviderError> {
        match self {
            Self::Code { .. } => None,
            Self::Error {
                error, description, ..
            } => {
                let reason = match description {
                    Some(d) => format!("{error}: {d}"),
                    None => error.clone(),
                };
                Some(if error == "access_denied" {
                    ProviderError::Cancelled { reason }
                } else {
                    ProviderError::Rejected { reason }
                })
            }
        }
    }
}

/// Parse the query string of a redirect callback.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] when neither a `code` with `state`
/// nor an `error` is present.
pub fn parse_callback_query(query: &str) -> Result<CallbackResponse, ProviderError> {
    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Ok(CallbackResponse::Error {
            error,
            description,
            state,
        });
    }

    match (code, state) {
        (Some(code), Some(state)) => Ok(CallbackResponse::Code { code, state }),
        (None, _) => Err(ProviderError::Rejected {
            reason: "callback missing 'code' parameter".to_string(),
        }),
        (Some(_), None) => Err(ProviderError::Rejected {
            reason: "callback missing 'state' parameter".to_string(),
        }),
    }
}

/// Parse a full callback URL as echoed to the redirect URI.
pub fn parse_callback_url(callback_url: &str) -> Result<CallbackResponse, ProviderError> {
    let url = Url::parse(callback_url).map_err(|e| ProviderError::Rejected {
        reason: format!("callback is not a URL: {e}"),
    })?;
    parse_callback_query(url.query().unwrap_or_default())
}

// ---------------------------------------------------------------------------
// CallbackServer
// ---------------------------------------------------------------------------

/// A one-shot HTTP listener bound to the loopback redirect URI.
pub struct CallbackServer {
    listener: TcpListener,
    path: String,
}

impl CallbackServer {
    /// Bind to the host and port of `redirect_uri`.
    ///
    /// Binding happens before the authorization URL is shown so the
    /// browser's redirect can never race the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidConfig`] if the redirect URI is not a
    /// loopback `http` URL, or [`ProviderError::Transport`] if binding fails.
    pub async fn bind(redirect_uri: &str) -> Result<Self, ProviderError> {
        let url = Url::parse(redirect_uri)?;
        if url.scheme() != "http" {
            return Err(ProviderError::InvalidConfig {
                reason: format!("popup redirect URI must be http loopback: {redirect_uri}"),
            });
        }
        let host = match url.host_str() {
            Some("localhost") | None => "127.0.0.1",
            Some(host) => host,
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let listener = TcpListener::bind((host, port)).await?;
        tracing::debug!(addr = ?listener.local_addr().ok(), "callback server listening");

        Ok(Self {
            listener,
            path: url.path().to_string(),
        })
    }

    /// The bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ProviderError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the callback.
    ///
    /// # Errors
    ///
    /// A timeout is reported as [`ProviderError::Cancelled`]: the sign-in
    /// surface was abandoned.
    pub async fn wait(self, timeout_secs: u64) -> Result<CallbackResponse, ProviderError> {
        let timeout = tokio::time::Duration::from_secs(timeout_secs);
        match tokio::time::timeout(timeout, self.accept_until_callback()).await {
            Ok(inner) => inner,
            Err(_) => Err(ProviderError::Cancelled {
                reason: format!("no sign-in callback within {timeout_secs} seconds"),
            }),
        }
    }

    async fn accept_until_callback(&self) -> Result<CallbackResponse, ProviderError> {
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            tracing::debug!(peer = %peer, "accepted callback connection");

            // Redirect callbacks are small GET requests.
            let mut buf = [0u8; 8192];
            let n = stream.read(&mut buf).await?;
            let request = String::from_utf8_lossy(&buf[..n]);

            let Some(query) = self.callback_query(&request) else {
                stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await?;
                continue;
            };

            let parsed = parse_callback_query(&query);
            let body = match &parsed {
                Ok(CallbackResponse::Code { .. }) => SUCCESS_HTML,
                _ => FAILURE_HTML,
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;

            tracing::info!("sign-in callback received");
            return parsed;
        }
    }

    /// Extract the query from `GET <path>?<query> HTTP/1.1` when the path
    /// matches the redirect URI.
    fn callback_query(&self, request: &str) -> Option<String> {
        let request_line = request.lines().next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        if method != "GET" {
            return None;
        }
        let (path, query) = target.split_once('?')?;
        (path == self.path).then(|| query.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
