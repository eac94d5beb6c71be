//! Attach bearer tokens to requests for protected resources.

use std::sync::Arc;

use portal_auth::{AuthSessionController, ScopeRequest, SessionState};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ApiError, Result};

/// User agent sent with every protected call.
const USER_AGENT: &str = concat!("Portal/", env!("CARGO_PKG_VERSION"));

/// Issues authorized `GET` requests on behalf of the signed-in user.
///
/// Exactly one HTTP request is made per call. A `401` is returned to the
/// caller without a retry, but the rejected token is evicted so that the
/// next call acquires a fresh one.
#[derive(Clone)]
pub struct AuthorizedRequestDispatcher {
    session: Arc<AuthSessionController>,
    http: reqwest::Client,
}

impl AuthorizedRequestDispatcher {
    pub fn new(session: Arc<AuthSessionController>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self::with_http_client(session, http)
    }

    pub fn with_http_client(session: Arc<AuthSessionController>, http: reqwest::Client) -> Self {
        Self { session, http }
    }

    pub fn session(&self) -> &Arc<AuthSessionController> {
        &self.session
    }

    /// `GET endpoint` with a bearer token for `request`, returning the JSON
    /// body unchanged.
    ///
    /// # Errors
    ///
    /// - [`ApiErrorKind::Unauthenticated`](crate::ApiErrorKind::Unauthenticated)
    ///   when the session is not signed in; nothing is sent.
    /// - [`ApiErrorKind::Auth`](crate::ApiErrorKind::Auth) when no token
    ///   could be acquired.
    /// - [`ApiErrorKind::Http`](crate::ApiErrorKind::Http) for non-success
    ///   statuses, with the server's `message` when it sent one.
    pub async fn call_protected_resource(
        &self,
        endpoint: &str,
        request: &ScopeRequest,
    ) -> Result<Value> {
        self.get_json(endpoint, request).await
    }

    /// Like [`call_protected_resource`](Self::call_protected_resource), but
    /// decodes the body into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &ScopeRequest,
    ) -> Result<T> {
        if self.session.session_state() != SessionState::Authenticated {
            tracing::debug!(endpoint = endpoint, "protected call refused, not signed in");
            return Err(ApiError::unauthenticated());
        }

        let token = self.session.acquire_token(request).await.into_result()?;

        tracing::debug!(endpoint = endpoint, scopes = %request.scopes, "calling protected resource");

        let response = self
            .http
            .get(endpoint)
            .header(AUTHORIZATION, token.bearer())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                match self.session.evict_token(&token.account_id, &request.scopes) {
                    Ok(evicted) => {
                        tracing::warn!(endpoint = endpoint, evicted, "resource server rejected token")
                    }
                    Err(err) => tracing::warn!(error = %err, "could not evict rejected token"),
                }
            }
            let message = error_message(&body).unwrap_or_else(|| format!("HTTP {status}"));
            tracing::warn!(endpoint = endpoint, status = status.as_u16(), "protected call failed");
            return Err(ApiError::http(status.as_u16(), message));
        }

        serde_json::from_slice(&body)
            .map_err(|e| ApiError::decode(format!("unexpected response from {endpoint}: {e}")))
    }
}

/// Pull a human-readable message out of an error body: `message`, then
/// `error` (a string, or an object with its own `message`).
fn error_message(body: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(body).ok()?;
    let text = |v: &Value| v.as_str().filter(|s| !s.is_empty()).map(str::to_string);

    json.get("message").and_then(text).or_else(|| {
        json.get("error").and_then(|error| {
            text(error).or_else(|| error.get("message").and_then(text))
        })
    })
}
