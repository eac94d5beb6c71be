//! OAuth 2.0 authorization code flow with PKCE, and the refresh grant.
//!
//! This module implements the wire side of the identity-provider
//! conversation as defined in RFC 6749 and RFC 7636: building the
//! authorization URL, exchanging an authorization code, redeeming a refresh
//! token, and classifying token-endpoint errors into the
//! [`ProviderError`] taxonomy the engine escalates on.
//!
//! ID-token claims are decoded from the JWT payload for display and account
//! identity only. Signature validation is out of scope.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use url::Url;

use crate::account::ScopeSet;
use crate::error::ProviderError;

/// Length of the PKCE code verifier in bytes (before base64 encoding).
const PKCE_VERIFIER_BYTES: usize = 32;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Token-endpoint error codes that only a fresh interactive sign-in can fix.
const INTERACTION_REQUIRED_CODES: [&str; 4] = [
    "invalid_grant",
    "interaction_required",
    "consent_required",
    "login_required",
];

// ---------------------------------------------------------------------------
// Authorization request
// ---------------------------------------------------------------------------

/// Parameters of a single authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub scopes: &'a ScopeSet,
    pub state: &'a str,
    pub nonce: &'a str,
    pub code_challenge: &'a str,
    /// Pre-fills the username on the sign-in page.
    pub login_hint: Option<&'a str>,
    /// `select_account`, `login`, `consent`, ...
    pub prompt: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

/// Tokens returned by a successful code exchange or refresh.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: String,
    pub scopes: ScopeSet,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish()
    }
}

/// Raw token response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    /// Convert into a [`TokenGrant`], computing `expires_at` from
    /// `expires_in`. Falls back to the requested scopes when the server
    /// does not echo a `scope`.
    fn into_grant(self, requested: &ScopeSet) -> TokenGrant {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let scopes = match self.scope {
            Some(scope) if !scope.trim().is_empty() => ScopeSet::parse(&scope),
            _ => requested.clone(),
        };

        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scopes,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        }
    }
}

/// Raw error response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
    suberror: Option<String>,
}

impl TokenErrorResponse {
    fn into_provider_error(self) -> ProviderError {
        let mut reason = match &self.error_description {
            Some(description) => format!("{}: {description}", self.error),
            None => self.error.clone(),
        };
        if let Some(sub) = &self.suberror {
            reason.push_str(&format!(" ({sub})"));
        }

        let code = self.error.as_str();
        if INTERACTION_REQUIRED_CODES.contains(&code) {
            ProviderError::InteractionRequired { reason }
        } else if code == "access_denied" {
            ProviderError::Cancelled { reason }
        } else {
            ProviderError::Rejected { reason }
        }
    }
}

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

/// Generate a PKCE code verifier (random 32 bytes, base64url encoded).
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_pkce_verifier() -> Result<String, ProviderError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; PKCE_VERIFIER_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| ProviderError::Rejected {
            reason: "failed to generate PKCE verifier: CSPRNG error".to_string(),
        })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Derive the PKCE code challenge from a code verifier using SHA-256.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Decode the claims of a JWT without verifying its signature.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] if the token is not a three-part JWT
/// with a base64url JSON object payload.
pub fn decode_id_token_claims(
    id_token: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
    let malformed = |detail: &str| ProviderError::Rejected {
        reason: format!("malformed id_token: {detail}"),
    };

    let mut parts = id_token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(malformed("expected three segments")),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| malformed(&e.to_string()))?;

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(serde_json::Value::Object(claims)) => Ok(claims),
        Ok(_) => Err(malformed("payload is not an object")),
        Err(e) => Err(malformed(&e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// OAuth client
// ---------------------------------------------------------------------------

/// Wire client for a public OAuth client (no secret).
///
/// Stateless: all per-flow state is passed explicitly. Uses `reqwest` for
/// token-endpoint calls and `ring` for PKCE hashing.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    client_id: String,
    redirect_uri: String,
    authorize_endpoint: Url,
    token_endpoint: Url,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        authorize_endpoint: Url,
        token_endpoint: Url,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            authorize_endpoint,
            token_endpoint,
            http,
        }
    }

    /// Build the authorization URL the user agent should visit.
    ///
    /// Existing query parameters on the authorize endpoint are preserved.
    pub fn authorization_url(&self, request: &AuthorizationRequest<'_>) -> Url {
        let mut url = self.authorize_endpoint.clone();

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("response_mode", "query");
            params.append_pair("client_id", &self.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("state", request.state);
            params.append_pair("nonce", request.nonce);
            params.append_pair("code_challenge", request.code_challenge);
            params.append_pair("code_challenge_method", "S256");

            if !request.scopes.is_empty() {
                params.append_pair("scope", &request.scopes.to_param());
            }
            if let Some(hint) = request.login_hint {
                params.append_pair("login_hint", hint);
            }
            if let Some(prompt) = request.prompt {
                params.append_pair("prompt", prompt);
            }
        }

        url
    }

    /// Exchange an authorization code for tokens.
    ///
    /// The `code_verifier` must be the verifier whose challenge was sent in
    /// the authorization URL.
    ///
    /// # Errors
    ///
    /// Token-endpoint errors are classified by [`ProviderError`] variant;
    /// transport failures and 5xx responses are
    /// [`ProviderError::Transport`].
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        scopes: &ScopeSet,
    ) -> Result<TokenGrant, ProviderError> {
        let scope = scopes.to_param();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
            ("scope", scope.as_str()),
        ];

        tracing::debug!(token_url = %self.token_endpoint, "exchanging authorization code");

        let response = self
            .http
            .post(self.token_endpoint.clone())
            .form(&params)
            .send()
            .await?;

        Self::parse_token_response(response, scopes).await
    }

    /// Redeem a refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InteractionRequired`] when the refresh token
    /// is invalid, expired, or revoked, or the provider demands consent.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &ScopeSet,
    ) -> Result<TokenGrant, ProviderError> {
        let scope = scopes.to_param();
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("scope", scope.as_str()),
        ];

        tracing::debug!(token_url = %self.token_endpoint, "redeeming refresh token");

        let response = self
            .http
            .post(self.token_endpoint.clone())
            .form(&params)
            .send()
            .await?;

        Self::parse_token_response(response, scopes).await
    }

    /// Parse the HTTP response from the token endpoint.
    async fn parse_token_response(
        response: reqwest::Response,
        requested: &ScopeSet,
    ) -> Result<TokenGrant, ProviderError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            let token_response: TokenResponse =
                serde_json::from_str(&body).map_err(|e| ProviderError::Rejected {
                    reason: format!("unreadable token response: {e}"),
                })?;
            tracing::debug!("token request successful");
            return Ok(token_response.into_grant(requested));
        }

        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(ProviderError::Transport {
                message: format!("HTTP {status}: {body}"),
            });
        }

        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(error_response) => Err(error_response.into_provider_error()),
            Err(_) => Err(ProviderError::Rejected {
                reason: format!("HTTP {status}: {body}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
