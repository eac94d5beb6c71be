//! [`IdentityProvider`] implementation for an OIDC authority.
//!
//! Popup interactions run the authorization code flow with PKCE against a
//! loopback [`CallbackServer`]: the authorization URL is logged for the user
//! to open, and the redirect lands on the local listener. Redirect
//! interactions persist a [`PendingInteraction`] in the account store and
//! return the authorization URL; the flow is finished by
//! [`handle_redirect_response`](IdentityProvider::handle_redirect_response)
//! on a later boot.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::account::{Account, ScopeSet, Token};
use crate::callback::{CallbackResponse, CallbackServer, parse_callback_url};
use crate::config::OidcConfig;
use crate::error::{AuthError, ProviderError};
use crate::oauth::{
    AuthorizationRequest, OAuthClient, TokenGrant, decode_id_token_claims, generate_pkce_verifier,
    pkce_challenge,
};
use crate::provider::{IdentityProvider, ProviderGrant, RedirectStarted, SilentRequest};
use crate::store::{AccountStore, InteractionPurpose, PendingInteraction};

/// Scopes added to every interactive request so that an ID token and a
/// refresh credential are issued.
const INTERACTIVE_EXTRA_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Per-interaction secrets.
struct InteractionSecrets {
    state: String,
    nonce: String,
    code_verifier: String,
}

impl InteractionSecrets {
    fn generate() -> Result<Self, ProviderError> {
        Ok(Self {
            state: uuid::Uuid::now_v7().to_string(),
            nonce: uuid::Uuid::now_v7().to_string(),
            code_verifier: generate_pkce_verifier()?,
        })
    }
}

/// Identity provider speaking OAuth 2.0 / OIDC to a Microsoft Entra style
/// authority (`/oauth2/v2.0/{authorize,token,logout}`).
pub struct OidcProvider {
    config: OidcConfig,
    oauth: OAuthClient,
    store: Arc<AccountStore>,
}

impl OidcProvider {
    /// Create a provider with a default HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: OidcConfig, store: Arc<AccountStore>) -> Result<Self, AuthError> {
        Self::with_http_client(config, store, reqwest::Client::new())
    }

    /// Create a provider sharing an existing HTTP client.
    pub fn with_http_client(
        config: OidcConfig,
        store: Arc<AccountStore>,
        http: reqwest::Client,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let oauth = OAuthClient::new(
            config.client_id.clone(),
            config.redirect_uri.clone(),
            config.authorize_endpoint()?,
            config.token_endpoint()?,
            http,
        );
        Ok(Self {
            config,
            oauth,
            store,
        })
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    fn interactive_scopes(scopes: &ScopeSet) -> ScopeSet {
        INTERACTIVE_EXTRA_SCOPES
            .iter()
            .fold(scopes.clone(), |acc, extra| acc.with(extra))
    }

    fn authorization_url(
        &self,
        scopes: &ScopeSet,
        secrets: &InteractionSecrets,
        account: Option<&Account>,
    ) -> String {
        let challenge = pkce_challenge(&secrets.code_verifier);
        let request = AuthorizationRequest {
            scopes,
            state: &secrets.state,
            nonce: &secrets.nonce,
            code_challenge: &challenge,
            login_hint: account.map(|a| a.username.as_str()).filter(|u| !u.is_empty()),
            prompt: account.is_none().then_some("select_account"),
        };
        self.oauth.authorization_url(&request).to_string()
    }

    /// Run a full popup interaction: listen, show the URL, exchange the code.
    async fn popup(
        &self,
        account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<ProviderGrant, ProviderError> {
        let requested = Self::interactive_scopes(scopes);
        let secrets = InteractionSecrets::generate()?;

        let server = CallbackServer::bind(&self.config.redirect_uri).await?;
        let url = self.authorization_url(&requested, &secrets, account);

        tracing::info!(url = %url, "open this URL in your browser to sign in");

        let callback = server.wait(self.config.callback_timeout_secs).await?;
        self.complete(
            callback,
            &secrets.state,
            &secrets.code_verifier,
            &secrets.nonce,
            &requested,
            account,
        )
        .await
    }

    /// Persist a redirect interaction and return where to navigate.
    fn start_redirect(
        &self,
        purpose: InteractionPurpose,
        account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<RedirectStarted, ProviderError> {
        let requested = Self::interactive_scopes(scopes);
        let secrets = InteractionSecrets::generate()?;
        let url = self.authorization_url(&requested, &secrets, account);

        self.store.set_pending_interaction(PendingInteraction {
            state: secrets.state,
            code_verifier: secrets.code_verifier,
            nonce: secrets.nonce,
            scopes: requested,
            purpose,
            account: account.map(|a| a.id.clone()),
            created_at: Utc::now(),
        })?;

        tracing::info!(purpose = ?purpose, "redirect interaction started");
        Ok(RedirectStarted {
            authorization_url: url,
        })
    }

    /// Validate a callback against the expected state and redeem its code.
    async fn complete(
        &self,
        callback: CallbackResponse,
        expected_state: &str,
        code_verifier: &str,
        nonce: &str,
        scopes: &ScopeSet,
        fallback: Option<&Account>,
    ) -> Result<ProviderGrant, ProviderError> {
        if callback.state() != Some(expected_state) {
            tracing::warn!("callback state does not match the pending request");
            return Err(ProviderError::StateMismatch);
        }

        let code = match callback {
            CallbackResponse::Code { code, .. } => code,
            other => {
                return Err(other.into_error().unwrap_or(ProviderError::Rejected {
                    reason: "callback carried no authorization code".to_string(),
                }));
            }
        };

        let grant = self.oauth.exchange_code(&code, code_verifier, scopes).await?;
        self.provider_grant(grant, fallback, Some(nonce))
    }

    /// Combine a token grant with the account its ID token describes.
    fn provider_grant(
        &self,
        grant: TokenGrant,
        fallback: Option<&Account>,
        expected_nonce: Option<&str>,
    ) -> Result<ProviderGrant, ProviderError> {
        let account = match &grant.id_token {
            Some(id_token) => {
                let claims = decode_id_token_claims(id_token)?;
                if let (Some(expected), Some(actual)) =
                    (expected_nonce, claims.get("nonce").and_then(|v| v.as_str()))
                    && expected != actual
                {
                    return Err(ProviderError::Rejected {
                        reason: "id_token nonce does not match the request".to_string(),
                    });
                }
                Account::from_claims(claims, &self.config.environment(), &self.config.tenant_id)
                    .ok_or_else(|| ProviderError::Rejected {
                        reason: "id_token carries no subject".to_string(),
                    })?
            }
            None => fallback.cloned().ok_or_else(|| ProviderError::Rejected {
                reason: "token response carried no id_token".to_string(),
            })?,
        };

        let token = Token {
            access_token: grant.access_token,
            token_type: grant.token_type,
            scopes: grant.scopes,
            expires_at: grant.expires_at,
            account_id: account.id.clone(),
        };

        Ok(ProviderGrant {
            account,
            token,
            refresh_token: grant.refresh_token,
        })
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn acquire_token_silent(
        &self,
        request: &SilentRequest,
    ) -> Result<ProviderGrant, ProviderError> {
        let scopes = request.scopes.with("offline_access");
        let grant = self.oauth.refresh(&request.refresh_token, &scopes).await?;
        self.provider_grant(grant, Some(&request.account), None)
    }

    async fn login_popup(&self, scopes: &ScopeSet) -> Result<ProviderGrant, ProviderError> {
        self.popup(None, scopes).await
    }

    async fn login_redirect(&self, scopes: &ScopeSet) -> Result<RedirectStarted, ProviderError> {
        self.start_redirect(InteractionPurpose::Login, None, scopes)
    }

    async fn acquire_token_popup(
        &self,
        account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<ProviderGrant, ProviderError> {
        self.popup(account, scopes).await
    }

    async fn acquire_token_redirect(
        &self,
        account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<RedirectStarted, ProviderError> {
        self.start_redirect(InteractionPurpose::AcquireToken, account, scopes)
    }

    async fn handle_redirect_response(
        &self,
        callback_url: &str,
    ) -> Result<Option<ProviderGrant>, ProviderError> {
        let callback = parse_callback_url(callback_url)?;

        if self.store.pending_interaction()?.is_none() {
            tracing::warn!("redirect callback received but no interaction is pending");
            return Ok(None);
        }

        // A callback whose state does not match leaves the pending request
        // in place for the genuine one.
        let echoed = callback.state().unwrap_or_default();
        let Some(pending) = self.store.take_pending_interaction_if(echoed)? else {
            tracing::warn!("redirect callback state does not match the pending interaction");
            return Err(ProviderError::StateMismatch);
        };

        let fallback = match &pending.account {
            Some(id) => self.store.get_account(id)?,
            None => None,
        };

        self.complete(
            callback,
            &pending.state,
            &pending.code_verifier,
            &pending.nonce,
            &pending.scopes,
            fallback.as_ref(),
        )
        .await
        .map(Some)
    }

    async fn logout_redirect(&self, account: &Account) -> Result<String, ProviderError> {
        let mut url = self
            .config
            .logout_endpoint()
            .map_err(|e| ProviderError::InvalidConfig {
                reason: e.to_string(),
            })?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair(
                "post_logout_redirect_uri",
                &self.config.post_logout_redirect(),
            );
            if let Some(hint) = account.claims.get("login_hint").and_then(|v| v.as_str()) {
                params.append_pair("logout_hint", hint);
            }
        }
        Ok(url.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountId;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn provider() -> (OidcProvider, Arc<AccountStore>) {
        let store = Arc::new(AccountStore::in_memory());
        let mut config = OidcConfig::new("client-1", "tenant-1");
        config.authority = Some("https://login.example.com/tenant-1".to_string());
        let provider = OidcProvider::new(config, Arc::clone(&store)).unwrap();
        (provider, store)
    }

    fn id_token(claims: serde_json::Value) -> String {
        format!("h.{}.s", URL_SAFE_NO_PAD.encode(claims.to_string()))
    }

    fn grant(id_token: Option<String>) -> TokenGrant {
        TokenGrant {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            id_token,
            token_type: "Bearer".to_string(),
            scopes: ScopeSet::parse("User.Read"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let store = Arc::new(AccountStore::in_memory());
        let result = OidcProvider::new(OidcConfig::new("", "t"), store);
        assert!(matches!(result, Err(AuthError::InvalidConfig { .. })));
    }

    #[test]
    fn interactive_scopes_request_refresh_credential() {
        let scopes = OidcProvider::interactive_scopes(&ScopeSet::parse("api://x/access_as_user"));
        assert!(scopes.contains("offline_access"));
        assert!(scopes.contains("openid"));
        assert!(scopes.contains("api://x/access_as_user"));
    }

    #[test]
    fn grant_builds_account_from_id_token() {
        let (provider, _) = provider();
        let token = id_token(serde_json::json!({
            "oid": "o-1", "tid": "tenant-1", "name": "Test User",
            "preferred_username": "test@example.com", "nonce": "n-1"
        }));

        let grant = provider
            .provider_grant(grant(Some(token)), None, Some("n-1"))
            .unwrap();
        assert_eq!(grant.account.id, AccountId::new("o-1", "tenant-1"));
        assert_eq!(grant.account.environment, "login.example.com");
        assert_eq!(grant.token.account_id, grant.account.id);
        assert_eq!(grant.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn grant_rejects_nonce_mismatch() {
        let (provider, _) = provider();
        let token = id_token(serde_json::json!({ "oid": "o", "nonce": "other" }));
        let result = provider.provider_grant(grant(Some(token)), None, Some("expected"));
        assert!(matches!(result, Err(ProviderError::Rejected { .. })));
    }

    #[test]
    fn grant_without_id_token_uses_fallback_account() {
        let (provider, _) = provider();
        let account = Account {
            id: AccountId::new("o", "t"),
            environment: "login.example.com".to_string(),
            display_name: None,
            username: "u".to_string(),
            claims: serde_json::Map::new(),
        };
        let result = provider
            .provider_grant(grant(None), Some(&account), None)
            .unwrap();
        assert_eq!(result.account.id, account.id);

        assert!(provider.provider_grant(grant(None), None, None).is_err());
    }

    #[tokio::test]
    async fn redirect_persists_pending_interaction() {
        let (provider, store) = provider();
        let started = provider
            .login_redirect(&ScopeSet::parse("User.Read"))
            .await
            .unwrap();

        let pending = store.pending_interaction().unwrap().unwrap();
        assert_eq!(pending.purpose, InteractionPurpose::Login);
        assert!(started.authorization_url.contains(&pending.state));
        assert!(
            started
                .authorization_url
                .starts_with("https://login.example.com/tenant-1/oauth2/v2.0/authorize?")
        );
    }

    #[tokio::test]
    async fn redirect_callback_without_pending_is_ignored() {
        let (provider, _) = provider();
        let result = provider
            .handle_redirect_response("http://localhost:8400/callback?code=c&state=s")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn redirect_callback_state_mismatch_keeps_pending() {
        let (provider, store) = provider();
        provider
            .login_redirect(&ScopeSet::parse("User.Read"))
            .await
            .unwrap();
        let expected = store.pending_interaction().unwrap().unwrap().state;

        for forged in [
            "http://localhost:8400/callback?code=c&state=forged",
            "http://localhost:8400/callback?error=access_denied",
        ] {
            let result = provider.handle_redirect_response(forged).await;
            assert!(matches!(result, Err(ProviderError::StateMismatch)));
        }
        let pending = store.pending_interaction().unwrap().unwrap();
        assert_eq!(pending.state, expected);
    }

    #[tokio::test]
    async fn redirect_callback_error_is_reported() {
        let (provider, store) = provider();
        provider
            .login_redirect(&ScopeSet::parse("User.Read"))
            .await
            .unwrap();
        let state = store.pending_interaction().unwrap().unwrap().state;

        let result = provider
            .handle_redirect_response(&format!(
                "http://localhost:8400/callback?error=access_denied&state={state}"
            ))
            .await;
        assert!(matches!(result, Err(ProviderError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn logout_url_points_at_end_session_endpoint() {
        let (provider, _) = provider();
        let mut claims = serde_json::Map::new();
        claims.insert("login_hint".to_string(), serde_json::json!("hint-1"));
        let account = Account {
            id: AccountId::new("o", "t"),
            environment: "login.example.com".to_string(),
            display_name: None,
            username: "u".to_string(),
            claims,
        };

        let url = provider.logout_redirect(&account).await.unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(parsed.path(), "/tenant-1/oauth2/v2.0/logout");
        assert_eq!(
            params.get("post_logout_redirect_uri").unwrap(),
            "http://localhost:8400"
        );
        assert_eq!(params.get("logout_hint").unwrap(), "hint-1");
    }
}
