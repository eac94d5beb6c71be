//! Identity-provider client configuration.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::account::ScopeSet;
use crate::error::AuthError;

/// Default authority host.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Default loopback redirect URI for the callback server.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8400/callback";

/// Scopes requested at sign-in.
pub const DEFAULT_LOGIN_SCOPES: [&str; 4] = ["User.Read", "openid", "profile", "email"];

/// Seconds the loopback callback server waits for the browser (5 minutes).
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;

/// Seconds after which an unanswered redirect is considered abandoned.
pub const DEFAULT_REDIRECT_TIMEOUT_SECS: u64 = 600;

/// Configuration of the public OAuth client registered with the identity
/// provider.
///
/// Read once at startup and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Application (client) id.
    #[serde(default)]
    pub client_id: String,

    /// Tenant id or alias (`common`, `organizations`).
    #[serde(default)]
    pub tenant_id: String,

    /// Authority base URL; `<authority host>/<tenant>` when unset.
    #[serde(default)]
    pub authority: Option<String>,

    /// Redirect URI registered for the client.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Where the provider returns after sign-out; the redirect URI's origin
    /// when unset.
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,

    /// Scopes requested by `login`.
    #[serde(default = "default_login_scopes")]
    pub login_scopes: ScopeSet,

    /// How long the loopback listener waits for the popup callback.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,

    /// How long a redirect interaction may stay unanswered.
    #[serde(default = "default_redirect_timeout")]
    pub redirect_timeout_secs: u64,
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.to_string()
}

fn default_login_scopes() -> ScopeSet {
    ScopeSet::new(DEFAULT_LOGIN_SCOPES)
}

fn default_callback_timeout() -> u64 {
    DEFAULT_CALLBACK_TIMEOUT_SECS
}

fn default_redirect_timeout() -> u64 {
    DEFAULT_REDIRECT_TIMEOUT_SECS
}

impl OidcConfig {
    /// Configuration with defaults for everything but the client and tenant.
    pub fn new(client_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            tenant_id: tenant_id.into(),
            authority: None,
            redirect_uri: default_redirect_uri(),
            post_logout_redirect_uri: None,
            login_scopes: default_login_scopes(),
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            redirect_timeout_secs: DEFAULT_REDIRECT_TIMEOUT_SECS,
        }
    }

    /// Check the configuration before any flow runs.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] for empty identifiers or
    /// unparsable URLs.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.client_id.trim().is_empty() {
            return Err(invalid("client_id must not be empty"));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(invalid("tenant_id must not be empty"));
        }
        self.authority_url()?;
        Url::parse(&self.redirect_uri)
            .map_err(|e| invalid(&format!("redirect_uri is not a URL: {e}")))?;
        if let Some(uri) = &self.post_logout_redirect_uri {
            Url::parse(uri)
                .map_err(|e| invalid(&format!("post_logout_redirect_uri is not a URL: {e}")))?;
        }
        Ok(())
    }

    /// Authority base URL without a trailing slash.
    pub fn authority_url(&self) -> Result<Url, AuthError> {
        let raw = match &self.authority {
            Some(authority) => authority.trim_end_matches('/').to_string(),
            None => format!("{DEFAULT_AUTHORITY_HOST}/{}", self.tenant_id),
        };
        Url::parse(&raw).map_err(|e| invalid(&format!("authority is not a URL: {e}")))
    }

    /// Host of the authority, recorded as each account's environment.
    pub fn environment(&self) -> String {
        self.authority_url()
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn authorize_endpoint(&self) -> Result<Url, AuthError> {
        self.endpoint("oauth2/v2.0/authorize")
    }

    pub fn token_endpoint(&self) -> Result<Url, AuthError> {
        self.endpoint("oauth2/v2.0/token")
    }

    pub fn logout_endpoint(&self) -> Result<Url, AuthError> {
        self.endpoint("oauth2/v2.0/logout")
    }

    /// Post-logout redirect target.
    pub fn post_logout_redirect(&self) -> String {
        if let Some(uri) = &self.post_logout_redirect_uri {
            return uri.clone();
        }
        Url::parse(&self.redirect_uri)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| self.redirect_uri.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        let base = self.authority_url()?;
        let joined = format!("{}/{path}", base.as_str().trim_end_matches('/'));
        Url::parse(&joined).map_err(|e| invalid(&format!("invalid endpoint URL: {e}")))
    }
}

fn invalid(reason: &str) -> AuthError {
    AuthError::InvalidConfig {
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoints_use_tenant_authority() {
        let config = OidcConfig::new("client", "contoso");
        assert_eq!(
            config.authorize_endpoint().unwrap().as_str(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/authorize"
        );
        assert_eq!(
            config.token_endpoint().unwrap().as_str(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        assert_eq!(config.environment(), "login.microsoftonline.com");
    }

    #[test]
    fn custom_authority_trailing_slash_is_ignored() {
        let mut config = OidcConfig::new("client", "t");
        config.authority = Some("http://127.0.0.1:9000/t/".to_string());
        assert_eq!(
            config.logout_endpoint().unwrap().as_str(),
            "http://127.0.0.1:9000/t/oauth2/v2.0/logout"
        );
        assert_eq!(config.environment(), "127.0.0.1");
    }

    #[test]
    fn validate_rejects_empty_client_id() {
        let config = OidcConfig::new(" ", "t");
        assert!(matches!(
            config.validate(),
            Err(AuthError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_redirect_uri() {
        let mut config = OidcConfig::new("c", "t");
        config.redirect_uri = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        OidcConfig::new("c", "t").validate().unwrap();
    }

    #[test]
    fn post_logout_defaults_to_redirect_origin() {
        let config = OidcConfig::new("c", "t");
        assert_eq!(config.post_logout_redirect(), "http://localhost:8400");
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: OidcConfig =
            serde_json::from_str(r#"{ "client_id": "c", "tenant_id": "t" }"#).unwrap();
        assert_eq!(config.redirect_uri, DEFAULT_REDIRECT_URI);
        assert!(config.login_scopes.contains("User.Read"));
        assert_eq!(config.callback_timeout_secs, DEFAULT_CALLBACK_TIMEOUT_SECS);
    }
}
