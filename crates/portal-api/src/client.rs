//! Typed clients for the resources Portal calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use portal_auth::{ScopeRequest, ScopeSet};

use crate::dispatcher::AuthorizedRequestDispatcher;
use crate::error::Result;

/// Default base URL of the protected API.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Placeholder scope exposed by the protected API.
pub const DEFAULT_API_SCOPE: &str = "api://YOUR_API_CLIENT_ID/access_as_user";

/// Default profile endpoint.
pub const DEFAULT_GRAPH_ENDPOINT: &str = "https://graph.microsoft.com/v1.0/me";

/// Where the protected resources live and which scopes they need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_api_scope")]
    pub api_scope: String,
    #[serde(default = "default_graph_endpoint")]
    pub graph_endpoint: String,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_api_scope() -> String {
    DEFAULT_API_SCOPE.to_string()
}

fn default_graph_endpoint() -> String {
    DEFAULT_GRAPH_ENDPOINT.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_scope: default_api_scope(),
            graph_endpoint: default_graph_endpoint(),
        }
    }
}

impl ApiConfig {
    /// URL of `path` under the API base, tolerating a trailing slash.
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// ---------------------------------------------------------------------------
// Protected API
// ---------------------------------------------------------------------------

/// Client for the application's own protected API.
#[derive(Clone)]
pub struct ApiClient {
    dispatcher: AuthorizedRequestDispatcher,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(dispatcher: AuthorizedRequestDispatcher, config: ApiConfig) -> Self {
        Self { dispatcher, config }
    }

    /// `GET /hello`; the body is returned as the server sent it.
    pub async fn hello(&self) -> Result<Value> {
        let request = ScopeRequest::new(ScopeSet::parse(&self.config.api_scope));
        self.dispatcher
            .call_protected_resource(&self.config.api_url("hello"), &request)
            .await
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// The signed-in user's directory profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
    pub job_title: Option<String>,
    pub office_location: Option<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

impl Profile {
    /// Mail address, falling back to the user principal name.
    pub fn email(&self) -> Option<&str> {
        self.mail
            .as_deref()
            .or(self.user_principal_name.as_deref())
    }
}

/// Client for the profile endpoint, called with the login scopes.
#[derive(Clone)]
pub struct ProfileClient {
    dispatcher: AuthorizedRequestDispatcher,
    endpoint: String,
}

impl ProfileClient {
    pub fn new(dispatcher: AuthorizedRequestDispatcher, config: &ApiConfig) -> Self {
        Self {
            dispatcher,
            endpoint: config.graph_endpoint.clone(),
        }
    }

    pub async fn me(&self) -> Result<Profile> {
        let scopes = self.dispatcher.session().login_scopes().clone();
        self.dispatcher
            .get_json(&self.endpoint, &ScopeRequest::new(scopes))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_joins_paths() {
        let mut config = ApiConfig::default();
        assert_eq!(config.api_url("hello"), "http://localhost:8080/api/hello");

        config.api_base_url = "http://localhost:9000/api/".to_string();
        assert_eq!(config.api_url("/hello"), "http://localhost:9000/api/hello");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ApiConfig =
            serde_json::from_str(r#"{"api_scope":"api://x/access_as_user"}"#).unwrap();
        assert_eq!(config.api_scope, "api://x/access_as_user");
        assert_eq!(config.graph_endpoint, DEFAULT_GRAPH_ENDPOINT);
    }

    #[test]
    fn profile_email_falls_back_to_upn() {
        let profile: Profile = serde_json::from_str(
            r#"{"displayName":"Test User","userPrincipalName":"test@contoso.com","id":"42"}"#,
        )
        .unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Test User"));
        assert_eq!(profile.email(), Some("test@contoso.com"));
        assert_eq!(profile.other["id"], "42");

        let with_mail = Profile {
            mail: Some("mail@contoso.com".to_string()),
            ..profile
        };
        assert_eq!(with_mail.email(), Some("mail@contoso.com"));
    }
}
