//! Accounts, scopes, and access tokens.
//!
//! These are plain value types shared by the store, the engine, and the
//! provider collaborator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scopes that identity providers grant implicitly and never echo back in an
/// access token's granted scope list.
pub const OIDC_SCOPES: [&str; 4] = ["openid", "profile", "offline_access", "email"];

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Stable identifier of an account: subject within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId {
    /// Object id (`oid`) or subject (`sub`) claim.
    pub subject: String,
    /// Tenant (`tid`) the subject belongs to.
    pub tenant: String,
}

impl AccountId {
    pub fn new(subject: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            tenant: tenant.into(),
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subject, self.tenant)
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Host of the authority that issued the account (e.g.
    /// `login.microsoftonline.com`).
    pub environment: String,
    /// Human-readable name (`name` claim).
    pub display_name: Option<String>,
    /// Sign-in name (`preferred_username` claim).
    pub username: String,
    /// Raw identity-token claims, never verified by this crate.
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Account {
    /// Build an account from decoded ID-token claims.
    ///
    /// `fallback_tenant` is used when the token carries no `tid` claim.
    /// Returns `None` when neither `oid` nor `sub` is present.
    pub fn from_claims(
        claims: serde_json::Map<String, serde_json::Value>,
        environment: &str,
        fallback_tenant: &str,
    ) -> Option<Self> {
        let claim = |name: &str| {
            claims
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let subject = claim("oid").or_else(|| claim("sub"))?;
        let tenant = claim("tid").unwrap_or_else(|| fallback_tenant.to_string());
        let username = claim("preferred_username")
            .or_else(|| claim("upn"))
            .or_else(|| claim("email"))
            .unwrap_or_default();
        let display_name = claim("name");

        Some(Self {
            id: AccountId::new(subject, tenant),
            environment: environment.to_string(),
            display_name,
            username,
            claims,
        })
    }

    /// Name to greet the user with.
    pub fn greeting_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// An ordered, de-duplicated set of scope strings.
///
/// Comparison is ASCII case-insensitive, as identity providers treat scope
/// names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ScopeSet(Vec<String>);

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for scope in scopes {
            let scope: String = scope.into();
            let scope = scope.trim();
            if scope.is_empty() || out.iter().any(|s| s.eq_ignore_ascii_case(scope)) {
                continue;
            }
            out.push(scope.to_string());
        }
        Self(out)
    }

    /// Parse a space-delimited scope string as returned by token endpoints.
    pub fn parse(value: &str) -> Self {
        Self::new(value.split_whitespace())
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s.eq_ignore_ascii_case(scope))
    }

    /// Whether a token granted for `self` satisfies a request for
    /// `requested` (exact or superset match).
    ///
    /// Reserved OIDC scopes in the request are ignored because they are not
    /// echoed in the granted scope list.
    pub fn covers(&self, requested: &ScopeSet) -> bool {
        requested
            .iter()
            .filter(|scope| !is_oidc_scope(scope))
            .all(|scope| self.contains(scope))
    }

    /// Set equality, ignoring order and case.
    pub fn same_as(&self, other: &ScopeSet) -> bool {
        self.0.len() == other.0.len() && self.0.iter().all(|s| other.contains(s))
    }

    /// Return a copy with `scope` appended if not already present.
    pub fn with(&self, scope: &str) -> Self {
        let mut scopes = self.0.clone();
        scopes.push(scope.to_string());
        Self::new(scopes)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Space-delimited form for the `scope` request parameter.
    pub fn to_param(&self) -> String {
        self.0.join(" ")
    }

    /// Lower-cased, sorted form used as a map key.
    pub fn canonical_key(&self) -> String {
        let mut scopes: Vec<String> = self.0.iter().map(|s| s.to_ascii_lowercase()).collect();
        scopes.sort();
        scopes.join(" ")
    }
}

fn is_oidc_scope(scope: &str) -> bool {
    OIDC_SCOPES.iter().any(|s| s.eq_ignore_ascii_case(scope))
}

impl PartialEq for ScopeSet {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for ScopeSet {}

impl From<Vec<String>> for ScopeSet {
    fn from(scopes: Vec<String>) -> Self {
        Self::new(scopes)
    }
}

impl From<ScopeSet> for Vec<String> {
    fn from(scopes: ScopeSet) -> Self {
        scopes.0
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_param())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Which interactive surface to use when user interaction is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// A separate sign-in surface whose result returns to the caller.
    #[default]
    Popup,
    /// A full navigation away; the result arrives on the next boot.
    Redirect,
}

impl std::str::FromStr for InteractionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "popup" => Ok(Self::Popup),
            "redirect" => Ok(Self::Redirect),
            other => Err(format!("unknown interaction mode: {other}")),
        }
    }
}

/// A request for an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRequest {
    pub scopes: ScopeSet,
    /// Account to acquire for; the active account when `None`.
    pub account: Option<AccountId>,
    /// Surface to use if the silent path requires interaction.
    pub interaction: InteractionMode,
}

impl ScopeRequest {
    pub fn new(scopes: ScopeSet) -> Self {
        Self {
            scopes,
            account: None,
            interaction: InteractionMode::Popup,
        }
    }

    pub fn for_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_interaction(mut self, mode: InteractionMode) -> Self {
        self.interaction = mode;
        self
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// An access token issued for an account and scope set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub scopes: ScopeSet,
    pub expires_at: DateTime<Utc>,
    pub account_id: AccountId,
}

impl Token {
    /// Valid while `now < expires_at`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("account_id", &self.account_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
