//! The identity-provider collaborator seam.
//!
//! The engine and session controller depend only on the success/failure
//! contract of these operations, never on their transport. [`OidcProvider`]
//! implements them against a real authority; tests substitute a scripted
//! provider.
//!
//! [`OidcProvider`]: crate::oidc::OidcProvider

use async_trait::async_trait;

use crate::account::{Account, AccountId, ScopeSet, Token};
use crate::error::ProviderError;

/// Result of any successful authentication with the provider.
#[derive(Debug, Clone)]
pub struct ProviderGrant {
    /// The authenticated account, with refreshed claims.
    pub account: Account,
    /// The access token issued for the requested scopes.
    pub token: Token,
    /// A refresh credential for later silent acquisition, if one was issued.
    pub refresh_token: Option<String>,
}

/// Input for a silent acquisition.
#[derive(Debug, Clone)]
pub struct SilentRequest {
    pub account: Account,
    pub scopes: ScopeSet,
    /// The cached refresh credential for `account`.
    pub refresh_token: String,
}

/// A redirect-mode interaction that has been started but not finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectStarted {
    /// Where the user agent must navigate.
    pub authorization_url: String,
}

/// Operations of the external authentication collaborator.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtain a token without user interaction by redeeming the refresh
    /// credential.
    ///
    /// Must report [`ProviderError::InteractionRequired`] when only an
    /// interactive flow can proceed, and any other variant for failures
    /// that interaction cannot fix.
    async fn acquire_token_silent(
        &self,
        request: &SilentRequest,
    ) -> Result<ProviderGrant, ProviderError>;

    /// Interactive sign-in through a popup surface.
    async fn login_popup(&self, scopes: &ScopeSet) -> Result<ProviderGrant, ProviderError>;

    /// Start an interactive sign-in through a full redirect.
    async fn login_redirect(&self, scopes: &ScopeSet) -> Result<RedirectStarted, ProviderError>;

    /// Interactive token acquisition through a popup surface.
    async fn acquire_token_popup(
        &self,
        account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<ProviderGrant, ProviderError>;

    /// Start an interactive token acquisition through a full redirect.
    async fn acquire_token_redirect(
        &self,
        account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<RedirectStarted, ProviderError>;

    /// Complete a redirect interaction from the callback URL echoed to the
    /// redirect URI. Returns `Ok(None)` when no interaction was pending.
    async fn handle_redirect_response(
        &self,
        callback_url: &str,
    ) -> Result<Option<ProviderGrant>, ProviderError>;

    /// Build the provider sign-out navigation for `account`.
    ///
    /// Returns the end-session URL the user agent should visit.
    async fn logout_redirect(&self, account: &Account) -> Result<String, ProviderError>;
}

/// Identity of an interactive surface, used to coalesce concurrent popups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InteractionKey {
    pub account: Option<AccountId>,
    pub scopes: String,
}

impl InteractionKey {
    pub fn new(account: Option<&AccountId>, scopes: &ScopeSet) -> Self {
        Self {
            account: account.cloned(),
            scopes: scopes.canonical_key(),
        }
    }
}
