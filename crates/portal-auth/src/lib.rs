//! Sign-in and token acquisition for Portal.
//!
//! This crate signs users in against an OpenID Connect identity provider
//! and keeps delegated access tokens available for calling protected
//! resources:
//!
//! - **Account store** holding accounts, tokens, refresh credentials and
//!   the pending redirect interaction, in memory or in a session file
//! - **Token acquisition** from cache, then silent refresh, then exactly
//!   one interactive escalation
//! - **Session controller** tracking sign-in state across the process
//! - **OIDC provider** with authorization code + PKCE (RFC 7636) through a
//!   popup (system browser plus loopback callback) or a redirect
//!
//! # Architecture
//!
//! ```text
//! AuthSessionController
//! └── TokenAcquisitionEngine
//!     ├── AccountStore        (accounts, tokens, pending redirect)
//!     └── IdentityProvider    (OidcProvider)
//!         ├── OAuthClient     (authorize + token endpoints)
//!         └── CallbackServer  (loopback listener for popups)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use portal_auth::{
//!     AccountStore, AuthSessionController, BootContext, InteractionMode, OidcConfig,
//!     OidcProvider, ScopeRequest, ScopeSet, TokenAcquisitionEngine,
//! };
//!
//! # async fn example() -> portal_auth::error::Result<()> {
//! let store = Arc::new(AccountStore::in_memory());
//! let config = OidcConfig::new("my-client-id", "my-tenant-id");
//! let login_scopes = config.login_scopes.clone();
//! let provider = Arc::new(OidcProvider::new(config, Arc::clone(&store))?);
//! let engine = TokenAcquisitionEngine::new(store, provider);
//!
//! let (session, _report) =
//!     AuthSessionController::boot(engine, login_scopes, BootContext::default()).await?;
//! session.login(InteractionMode::Popup).await?;
//!
//! let request = ScopeRequest::new(ScopeSet::parse("api://my-api/access_as_user"));
//! let token = session.acquire_token(&request).await.into_result()?;
//! println!("expires at {}", token.expires_at);
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod oauth;
pub mod oidc;
pub mod provider;
pub mod session;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export key types at the crate root for convenience.
pub use account::{Account, AccountId, InteractionMode, ScopeRequest, ScopeSet, Token};
pub use callback::CallbackServer;
pub use config::OidcConfig;
pub use engine::{AuthOutcome, InteractionRequired, TokenAcquisitionEngine};
pub use error::{AuthError, AuthErrorKind, ProviderError, StoreError};
pub use oidc::OidcProvider;
pub use provider::IdentityProvider;
pub use session::{
    AuthSessionController, BootContext, BootReport, LoginOutcome, LogoutOutcome, SessionState,
};
pub use store::{AccountStore, CacheLocation, WriteCondition};
