//! Process-wide session state machine.
//!
//! ```text
//! Unauthenticated --login--> Authenticating --success--> Authenticated
//!        ^                         |                          |
//!        +-------failure/cancel----+                       logout
//!        |                                                    v
//!        +-------------------sign-out complete---------- SigningOut
//! ```
//!
//! The controller is an explicit handle, not a global. It is created once
//! per process by [`AuthSessionController::boot`], which recovers state from
//! the account store and, when the process was started by a provider
//! redirect, from the echoed callback URL.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountId, InteractionMode, ScopeRequest, ScopeSet};
use crate::config::DEFAULT_REDIRECT_TIMEOUT_SECS;
use crate::engine::{AuthOutcome, TokenAcquisitionEngine};
use crate::error::AuthError;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    SigningOut,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::SigningOut => "signing_out",
        })
    }
}

/// Inputs to the one-time startup evaluation.
#[derive(Debug, Clone)]
pub struct BootContext {
    /// Set when this process was started by the provider's redirect.
    pub callback_url: Option<String>,
    /// Age after which an unanswered redirect is discarded.
    pub redirect_timeout: Duration,
}

impl Default for BootContext {
    fn default() -> Self {
        Self {
            callback_url: None,
            redirect_timeout: Duration::from_secs(DEFAULT_REDIRECT_TIMEOUT_SECS),
        }
    }
}

impl BootContext {
    pub fn with_callback(callback_url: impl Into<String>) -> Self {
        Self {
            callback_url: Some(callback_url.into()),
            ..Self::default()
        }
    }
}

/// What startup recovered.
#[derive(Debug, Clone, Default)]
pub struct BootReport {
    /// Account signed in by a completed redirect.
    pub redirect_account: Option<Account>,
    /// Why a redirect callback could not be completed.
    pub redirect_error: Option<AuthError>,
    /// A redirect that never returned was dropped.
    pub discarded_stale_redirect: bool,
}

/// Result of [`AuthSessionController::login`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// The popup completed and the account is stored.
    SignedIn(Account),
    /// The user agent must navigate away; the next boot completes sign-in.
    Redirecting { authorization_url: String },
    /// A sign-in is already running; nothing new was started.
    AlreadyInProgress,
}

/// Result of [`AuthSessionController::logout`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogoutOutcome {
    /// Provider end-session navigation, when an account was signed in.
    pub end_session_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Session state machine wrapping sign-in, sign-out, and token acquisition.
pub struct AuthSessionController {
    engine: TokenAcquisitionEngine,
    login_scopes: ScopeSet,
    state: Mutex<SessionState>,
}

impl AuthSessionController {
    /// Create the controller and run the startup evaluation.
    ///
    /// # Errors
    ///
    /// Only store failures are errors; a failed redirect completion is
    /// reported in the [`BootReport`] and leaves the session
    /// `Unauthenticated` (unless other accounts remain).
    pub async fn boot(
        engine: TokenAcquisitionEngine,
        login_scopes: ScopeSet,
        context: BootContext,
    ) -> Result<(Self, BootReport), AuthError> {
        let controller = Self {
            engine,
            login_scopes,
            state: Mutex::new(SessionState::Unauthenticated),
        };
        let mut report = BootReport::default();
        let store = controller.engine.store();

        if let Some(callback_url) = &context.callback_url {
            match controller.engine.complete_redirect(callback_url).await {
                Ok(account) => report.redirect_account = account,
                Err(err) => {
                    tracing::warn!(error = %err, "redirect callback could not be completed");
                    report.redirect_error = Some(err);
                }
            }
        } else if let Some(pending) = store.pending_interaction()? {
            let age = Utc::now().signed_duration_since(pending.created_at);
            let limit = chrono::Duration::from_std(context.redirect_timeout)
                .unwrap_or(chrono::Duration::MAX);
            if age > limit {
                store.take_pending_interaction()?;
                report.discarded_stale_redirect = true;
                tracing::info!(
                    age_secs = age.num_seconds(),
                    "discarded a redirect interaction that never returned"
                );
            }
        }

        let state = controller.reconcile()?;
        tracing::info!(state = %state, "session booted");
        Ok((controller, report))
    }

    /// Current lifecycle state.
    pub fn session_state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Signed-in accounts in insertion order.
    pub fn current_accounts(&self) -> Result<Vec<Account>, AuthError> {
        Ok(self.engine.store().list_accounts()?)
    }

    /// The account used for requests that name none.
    pub fn active_account(&self) -> Result<Option<Account>, AuthError> {
        Ok(self.engine.store().active_account()?)
    }

    pub fn engine(&self) -> &TokenAcquisitionEngine {
        &self.engine
    }

    pub fn login_scopes(&self) -> &ScopeSet {
        &self.login_scopes
    }

    /// Sign in interactively.
    ///
    /// A call while another sign-in is running returns
    /// [`LoginOutcome::AlreadyInProgress`] without opening another surface.
    ///
    /// # Errors
    ///
    /// Provider failures (including cancellation) are returned unchanged
    /// after the state falls back to `Unauthenticated`, or `Authenticated`
    /// if other accounts remain. Nothing is retried.
    pub async fn login(&self, mode: InteractionMode) -> Result<LoginOutcome, AuthError> {
        let transition = match self.begin(SessionState::Authenticating)? {
            Some(transition) => transition,
            None => {
                tracing::debug!("login ignored, sign-in already in progress");
                return Ok(LoginOutcome::AlreadyInProgress);
            }
        };

        tracing::info!(mode = ?mode, "sign-in requested");

        match mode {
            InteractionMode::Popup => {
                let account = self.engine.login_popup(&self.login_scopes).await?;
                transition.finish(SessionState::Authenticated);
                tracing::info!(account = %account.id, "signed in");
                Ok(LoginOutcome::SignedIn(account))
            }
            InteractionMode::Redirect => {
                let authorization_url = self.engine.login_redirect(&self.login_scopes).await?;
                // The process is expected to navigate away; the next boot
                // resolves the state.
                transition.finish(SessionState::Authenticating);
                Ok(LoginOutcome::Redirecting { authorization_url })
            }
        }
    }

    /// Sign out every account and clear the cache.
    ///
    /// # Errors
    ///
    /// Fails only if the store cannot be cleared. A provider failure to
    /// build the end-session navigation is logged and local sign-out still
    /// completes.
    pub async fn logout(&self) -> Result<LogoutOutcome, AuthError> {
        let Some(transition) = self.begin(SessionState::SigningOut)? else {
            return Ok(LogoutOutcome::default());
        };

        let store = self.engine.store();
        let end_session_url = match store.active_account()? {
            Some(account) => match self.engine.provider().logout_redirect(&account).await {
                Ok(url) => Some(url),
                Err(err) => {
                    tracing::warn!(error = %err, "provider sign-out navigation unavailable");
                    None
                }
            },
            None => None,
        };

        store.clear()?;
        transition.finish(SessionState::Unauthenticated);
        tracing::info!("signed out");

        Ok(LogoutOutcome { end_session_url })
    }

    /// Acquire a token through the engine.
    pub async fn acquire_token(&self, request: &ScopeRequest) -> AuthOutcome {
        self.engine.acquire_token(request).await
    }

    /// Drop cached tokens the resource server rejected.
    pub fn evict_token(&self, account: &AccountId, scopes: &ScopeSet) -> Result<usize, AuthError> {
        self.engine.evict_token(account, scopes)
    }

    // -- Internal helpers ---------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Derive the resting state from the store.
    fn reconcile(&self) -> Result<SessionState, AuthError> {
        let has_account = !self.engine.store().list_accounts()?.is_empty();
        let state = if has_account {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
        *self.lock_state() = state;
        Ok(state)
    }

    /// Enter a transient state, unless that transition is already running.
    fn begin(&self, next: SessionState) -> Result<Option<Transition<'_>>, AuthError> {
        let mut state = self.lock_state();
        match (*state, next) {
            (SessionState::Authenticating, SessionState::Authenticating)
            | (SessionState::SigningOut, SessionState::SigningOut) => Ok(None),
            (SessionState::SigningOut, SessionState::Authenticating) => {
                Err(AuthError::InteractionFailed {
                    reason: "sign-out in progress".to_string(),
                    cancelled: false,
                })
            }
            _ => {
                *state = next;
                Ok(Some(Transition {
                    controller: self,
                    finished: false,
                }))
            }
        }
    }
}

/// An in-progress transition. Dropping it unfinished (error or cancelled
/// future) reconciles the state from the store.
struct Transition<'a> {
    controller: &'a AuthSessionController,
    finished: bool,
}

impl Transition<'_> {
    fn finish(mut self, state: SessionState) {
        *self.controller.lock_state() = state;
        self.finished = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.controller.reconcile() {
            tracing::warn!(error = %err, "could not reconcile session state");
            *self.controller.lock_state() = SessionState::Unauthenticated;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ProviderError;
    use crate::store::{AccountStore, InteractionPurpose, PendingInteraction};
    use crate::testing::{ScriptedProvider, TEST_LOGOUT_URL, test_account, test_token};

    async fn boot_with(
        provider: Arc<ScriptedProvider>,
        store: Arc<AccountStore>,
        context: BootContext,
    ) -> (AuthSessionController, BootReport) {
        let engine = TokenAcquisitionEngine::new(store, provider);
        AuthSessionController::boot(engine, ScopeSet::parse("User.Read openid"), context)
            .await
            .unwrap()
    }

    fn pending(age_secs: i64) -> PendingInteraction {
        PendingInteraction {
            state: "s".to_string(),
            code_verifier: "v".to_string(),
            nonce: "n".to_string(),
            scopes: ScopeSet::parse("User.Read"),
            purpose: InteractionPurpose::Login,
            account: None,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn boots_unauthenticated_with_empty_store() {
        let (session, report) = boot_with(
            Arc::new(ScriptedProvider::new()),
            Arc::new(AccountStore::in_memory()),
            BootContext::default(),
        )
        .await;
        assert_eq!(session.session_state(), SessionState::Unauthenticated);
        assert!(report.redirect_account.is_none());
    }

    #[tokio::test]
    async fn boots_authenticated_from_prior_session() {
        let store = Arc::new(AccountStore::in_memory());
        store.add_or_replace(test_account("a")).unwrap();
        let (session, _) = boot_with(
            Arc::new(ScriptedProvider::new()),
            store,
            BootContext::default(),
        )
        .await;
        assert_eq!(session.session_state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn boot_completes_redirect_callback() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_redirect_success("r", "from-redirect");
        let (session, report) = boot_with(
            provider,
            Arc::new(AccountStore::in_memory()),
            BootContext::with_callback("http://localhost:8400/callback?code=c&state=s"),
        )
        .await;

        assert_eq!(session.session_state(), SessionState::Authenticated);
        assert_eq!(report.redirect_account.unwrap().id.subject, "r");
    }

    #[tokio::test]
    async fn boot_with_failed_callback_is_unauthenticated() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_redirect_failure(ProviderError::StateMismatch);
        let (session, report) = boot_with(
            provider,
            Arc::new(AccountStore::in_memory()),
            BootContext::with_callback("http://localhost:8400/callback?code=c&state=x"),
        )
        .await;

        assert_eq!(session.session_state(), SessionState::Unauthenticated);
        assert!(matches!(
            report.redirect_error,
            Some(AuthError::InteractionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn boot_discards_stale_redirect_only() {
        let store = Arc::new(AccountStore::in_memory());
        store.set_pending_interaction(pending(3600)).unwrap();
        let (_, report) = boot_with(
            Arc::new(ScriptedProvider::new()),
            Arc::clone(&store),
            BootContext::default(),
        )
        .await;
        assert!(report.discarded_stale_redirect);
        assert!(store.pending_interaction().unwrap().is_none());

        store.set_pending_interaction(pending(5)).unwrap();
        let (_, report) = boot_with(
            Arc::new(ScriptedProvider::new()),
            Arc::clone(&store),
            BootContext::default(),
        )
        .await;
        assert!(!report.discarded_stale_redirect);
        assert!(store.pending_interaction().unwrap().is_some());
    }

    #[tokio::test]
    async fn popup_login_authenticates() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_popup_success("a", "tok");
        let (session, _) = boot_with(
            Arc::clone(&provider),
            Arc::new(AccountStore::in_memory()),
            BootContext::default(),
        )
        .await;

        let outcome = session.login(InteractionMode::Popup).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::SignedIn(ref a) if a.id.subject == "a"));
        assert_eq!(session.session_state(), SessionState::Authenticated);
        assert_eq!(session.current_accounts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_login_returns_to_unauthenticated() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_popup_failure(ProviderError::Cancelled {
            reason: "closed".to_string(),
        });
        let (session, _) = boot_with(
            Arc::clone(&provider),
            Arc::new(AccountStore::in_memory()),
            BootContext::default(),
        )
        .await;

        let err = session.login(InteractionMode::Popup).await.unwrap_err();
        assert!(matches!(err, AuthError::InteractionFailed { cancelled: true, .. }));
        assert_eq!(session.session_state(), SessionState::Unauthenticated);
        assert!(session.current_accounts().unwrap().is_empty());
        assert_eq!(provider.interactive_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_login_is_a_no_op() {
        let provider =
            Arc::new(ScriptedProvider::new().with_popup_delay(Duration::from_millis(50)));
        provider.push_popup_success("a", "tok");
        let (session, _) = boot_with(
            Arc::clone(&provider),
            Arc::new(AccountStore::in_memory()),
            BootContext::default(),
        )
        .await;

        let (first, second) = tokio::join!(
            session.login(InteractionMode::Popup),
            session.login(InteractionMode::Popup)
        );
        assert!(matches!(first.unwrap(), LoginOutcome::SignedIn(_)));
        assert_eq!(second.unwrap(), LoginOutcome::AlreadyInProgress);
        assert_eq!(provider.interactive_calls(), 1);
    }

    #[tokio::test]
    async fn redirect_login_stays_authenticating() {
        let provider = Arc::new(ScriptedProvider::new());
        let (session, _) = boot_with(
            Arc::clone(&provider),
            Arc::new(AccountStore::in_memory()),
            BootContext::default(),
        )
        .await;

        let outcome = session.login(InteractionMode::Redirect).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Redirecting { .. }));
        assert_eq!(session.session_state(), SessionState::Authenticating);
        assert_eq!(
            session.login(InteractionMode::Popup).await.unwrap(),
            LoginOutcome::AlreadyInProgress
        );
    }

    #[tokio::test]
    async fn logout_clears_accounts_and_tokens() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(AccountStore::in_memory());
        store.add_or_replace(test_account("a")).unwrap();
        store.store_token(test_token("a", "s", "tok")).unwrap();
        let (session, _) =
            boot_with(Arc::clone(&provider), Arc::clone(&store), BootContext::default()).await;

        let outcome = session.logout().await.unwrap();
        assert_eq!(outcome.end_session_url.as_deref(), Some(TEST_LOGOUT_URL));
        assert_eq!(session.session_state(), SessionState::Unauthenticated);
        assert!(session.current_accounts().unwrap().is_empty());
        assert!(
            store
                .find_cached_token(&AccountId::new("a", "tenant"), &ScopeSet::parse("s"))
                .unwrap()
                .is_none()
        );
        assert_eq!(provider.logout_calls(), 1);
    }

    #[tokio::test]
    async fn logout_without_account_skips_provider() {
        let provider = Arc::new(ScriptedProvider::new());
        let (session, _) = boot_with(
            Arc::clone(&provider),
            Arc::new(AccountStore::in_memory()),
            BootContext::default(),
        )
        .await;
        let outcome = session.logout().await.unwrap();
        assert!(outcome.end_session_url.is_none());
        assert_eq!(provider.logout_calls(), 0);
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::SigningOut.to_string(), "signing_out");
        assert_eq!(
            serde_json::to_string(&SessionState::Authenticated).unwrap(),
            "\"authenticated\""
        );
    }
}
