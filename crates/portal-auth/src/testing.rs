//! Test doubles for the identity-provider seam.
//!
//! Available to this crate's tests and, through the `test-util` feature, to
//! downstream crates' tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::account::{Account, AccountId, ScopeSet, Token};
use crate::error::ProviderError;
use crate::provider::{IdentityProvider, ProviderGrant, RedirectStarted, SilentRequest};

/// Tenant used by every test account.
pub const TEST_TENANT: &str = "tenant";

/// Authorization URL returned by scripted redirect interactions.
pub const TEST_AUTHORIZATION_URL: &str = "https://idp.example.com/authorize?state=scripted";

/// End-session URL returned by scripted logouts.
pub const TEST_LOGOUT_URL: &str = "https://idp.example.com/logout";

/// An account named "Test User" with subject `subject`.
pub fn test_account(subject: &str) -> Account {
    Account {
        id: AccountId::new(subject, TEST_TENANT),
        environment: "login.example.com".to_string(),
        display_name: Some("Test User".to_string()),
        username: format!("{subject}@example.com"),
        claims: serde_json::Map::new(),
    }
}

/// A token valid for one hour.
pub fn test_token(subject: &str, scopes: &str, access_token: &str) -> Token {
    Token {
        access_token: access_token.to_string(),
        token_type: "Bearer".to_string(),
        scopes: ScopeSet::parse(scopes),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        account_id: AccountId::new(subject, TEST_TENANT),
    }
}

enum Scripted {
    Grant {
        subject: String,
        access_token: String,
        refresh_token: Option<String>,
    },
    Fail(ProviderError),
}

impl Scripted {
    fn resolve(self, scopes: &ScopeSet) -> Result<ProviderGrant, ProviderError> {
        match self {
            Self::Grant {
                subject,
                access_token,
                refresh_token,
            } => Ok(ProviderGrant {
                account: test_account(&subject),
                token: test_token(&subject, &scopes.to_param(), &access_token),
                refresh_token,
            }),
            Self::Fail(err) => Err(err),
        }
    }
}

/// An [`IdentityProvider`] that replays queued responses and counts calls.
///
/// Popup sign-in and popup token acquisition share one queue and one
/// counter. Granted tokens carry whatever scopes were requested.
#[derive(Default)]
pub struct ScriptedProvider {
    silent: Mutex<VecDeque<Scripted>>,
    popup: Mutex<VecDeque<Scripted>>,
    redirect: Mutex<VecDeque<Scripted>>,
    popup_delay: Option<Duration>,
    silent_calls: AtomicUsize,
    interactive_calls: AtomicUsize,
    redirect_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    open_popups: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every popup interaction, to exercise concurrency and deadlines.
    pub fn with_popup_delay(mut self, delay: Duration) -> Self {
        self.popup_delay = Some(delay);
        self
    }

    pub fn push_silent_success(&self, subject: &str, access_token: &str, refresh: Option<&str>) {
        push(
            &self.silent,
            Scripted::Grant {
                subject: subject.to_string(),
                access_token: access_token.to_string(),
                refresh_token: refresh.map(str::to_string),
            },
        );
    }

    pub fn push_silent_interaction_required(&self, reason: &str) {
        self.push_silent_failure(ProviderError::InteractionRequired {
            reason: reason.to_string(),
        });
    }

    pub fn push_silent_failure(&self, err: ProviderError) {
        push(&self.silent, Scripted::Fail(err));
    }

    pub fn push_popup_success(&self, subject: &str, access_token: &str) {
        push(
            &self.popup,
            Scripted::Grant {
                subject: subject.to_string(),
                access_token: access_token.to_string(),
                refresh_token: Some(format!("rt-{access_token}")),
            },
        );
    }

    pub fn push_popup_failure(&self, err: ProviderError) {
        push(&self.popup, Scripted::Fail(err));
    }

    /// Queue the grant returned when a redirect callback is handled.
    pub fn push_redirect_success(&self, subject: &str, access_token: &str) {
        push(
            &self.redirect,
            Scripted::Grant {
                subject: subject.to_string(),
                access_token: access_token.to_string(),
                refresh_token: None,
            },
        );
    }

    pub fn push_redirect_failure(&self, err: ProviderError) {
        push(&self.redirect, Scripted::Fail(err));
    }

    pub fn silent_calls(&self) -> usize {
        self.silent_calls.load(Ordering::SeqCst)
    }

    /// Popup sign-ins plus popup token acquisitions.
    pub fn interactive_calls(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }

    /// Redirect interactions started.
    pub fn redirect_calls(&self) -> usize {
        self.redirect_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Popup surfaces currently open, i.e. popup futures not yet finished or
    /// dropped.
    pub fn open_popups(&self) -> usize {
        self.open_popups.load(Ordering::SeqCst)
    }

    async fn popup(&self, scopes: &ScopeSet) -> Result<ProviderGrant, ProviderError> {
        self.interactive_calls.fetch_add(1, Ordering::SeqCst);
        self.open_popups.fetch_add(1, Ordering::SeqCst);
        let _open = OpenPopup(&self.open_popups);
        let next = pop(&self.popup);
        if let Some(delay) = self.popup_delay {
            tokio::time::sleep(delay).await;
        }
        match next {
            Some(scripted) => scripted.resolve(scopes),
            None => Err(ProviderError::Rejected {
                reason: "no scripted popup response".to_string(),
            }),
        }
    }
}

struct OpenPopup<'a>(&'a AtomicUsize);

impl Drop for OpenPopup<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn push(queue: &Mutex<VecDeque<Scripted>>, item: Scripted) {
    queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push_back(item);
}

fn pop(queue: &Mutex<VecDeque<Scripted>>) -> Option<Scripted> {
    queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .pop_front()
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn acquire_token_silent(
        &self,
        request: &SilentRequest,
    ) -> Result<ProviderGrant, ProviderError> {
        self.silent_calls.fetch_add(1, Ordering::SeqCst);
        match pop(&self.silent) {
            Some(scripted) => scripted.resolve(&request.scopes),
            None => Err(ProviderError::Transport {
                message: "no scripted silent response".to_string(),
            }),
        }
    }

    async fn login_popup(&self, scopes: &ScopeSet) -> Result<ProviderGrant, ProviderError> {
        self.popup(scopes).await
    }

    async fn login_redirect(&self, _scopes: &ScopeSet) -> Result<RedirectStarted, ProviderError> {
        self.redirect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RedirectStarted {
            authorization_url: TEST_AUTHORIZATION_URL.to_string(),
        })
    }

    async fn acquire_token_popup(
        &self,
        _account: Option<&Account>,
        scopes: &ScopeSet,
    ) -> Result<ProviderGrant, ProviderError> {
        self.popup(scopes).await
    }

    async fn acquire_token_redirect(
        &self,
        _account: Option<&Account>,
        _scopes: &ScopeSet,
    ) -> Result<RedirectStarted, ProviderError> {
        self.redirect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RedirectStarted {
            authorization_url: TEST_AUTHORIZATION_URL.to_string(),
        })
    }

    async fn handle_redirect_response(
        &self,
        _callback_url: &str,
    ) -> Result<Option<ProviderGrant>, ProviderError> {
        match pop(&self.redirect) {
            Some(scripted) => scripted.resolve(&ScopeSet::parse("User.Read")).map(Some),
            None => Ok(None),
        }
    }

    async fn logout_redirect(&self, _account: &Account) -> Result<String, ProviderError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TEST_LOGOUT_URL.to_string())
    }
}
