//! Token acquisition: cache, silent refresh, and a single interactive
//! escalation.
//!
//! An acquisition is a two-state machine. The silent path yields an
//! [`AuthOutcome`], which may be [`AuthOutcome::InteractionRequired`]. Only
//! that variant leads to the interactive path, and the interactive path
//! returns a plain `Result<Token, AuthError>` which has no way to ask for
//! interaction again. A single [`TokenAcquisitionEngine::acquire_token`]
//! call therefore performs at most one interactive attempt.
//!
//! Concurrent popup interactions for the same account and scope set share
//! one in-flight future, so a second caller joins the first surface instead
//! of opening another. The in-flight table only holds weak handles: once the
//! last caller gives up (for example on a deadline) the interaction future is
//! dropped and its loopback listener closes with it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};

use crate::account::{Account, AccountId, InteractionMode, ScopeRequest, ScopeSet, Token};
use crate::error::{AuthError, AuthErrorKind, ProviderError};
use crate::provider::{IdentityProvider, InteractionKey, ProviderGrant, SilentRequest};
use crate::store::{AccountStore, WriteCondition};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Signal that silent acquisition cannot proceed without the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionRequired {
    pub reason: String,
}

/// Tagged result of an acquisition attempt.
///
/// `InteractionRequired` is produced only by the silent path and is always
/// consumed inside the engine; [`TokenAcquisitionEngine::acquire_token`]
/// returns either `Success` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success(Token),
    InteractionRequired(InteractionRequired),
    Failed(AuthError),
}

impl AuthOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Convert to a `Result`, treating an unresolved interaction signal as a
    /// failed interaction.
    pub fn into_result(self) -> Result<Token, AuthError> {
        match self {
            Self::Success(token) => Ok(token),
            Self::Failed(err) => Err(err),
            Self::InteractionRequired(signal) => Err(AuthError::InteractionFailed {
                reason: signal.reason,
                cancelled: false,
            }),
        }
    }
}

impl From<Result<Token, AuthError>> for AuthOutcome {
    fn from(result: Result<Token, AuthError>) -> Self {
        match result {
            Ok(token) => Self::Success(token),
            Err(err) => Self::Failed(err),
        }
    }
}

type InteractionResult = Result<(Account, Token), AuthError>;
type SharedInteraction = Shared<BoxFuture<'static, InteractionResult>>;
type WeakInteraction = WeakShared<BoxFuture<'static, InteractionResult>>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    store: Arc<AccountStore>,
    provider: Arc<dyn IdentityProvider>,
    in_flight: DashMap<InteractionKey, WeakInteraction>,
}

/// Acquires access tokens for scope requests.
///
/// Cheap to clone; clones share the store, the provider, and the in-flight
/// interaction table.
#[derive(Clone)]
pub struct TokenAcquisitionEngine {
    inner: Arc<EngineInner>,
}

impl TokenAcquisitionEngine {
    pub fn new(store: Arc<AccountStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                provider,
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.inner.store
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.inner.provider
    }

    /// Acquire a token for `request`.
    ///
    /// 1. Resolve the account (explicit, else the first one); none is
    ///    `Failed(NoAccount)` and nothing interactive is attempted.
    /// 2. Return a cached, unexpired token covering the scopes.
    /// 3. Otherwise redeem the refresh credential.
    /// 4. If that requires interaction, run exactly one interactive
    ///    acquisition in `request.interaction` mode.
    pub async fn acquire_token(&self, request: &ScopeRequest) -> AuthOutcome {
        let account = match self.resolve_account(request) {
            Ok(account) => account,
            Err(err) => return AuthOutcome::Failed(err),
        };

        match self.acquire_silent(&account, &request.scopes).await {
            AuthOutcome::InteractionRequired(signal) => {
                tracing::debug!(
                    account = %account.id,
                    scopes = %request.scopes,
                    reason = %signal.reason,
                    mode = ?request.interaction,
                    "silent acquisition requires interaction, escalating once"
                );
                self.acquire_interactive(&account, &request.scopes, request.interaction)
                    .await
                    .into()
            }
            outcome => outcome,
        }
    }

    /// [`acquire_token`](Self::acquire_token) bounded by a caller deadline.
    pub async fn acquire_token_within(
        &self,
        request: &ScopeRequest,
        deadline: Duration,
    ) -> AuthOutcome {
        match tokio::time::timeout(deadline, self.acquire_token(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(scopes = %request.scopes, "token acquisition deadline elapsed");
                AuthOutcome::Failed(AuthError::Timeout {
                    after_secs: deadline.as_secs(),
                })
            }
        }
    }

    /// Interactive sign-in through a popup; concurrent calls share one
    /// surface.
    pub async fn login_popup(&self, scopes: &ScopeSet) -> Result<Account, AuthError> {
        self.shared_popup(None, scopes.clone())
            .await
            .map(|(account, _)| account)
    }

    /// Start an interactive sign-in through a redirect and return the URL to
    /// navigate to.
    pub async fn login_redirect(&self, scopes: &ScopeSet) -> Result<String, AuthError> {
        let started = self.inner.provider.login_redirect(scopes).await?;
        Ok(started.authorization_url)
    }

    /// Finish a redirect interaction from the echoed callback URL.
    ///
    /// Returns the signed-in account, or `None` when nothing was pending.
    pub async fn complete_redirect(&self, callback_url: &str) -> Result<Option<Account>, AuthError> {
        let condition = WriteCondition::new(self.inner.store.generation()?);
        match self
            .inner
            .provider
            .handle_redirect_response(callback_url)
            .await?
        {
            Some(grant) => {
                let (account, _) = self.inner.persist(grant, condition)?;
                tracing::info!(account = %account.id, "redirect interaction completed");
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Drop cached tokens for `account` covering `scopes`.
    pub fn evict_token(&self, account: &AccountId, scopes: &ScopeSet) -> Result<usize, AuthError> {
        Ok(self.inner.store.evict_token(account, scopes)?)
    }

    // -- Internal helpers ---------------------------------------------------

    fn resolve_account(&self, request: &ScopeRequest) -> Result<Account, AuthError> {
        let found = match &request.account {
            Some(id) => self.inner.store.get_account(id)?,
            None => self.inner.store.active_account()?,
        };
        found.ok_or(AuthError::NoAccount)
    }

    /// Cache lookup, then refresh-credential redemption.
    async fn acquire_silent(&self, account: &Account, scopes: &ScopeSet) -> AuthOutcome {
        let store = &self.inner.store;

        match store.find_cached_token(&account.id, scopes) {
            Ok(Some(token)) => {
                tracing::debug!(account = %account.id, scopes = %scopes, "token served from cache");
                return AuthOutcome::Success(token);
            }
            Ok(None) => {}
            Err(err) => return AuthOutcome::Failed(err.into()),
        }

        let refresh_token = match store.refresh_credential(&account.id) {
            Ok(Some(refresh_token)) => refresh_token,
            Ok(None) => {
                return AuthOutcome::InteractionRequired(InteractionRequired {
                    reason: "no refresh credential cached".to_string(),
                });
            }
            Err(err) => return AuthOutcome::Failed(err.into()),
        };

        let condition = match store.generation() {
            Ok(generation) => WriteCondition::new(generation).for_existing_account(),
            Err(err) => return AuthOutcome::Failed(err.into()),
        };

        let request = SilentRequest {
            account: account.clone(),
            scopes: scopes.clone(),
            refresh_token,
        };

        match self.inner.provider.acquire_token_silent(&request).await {
            Ok(grant) => {
                tracing::debug!(account = %account.id, scopes = %scopes, "token refreshed silently");
                self.inner
                    .persist(grant, condition)
                    .map(|(_, token)| token)
                    .into()
            }
            Err(ProviderError::InteractionRequired { reason }) => {
                AuthOutcome::InteractionRequired(InteractionRequired { reason })
            }
            Err(err) => {
                tracing::warn!(account = %account.id, error = %err, "silent acquisition failed");
                AuthOutcome::Failed(silent_failure(err))
            }
        }
    }

    async fn acquire_interactive(
        &self,
        account: &Account,
        scopes: &ScopeSet,
        mode: InteractionMode,
    ) -> Result<Token, AuthError> {
        let result = match mode {
            InteractionMode::Popup => self
                .shared_popup(Some(account.clone()), scopes.clone())
                .await
                .map(|(_, token)| token),
            InteractionMode::Redirect => {
                let started = self
                    .inner
                    .provider
                    .acquire_token_redirect(Some(account), scopes)
                    .await?;
                Err(AuthError::RedirectStarted {
                    authorization_url: started.authorization_url,
                })
            }
        };

        if let Err(err) = &result
            && err.kind() != AuthErrorKind::RedirectStarted
        {
            tracing::warn!(account = %account.id, error = %err, "interactive acquisition failed");
        }
        result
    }

    /// Run a popup interaction, joining one already in flight for the same
    /// account and scope set.
    async fn shared_popup(&self, account: Option<Account>, scopes: ScopeSet) -> InteractionResult {
        let key = InteractionKey::new(account.as_ref().map(|a| &a.id), &scopes);
        let mut flight = Flight {
            shared: self.join_or_start(key.clone(), account, scopes),
            in_flight: &self.inner.in_flight,
            key,
        };
        (&mut flight.shared).await
    }

    fn join_or_start(
        &self,
        key: InteractionKey,
        account: Option<Account>,
        scopes: ScopeSet,
    ) -> SharedInteraction {
        match self.inner.in_flight.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(shared) = entry.get().upgrade() {
                    tracing::debug!(scopes = %scopes, "joining in-flight interaction");
                    return shared;
                }
                let shared = self.start_popup(account, scopes);
                if let Some(weak) = shared.downgrade() {
                    entry.insert(weak);
                }
                shared
            }
            Entry::Vacant(entry) => {
                let shared = self.start_popup(account, scopes);
                if let Some(weak) = shared.downgrade() {
                    entry.insert(weak);
                }
                shared
            }
        }
    }

    fn start_popup(&self, account: Option<Account>, scopes: ScopeSet) -> SharedInteraction {
        Arc::clone(&self.inner)
            .run_popup(account, scopes)
            .boxed()
            .shared()
    }
}

/// One caller's handle on a shared popup interaction.
///
/// The last handle to go away, whether its caller finished or was
/// cancelled, removes the table entry and drops the interaction future.
struct Flight<'a> {
    shared: SharedInteraction,
    in_flight: &'a DashMap<InteractionKey, WeakInteraction>,
    key: InteractionKey,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        // `strong_count` is `None` once the interaction has completed.
        let last = self.shared.strong_count().is_none_or(|count| count <= 1);
        if !last {
            return;
        }
        self.in_flight.remove_if(&self.key, |_, weak| match weak.upgrade() {
            Some(shared) => shared.ptr_eq(&self.shared),
            None => true,
        });
    }
}

impl EngineInner {
    async fn run_popup(
        self: Arc<Self>,
        account: Option<Account>,
        scopes: ScopeSet,
    ) -> InteractionResult {
        let mut condition = WriteCondition::new(self.store.generation()?);
        let result = match &account {
            Some(account) => {
                condition = condition.for_existing_account();
                self.provider
                    .acquire_token_popup(Some(account), &scopes)
                    .await
            }
            None => self.provider.login_popup(&scopes).await,
        };
        match result {
            Ok(grant) => self.persist(grant, condition),
            Err(err) => Err(AuthError::from(err)),
        }
    }

    /// Write a grant into the store before anyone sees its token.
    ///
    /// The write is skipped, and the grant reported as `NoAccount`, when the
    /// store was cleared (or the account removed) while the provider was
    /// working.
    fn persist(&self, grant: ProviderGrant, condition: WriteCondition) -> InteractionResult {
        let written = self.store.store_grant(
            &grant.account,
            &grant.token,
            grant.refresh_token.as_deref(),
            condition,
        )?;
        if !written {
            tracing::info!(
                account = %grant.account.id,
                "discarding grant for a signed-out account"
            );
            return Err(AuthError::NoAccount);
        }
        Ok((grant.account, grant.token))
    }
}

/// Map a non-interaction silent failure; interaction cannot fix these.
fn silent_failure(err: ProviderError) -> AuthError {
    match err {
        ProviderError::Store(err) => err.into(),
        ProviderError::InvalidConfig { reason } => AuthError::InvalidConfig { reason },
        other => AuthError::TransientAuthFailure {
            message: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
