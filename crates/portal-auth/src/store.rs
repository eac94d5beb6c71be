//! Account and token cache.
//!
//! The [`AccountStore`] holds the signed-in accounts, their cached access
//! tokens, refresh credentials, and any pending redirect interaction. One
//! instance is shared by the engine, the session controller, and the
//! provider, and every mutation happens under a single mutex so concurrent
//! acquisitions never lose an update (last successful write wins).
//!
//! With [`CacheLocation::Session`] the whole cache is written to a JSON file
//! after every mutation and read back on open. This is what lets a redirect
//! flow that leaves the process resume on the next boot.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountId, ScopeSet, Token};
use crate::error::StoreError;

/// Where the cache lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// Process memory only.
    Memory,
    /// A JSON snapshot file that survives a process restart.
    Session(PathBuf),
}

/// Why an interaction was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionPurpose {
    /// Sign-in initiated by the user.
    Login,
    /// Token acquisition that escalated from the silent path.
    AcquireToken,
}

/// A redirect interaction waiting for the provider's callback.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInteraction {
    /// CSRF `state` sent with the authorization request.
    pub state: String,
    /// PKCE code verifier matching the challenge that was sent.
    pub code_verifier: String,
    /// Nonce bound into the ID token.
    pub nonce: String,
    pub scopes: ScopeSet,
    pub purpose: InteractionPurpose,
    pub account: Option<AccountId>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingInteraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInteraction")
            .field("scopes", &self.scopes)
            .field("purpose", &self.purpose)
            .field("account", &self.account)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshEntry {
    account_id: AccountId,
    refresh_token: String,
}

/// Everything the store persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    tokens: Vec<Token>,
    #[serde(default)]
    refresh_credentials: Vec<RefreshEntry>,
    #[serde(default)]
    pending: Option<PendingInteraction>,
    /// Bumped by every [`AccountStore::clear`].
    #[serde(default)]
    generation: u64,
}

impl CacheState {
    fn upsert_account(&mut self, account: Account) {
        match self.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account,
            None => self.accounts.push(account),
        }
    }

    fn upsert_token(&mut self, token: Token) {
        match self
            .tokens
            .iter_mut()
            .find(|t| t.account_id == token.account_id && t.scopes.same_as(&token.scopes))
        {
            Some(existing) => *existing = token,
            None => self.tokens.push(token),
        }
    }

    fn upsert_refresh_credential(&mut self, account: &AccountId, refresh_token: String) {
        match self
            .refresh_credentials
            .iter_mut()
            .find(|r| &r.account_id == account)
        {
            Some(existing) => existing.refresh_token = refresh_token,
            None => self.refresh_credentials.push(RefreshEntry {
                account_id: account.clone(),
                refresh_token,
            }),
        }
    }
}

/// Precondition for [`AccountStore::store_grant`], captured before a
/// provider round-trip and checked under the store lock afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCondition {
    generation: u64,
    account_must_exist: bool,
}

impl WriteCondition {
    /// Require that the store has not been cleared since `generation` was read.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            account_must_exist: false,
        }
    }

    /// Additionally require the grant's account to still be present.
    pub fn for_existing_account(mut self) -> Self {
        self.account_must_exist = true;
        self
    }
}

// ---------------------------------------------------------------------------
// AccountStore
// ---------------------------------------------------------------------------

/// Thread-safe cache of accounts, tokens, and session artifacts.
pub struct AccountStore {
    location: CacheLocation,
    state: Mutex<CacheState>,
}

impl AccountStore {
    /// Create an empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            location: CacheLocation::Memory,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Open a store at `location`, loading an existing session file if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if an existing session file cannot be read or
    /// parsed.
    pub fn open(location: CacheLocation) -> Result<Self, StoreError> {
        let state = match &location {
            CacheLocation::Memory => CacheState::default(),
            CacheLocation::Session(path) => load_snapshot(path)?,
        };

        tracing::debug!(
            location = ?location,
            accounts = state.accounts.len(),
            tokens = state.tokens.len(),
            "account store opened"
        );

        Ok(Self {
            location,
            state: Mutex::new(state),
        })
    }

    pub fn location(&self) -> &CacheLocation {
        &self.location
    }

    // -- Accounts -----------------------------------------------------------

    /// All accounts in insertion order.
    pub fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.lock()?.accounts.clone())
    }

    /// The account used when a request names none: the first in the list.
    pub fn active_account(&self) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.first().cloned())
    }

    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.iter().find(|a| &a.id == id).cloned())
    }

    /// Insert an account, or replace the one with the same id in place.
    pub fn add_or_replace(&self, account: Account) -> Result<(), StoreError> {
        self.mutate(|state| state.upsert_account(account))
    }

    /// Remove an account together with its tokens and refresh credential.
    ///
    /// Returns whether the account existed.
    pub fn remove(&self, id: &AccountId) -> Result<bool, StoreError> {
        self.mutate(|state| {
            let before = state.accounts.len();
            state.accounts.retain(|a| &a.id != id);
            state.tokens.retain(|t| &t.account_id != id);
            state.refresh_credentials.retain(|r| &r.account_id != id);
            state.accounts.len() != before
        })
    }

    // -- Tokens -------------------------------------------------------------

    /// Find an unexpired token for `account` whose scopes cover `scopes`.
    ///
    /// When several tokens qualify, the one expiring last is returned.
    pub fn find_cached_token(
        &self,
        account: &AccountId,
        scopes: &ScopeSet,
    ) -> Result<Option<Token>, StoreError> {
        self.find_cached_token_at(account, scopes, Utc::now())
    }

    /// [`find_cached_token`](Self::find_cached_token) against an explicit
    /// clock reading.
    pub fn find_cached_token_at(
        &self,
        account: &AccountId,
        scopes: &ScopeSet,
        now: DateTime<Utc>,
    ) -> Result<Option<Token>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .tokens
            .iter()
            .filter(|t| &t.account_id == account)
            .filter(|t| t.is_valid_at(now) && t.scopes.covers(scopes))
            .max_by_key(|t| t.expires_at)
            .cloned())
    }

    /// Upsert a token keyed by (account, scope set). Last write wins.
    pub fn store_token(&self, token: Token) -> Result<(), StoreError> {
        self.mutate(|state| state.upsert_token(token))
    }

    /// Drop every cached token of `account` that covers `scopes`.
    ///
    /// Returns how many tokens were removed.
    pub fn evict_token(&self, account: &AccountId, scopes: &ScopeSet) -> Result<usize, StoreError> {
        self.mutate(|state| {
            let before = state.tokens.len();
            state
                .tokens
                .retain(|t| !(&t.account_id == account && t.scopes.covers(scopes)));
            before - state.tokens.len()
        })
    }

    // -- Refresh credentials -------------------------------------------------

    pub fn refresh_credential(&self, account: &AccountId) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()?
            .refresh_credentials
            .iter()
            .find(|r| &r.account_id == account)
            .map(|r| r.refresh_token.clone()))
    }

    pub fn set_refresh_credential(
        &self,
        account: &AccountId,
        refresh_token: String,
    ) -> Result<(), StoreError> {
        self.mutate(|state| state.upsert_refresh_credential(account, refresh_token))
    }

    // -- Grants --------------------------------------------------------------

    /// Record an account, its token, and its refresh credential in one
    /// snapshot.
    ///
    /// Nothing is written, and `false` is returned, when `condition` no
    /// longer holds.
    pub fn store_grant(
        &self,
        account: &Account,
        token: &Token,
        refresh_token: Option<&str>,
        condition: WriteCondition,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.generation != condition.generation {
            return Ok(false);
        }
        if condition.account_must_exist && !state.accounts.iter().any(|a| a.id == account.id) {
            return Ok(false);
        }

        state.upsert_account(account.clone());
        state.upsert_token(token.clone());
        if let Some(refresh_token) = refresh_token {
            state.upsert_refresh_credential(&account.id, refresh_token.to_string());
        }
        self.persist_locked(&state)?;
        Ok(true)
    }

    // -- Pending interaction -------------------------------------------------

    /// Record a redirect interaction, replacing any earlier one.
    pub fn set_pending_interaction(&self, pending: PendingInteraction) -> Result<(), StoreError> {
        self.mutate(|state| state.pending = Some(pending))
    }

    pub fn pending_interaction(&self) -> Result<Option<PendingInteraction>, StoreError> {
        Ok(self.lock()?.pending.clone())
    }

    pub fn take_pending_interaction(&self) -> Result<Option<PendingInteraction>, StoreError> {
        self.mutate(|state| state.pending.take())
    }

    /// Take the pending interaction only when its `state` equals `expected`;
    /// otherwise leave it in place.
    pub fn take_pending_interaction_if(
        &self,
        expected: &str,
    ) -> Result<Option<PendingInteraction>, StoreError> {
        let mut state = self.lock()?;
        if state.pending.as_ref().is_none_or(|p| p.state != expected) {
            return Ok(None);
        }
        let taken = state.pending.take();
        self.persist_locked(&state)?;
        Ok(taken)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Remove all accounts, tokens, refresh credentials, and pending
    /// interactions.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.mutate(|state| {
            *state = CacheState {
                generation: state.generation.wrapping_add(1),
                ..CacheState::default()
            }
        })
    }

    /// Counter bumped by every [`clear`](Self::clear); see [`WriteCondition`].
    pub fn generation(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.generation)
    }

    // -- Internal helpers ---------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Apply `f` under the lock and persist the result before releasing it,
    /// so snapshots are written in mutation order.
    fn mutate<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> Result<R, StoreError> {
        let mut state = self.lock()?;
        let result = f(&mut state);
        self.persist_locked(&state)?;
        Ok(result)
    }

    fn persist_locked(&self, state: &CacheState) -> Result<(), StoreError> {
        if let CacheLocation::Session(path) = &self.location {
            save_snapshot(path, state)?;
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<CacheState, StoreError> {
    if !path.exists() {
        return Ok(CacheState::default());
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Ok(CacheState::default());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn save_snapshot(path: &Path, state: &CacheState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(subject: &str) -> Account {
        Account {
            id: AccountId::new(subject, "tenant"),
            environment: "login.example.com".to_string(),
            display_name: Some(format!("User {subject}")),
            username: format!("{subject}@example.com"),
            claims: serde_json::Map::new(),
        }
    }

    fn token(subject: &str, scopes: &str, access: &str, ttl_secs: i64) -> Token {
        Token {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            scopes: ScopeSet::parse(scopes),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            account_id: AccountId::new(subject, "tenant"),
        }
    }

    #[test]
    fn accounts_keep_insertion_order_and_replace_in_place() {
        let store = AccountStore::in_memory();
        store.add_or_replace(account("a")).unwrap();
        store.add_or_replace(account("b")).unwrap();

        let mut renamed = account("a");
        renamed.display_name = Some("Renamed".to_string());
        store.add_or_replace(renamed).unwrap();

        let accounts = store.list_accounts().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].display_name.as_deref(), Some("Renamed"));
        assert_eq!(accounts[1].id.subject, "b");
        assert_eq!(store.active_account().unwrap().unwrap().id.subject, "a");
    }

    #[test]
    fn empty_store_has_no_active_account() {
        let store = AccountStore::in_memory();
        assert!(store.list_accounts().unwrap().is_empty());
        assert!(store.active_account().unwrap().is_none());
    }

    #[test]
    fn find_cached_token_requires_coverage() {
        let store = AccountStore::in_memory();
        store
            .store_token(token("a", "api://x/read api://x/write", "tok", 3600))
            .unwrap();
        let id = AccountId::new("a", "tenant");

        let hit = store
            .find_cached_token(&id, &ScopeSet::parse("api://x/read"))
            .unwrap();
        assert_eq!(hit.unwrap().access_token, "tok");

        let miss = store
            .find_cached_token(&id, &ScopeSet::parse("api://y/read"))
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn find_cached_token_skips_expired() {
        let store = AccountStore::in_memory();
        store.store_token(token("a", "s", "old", -10)).unwrap();
        let id = AccountId::new("a", "tenant");
        assert!(
            store
                .find_cached_token(&id, &ScopeSet::parse("s"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn find_cached_token_at_uses_strict_expiry() {
        let store = AccountStore::in_memory();
        let t = token("a", "s", "tok", 60);
        let expiry = t.expires_at;
        store.store_token(t).unwrap();
        let id = AccountId::new("a", "tenant");
        let scopes = ScopeSet::parse("s");

        assert!(store.find_cached_token_at(&id, &scopes, expiry).unwrap().is_none());
        assert!(
            store
                .find_cached_token_at(&id, &scopes, expiry - Duration::milliseconds(1))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn find_cached_token_is_per_account() {
        let store = AccountStore::in_memory();
        store.store_token(token("a", "s", "tok-a", 3600)).unwrap();
        let other = AccountId::new("b", "tenant");
        assert!(
            store
                .find_cached_token(&other, &ScopeSet::parse("s"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn store_token_last_write_wins() {
        let store = AccountStore::in_memory();
        store.store_token(token("a", "s t", "first", 3600)).unwrap();
        store.store_token(token("a", "t s", "second", 3600)).unwrap();
        let hit = store
            .find_cached_token(&AccountId::new("a", "tenant"), &ScopeSet::parse("s"))
            .unwrap()
            .unwrap();
        assert_eq!(hit.access_token, "second");
    }

    #[test]
    fn longest_lived_covering_token_wins() {
        let store = AccountStore::in_memory();
        store.store_token(token("a", "s", "short", 60)).unwrap();
        store.store_token(token("a", "s t", "long", 3600)).unwrap();
        let hit = store
            .find_cached_token(&AccountId::new("a", "tenant"), &ScopeSet::parse("s"))
            .unwrap()
            .unwrap();
        assert_eq!(hit.access_token, "long");
    }

    #[test]
    fn evict_token_removes_covering_tokens_only() {
        let store = AccountStore::in_memory();
        store.store_token(token("a", "s", "one", 3600)).unwrap();
        store.store_token(token("a", "u", "two", 3600)).unwrap();
        let id = AccountId::new("a", "tenant");

        assert_eq!(store.evict_token(&id, &ScopeSet::parse("s")).unwrap(), 1);
        assert!(store.find_cached_token(&id, &ScopeSet::parse("s")).unwrap().is_none());
        assert!(store.find_cached_token(&id, &ScopeSet::parse("u")).unwrap().is_some());
    }

    #[test]
    fn remove_account_drops_its_artifacts() {
        let store = AccountStore::in_memory();
        store.add_or_replace(account("a")).unwrap();
        store.store_token(token("a", "s", "tok", 3600)).unwrap();
        let id = AccountId::new("a", "tenant");
        store.set_refresh_credential(&id, "rt".to_string()).unwrap();

        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
        assert!(store.find_cached_token(&id, &ScopeSet::parse("s")).unwrap().is_none());
        assert!(store.refresh_credential(&id).unwrap().is_none());
    }

    #[test]
    fn refresh_credential_rotates() {
        let store = AccountStore::in_memory();
        let id = AccountId::new("a", "tenant");
        store.set_refresh_credential(&id, "rt-1".to_string()).unwrap();
        store.set_refresh_credential(&id, "rt-2".to_string()).unwrap();
        assert_eq!(store.refresh_credential(&id).unwrap().as_deref(), Some("rt-2"));
    }

    #[test]
    fn clear_removes_everything() {
        let store = AccountStore::in_memory();
        store.add_or_replace(account("a")).unwrap();
        store.store_token(token("a", "s", "tok", 3600)).unwrap();
        store
            .set_pending_interaction(PendingInteraction {
                state: "st".to_string(),
                code_verifier: "v".to_string(),
                nonce: "n".to_string(),
                scopes: ScopeSet::parse("s"),
                purpose: InteractionPurpose::Login,
                account: None,
                created_at: Utc::now(),
            })
            .unwrap();

        store.clear().unwrap();
        assert!(store.list_accounts().unwrap().is_empty());
        assert!(store.pending_interaction().unwrap().is_none());
    }

    #[test]
    fn store_grant_writes_account_token_and_refresh_together() {
        let store = AccountStore::in_memory();
        let condition = WriteCondition::new(store.generation().unwrap());
        let id = AccountId::new("a", "tenant");

        let written = store
            .store_grant(&account("a"), &token("a", "s", "tok", 3600), Some("rt"), condition)
            .unwrap();
        assert!(written);
        assert_eq!(store.list_accounts().unwrap().len(), 1);
        assert!(store.find_cached_token(&id, &ScopeSet::parse("s")).unwrap().is_some());
        assert_eq!(store.refresh_credential(&id).unwrap().as_deref(), Some("rt"));
    }

    #[test]
    fn store_grant_after_clear_writes_nothing() {
        let store = AccountStore::in_memory();
        store.add_or_replace(account("a")).unwrap();
        let condition = WriteCondition::new(store.generation().unwrap());
        store.clear().unwrap();

        let written = store
            .store_grant(&account("a"), &token("a", "s", "tok", 3600), Some("rt"), condition)
            .unwrap();
        assert!(!written);
        assert!(store.list_accounts().unwrap().is_empty());
        assert!(
            store
                .refresh_credential(&AccountId::new("a", "tenant"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn store_grant_for_removed_account_writes_nothing() {
        let store = AccountStore::in_memory();
        store.add_or_replace(account("a")).unwrap();
        let condition = WriteCondition::new(store.generation().unwrap()).for_existing_account();
        let id = AccountId::new("a", "tenant");
        store.remove(&id).unwrap();

        let written = store
            .store_grant(&account("a"), &token("a", "s", "tok", 3600), None, condition)
            .unwrap();
        assert!(!written);
        assert!(store.find_cached_token(&id, &ScopeSet::parse("s")).unwrap().is_none());
    }

    #[test]
    fn pending_interaction_is_taken_only_by_its_state() {
        let store = AccountStore::in_memory();
        store
            .set_pending_interaction(PendingInteraction {
                state: "st".to_string(),
                code_verifier: "v".to_string(),
                nonce: "n".to_string(),
                scopes: ScopeSet::parse("s"),
                purpose: InteractionPurpose::Login,
                account: None,
                created_at: Utc::now(),
            })
            .unwrap();

        assert!(store.take_pending_interaction_if("forged").unwrap().is_none());
        assert!(store.pending_interaction().unwrap().is_some());

        let taken = store.take_pending_interaction_if("st").unwrap().unwrap();
        assert_eq!(taken.state, "st");
        assert!(store.pending_interaction().unwrap().is_none());
    }

    #[test]
    fn session_location_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        {
            let store = AccountStore::open(CacheLocation::Session(path.clone())).unwrap();
            store.add_or_replace(account("a")).unwrap();
            store.store_token(token("a", "s", "tok", 3600)).unwrap();
        }

        let reopened = AccountStore::open(CacheLocation::Session(path)).unwrap();
        assert_eq!(reopened.list_accounts().unwrap().len(), 1);
        let hit = reopened
            .find_cached_token(&AccountId::new("a", "tenant"), &ScopeSet::parse("s"))
            .unwrap();
        assert_eq!(hit.unwrap().access_token, "tok");
    }

    #[test]
    fn open_missing_session_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            AccountStore::open(CacheLocation::Session(dir.path().join("absent.json"))).unwrap();
        assert!(store.list_accounts().unwrap().is_empty());
    }

    #[test]
    fn open_corrupt_session_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let result = AccountStore::open(CacheLocation::Session(path));
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn pending_interaction_debug_hides_secrets() {
        let pending = PendingInteraction {
            state: "state-secret".to_string(),
            code_verifier: "verifier-secret".to_string(),
            nonce: "nonce".to_string(),
            scopes: ScopeSet::parse("s"),
            purpose: InteractionPurpose::AcquireToken,
            account: None,
            created_at: Utc::now(),
        };
        let debug = format!("{pending:?}");
        assert!(!debug.contains("verifier-secret"));
        assert!(!debug.contains("state-secret"));
    }

    #[test]
    fn store_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AccountStore>();
    }
}
