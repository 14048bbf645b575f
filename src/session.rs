//! Session store: the bearer credential, the user profile and the epoch.
//!
//! The store is the only writer of the credential and the epoch counter.
//! Every other component reads them through [`SessionStore::snapshot`] or
//! the [`watch`] channel returned by [`SessionStore::subscribe`].
//!
//! # State machine
//!
//! ```text
//!   unauthenticated ──login/signup ok──► authenticated (credential + profile)
//!         ▲                                   │
//!         └──── logout / 401 / validate 401 ◄─┘
//!
//!   startup with stored token ──► credential only (loading) ──validate──► ...
//! ```
//!
//! # Epochs
//!
//! The epoch advances whenever the credential changes identity (a different
//! token string, or none). Async work captures the epoch when it starts and
//! only applies its result if the epoch is unchanged on completion; this is
//! the sole cancellation primitive shared with the push channel.
//!
//! Concurrent logins are not merged: whichever completes last overwrites the
//! session.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use crate::auth::{
    AuthError, AuthResponse, Credential, IdentityApi, LoginRequest, SignupRequest, UserId,
    UserProfile,
};
use crate::keyring::TokenStore;

/// Read-only view of the session published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current credential epoch.
    pub epoch: u64,
    /// Live credential, if any.
    pub credential: Option<Credential>,
    /// Id of the validated profile, if any.
    pub user_id: Option<UserId>,
}

impl SessionSnapshot {
    /// A credential is present.
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    /// Credential the push channel should connect with.
    ///
    /// Only returned once the credential has been validated (a profile is
    /// present); before that no frame could be attributed to a user anyway.
    pub fn channel_credential(&self) -> Option<&Credential> {
        self.user_id.and(self.credential.as_ref())
    }
}

#[derive(Debug, Default)]
struct SessionState {
    credential: Option<Credential>,
    profile: Option<UserProfile>,
    epoch: u64,
    loading: bool,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            epoch: self.epoch,
            credential: self.credential.clone(),
            user_id: self.profile.as_ref().map(|p| p.id),
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    api: Arc<dyn IdentityApi>,
    storage: Arc<dyn TokenStore>,
    state: RwLock<SessionState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Shared handle to the session. Cloning is cheap; all clones see the same state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    /// Create the store, restoring a token left in `storage` by a previous run.
    ///
    /// A restored token starts a new epoch but carries no profile until
    /// [`Self::validate`] succeeds.
    pub fn new(api: Arc<dyn IdentityApi>, storage: Arc<dyn TokenStore>) -> Self {
        let mut state = SessionState::default();
        if let Some(token) = storage.load().filter(|t| !t.is_empty()) {
            log::info!("[Session] Restored stored session token");
            state.credential = Some(Credential::new(token));
            state.epoch = 1;
            state.loading = true;
        }

        let (snapshot_tx, _) = watch::channel(state.snapshot());

        Self {
            inner: Arc::new(SessionInner {
                api,
                storage,
                state: RwLock::new(state),
                snapshot_tx,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &SessionState) {
        self.inner.snapshot_tx.send_replace(state.snapshot());
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// A credential is present.
    pub fn is_authenticated(&self) -> bool {
        self.read().credential.is_some()
    }

    /// Startup validation has not finished yet.
    pub fn is_loading(&self) -> bool {
        self.read().loading
    }

    /// Validated profile of the current user.
    pub fn profile(&self) -> Option<UserProfile> {
        self.read().profile.clone()
    }

    /// Live credential.
    pub fn credential(&self) -> Option<Credential> {
        self.read().credential.clone()
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Consistent view of epoch, credential and user id.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.read().snapshot()
    }

    /// Receive a new snapshot after every session transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Exchange `identifier`/`secret` for a session.
    ///
    /// On failure the existing session is left untouched.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<UserProfile, AuthError> {
        let request = LoginRequest::new(identifier, secret);
        let response = self.inner.api.login(&request).await?;
        let (credential, profile) = self.complete_exchange(response).await?;
        self.commit(credential, profile.clone());
        log::info!("[Session] Logged in as user {}", profile.id);
        Ok(profile)
    }

    /// Register a new account and start a session for it.
    pub async fn signup(&self, request: &SignupRequest) -> Result<UserProfile, AuthError> {
        let response = self.inner.api.signup(request).await?;
        let (credential, profile) = self.complete_exchange(response).await?;
        self.commit(credential, profile.clone());
        log::info!("[Session] Signed up as user {}", profile.id);
        Ok(profile)
    }

    /// Turn a token response into a credential and profile, fetching the
    /// profile when the response carried none.
    async fn complete_exchange(
        &self,
        response: AuthResponse,
    ) -> Result<(Credential, UserProfile), AuthError> {
        if response.token.is_empty() {
            return Err(AuthError::NetworkError("empty token in response".to_string()));
        }
        let credential = Credential::new(response.token);
        let profile = match response.user {
            Some(profile) => profile,
            None => match self.inner.api.me(&credential).await {
                Ok(profile) => profile,
                Err(AuthError::Unauthorized) => return Err(AuthError::InvalidCredentials),
                Err(e) => return Err(e),
            },
        };
        Ok((credential, profile))
    }

    /// Atomically install a credential and its profile.
    fn commit(&self, credential: Credential, profile: UserProfile) {
        let mut state = self.write();
        if state.credential.as_ref() != Some(&credential) {
            state.epoch += 1;
        }
        if let Err(e) = self.inner.storage.save(credential.as_str()) {
            log::warn!("[Session] Failed to persist token: {e:#}");
        }
        state.credential = Some(credential);
        state.profile = Some(profile);
        state.loading = false;
        self.publish(&state);
    }

    /// End the session. Always succeeds; calling it twice is harmless.
    pub fn logout(&self) {
        let mut state = self.write();
        if let Err(e) = self.inner.storage.clear() {
            log::warn!("[Session] Failed to clear stored token: {e:#}");
        }
        if state.credential.is_none() && state.profile.is_none() && !state.loading {
            return;
        }
        if state.credential.is_some() {
            state.epoch += 1;
        }
        state.credential = None;
        state.profile = None;
        state.loading = false;
        log::info!("[Session] Logged out (epoch {})", state.epoch);
        self.publish(&state);
    }

    /// Log out if `epoch` is still current.
    ///
    /// Used when an authenticated call comes back 401. A 401 earned by a
    /// token that has since been replaced must not end the newer session.
    /// Returns whether the session was ended.
    pub fn expire(&self, epoch: u64) -> bool {
        if self.epoch() != epoch {
            log::debug!("[Session] Ignoring 401 from superseded epoch {epoch}");
            return false;
        }
        log::warn!("[Session] Credential rejected by server, logging out");
        self.logout();
        true
    }

    /// Check the stored credential against the identity endpoint.
    ///
    /// Called once at startup. Any failure, network errors included, logs
    /// the session out: a credential that was never validated has no
    /// profile and cannot open the push channel.
    pub async fn validate(&self) -> Result<UserProfile, AuthError> {
        let result = self.fetch_profile(FetchFailure::Logout).await;
        if let Err(e) = &result {
            log::info!("[Session] Startup validation failed: {e}");
        }
        result
    }

    /// Re-fetch the profile of the live session.
    ///
    /// Only `Unauthorized` ends the session; a network failure keeps the
    /// credential and the last known profile.
    pub async fn refresh_user(&self) -> Result<UserProfile, AuthError> {
        self.fetch_profile(FetchFailure::Keep).await
    }

    async fn fetch_profile(&self, on_failure: FetchFailure) -> Result<UserProfile, AuthError> {
        let (epoch, credential) = {
            let state = self.read();
            (state.epoch, state.credential.clone())
        };

        let Some(credential) = credential else {
            self.logout();
            return Err(AuthError::Unauthorized);
        };

        let result = self.inner.api.me(&credential).await;

        let mut state = self.write();
        if state.epoch != epoch {
            log::debug!(
                "[Session] Discarding profile result from epoch {} (now {})",
                epoch,
                state.epoch
            );
            return result;
        }

        match &result {
            Ok(profile) => {
                state.profile = Some(profile.clone());
                state.loading = false;
                self.publish(&state);
            }
            Err(AuthError::Unauthorized) => {
                drop(state);
                self.logout();
            }
            Err(_) if on_failure == FetchFailure::Logout => {
                drop(state);
                self.logout();
            }
            Err(_) => {
                if state.loading {
                    state.loading = false;
                    self.publish(&state);
                }
            }
        }
        result
    }
}

/// What a non-401 failure of a profile fetch does to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchFailure {
    Logout,
    Keep,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::MemoryTokenStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn profile(id: UserId) -> UserProfile {
        UserProfile {
            id,
            uuid: format!("uuid-{id}"),
            first_name: "Test".to_string(),
            last_name: format!("User{id}"),
            email: format!("user{id}@example.com"),
            department: "Engineering".to_string(),
            position: "Engineer".to_string(),
            role: "employee".to_string(),
        }
    }

    /// Scripted identity endpoint. Calls keyed by identifier (login) or
    /// token (me) can be held until released.
    #[derive(Debug, Default)]
    struct FakeIdentity {
        accounts: Mutex<HashMap<String, (String, UserId)>>,
        me: Mutex<HashMap<String, Result<UserProfile, AuthError>>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        unreachable: Mutex<bool>,
    }

    impl FakeIdentity {
        fn account(&self, identifier: &str, token: &str, id: UserId) {
            self.accounts
                .lock()
                .unwrap()
                .insert(identifier.to_string(), (token.to_string(), id));
            self.me
                .lock()
                .unwrap()
                .insert(token.to_string(), Ok(profile(id)));
        }

        fn me_result(&self, token: &str, result: Result<UserProfile, AuthError>) {
            self.me.lock().unwrap().insert(token.to_string(), result);
        }

        fn gate(&self, key: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates
                .lock()
                .unwrap()
                .insert(key.to_string(), Arc::clone(&gate));
            gate
        }

        async fn wait_gate(&self, key: &str) {
            let gate = self.gates.lock().unwrap().get(key).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
        }
    }

    #[async_trait]
    impl IdentityApi for FakeIdentity {
        async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, AuthError> {
            self.wait_gate(&request.identifier).await;
            if *self.unreachable.lock().unwrap() {
                return Err(AuthError::NetworkError("connection refused".to_string()));
            }
            let account = self.accounts.lock().unwrap().get(&request.identifier).cloned();
            match account {
                Some((token, id)) if request.secret.as_str() == "correct" => Ok(AuthResponse {
                    token,
                    user: Some(profile(id)),
                }),
                _ => Err(AuthError::InvalidCredentials),
            }
        }

        async fn signup(&self, request: &SignupRequest) -> Result<AuthResponse, AuthError> {
            Ok(AuthResponse {
                token: format!("tok_{}", request.email),
                user: None,
            })
        }

        async fn me(&self, credential: &Credential) -> Result<UserProfile, AuthError> {
            self.wait_gate(credential.as_str()).await;
            self.me
                .lock()
                .unwrap()
                .get(credential.as_str())
                .cloned()
                .unwrap_or(Err(AuthError::Unauthorized))
        }
    }

    fn store_with(
        api: &Arc<FakeIdentity>,
        storage: &Arc<MemoryTokenStore>,
    ) -> SessionStore {
        SessionStore::new(
            Arc::clone(api) as Arc<dyn IdentityApi>,
            Arc::clone(storage) as Arc<dyn TokenStore>,
        )
    }

    #[tokio::test]
    async fn login_sets_credential_profile_and_epoch() {
        let api = Arc::new(FakeIdentity::default());
        api.account("ada@example.com", "tok_ada", 7);
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);
        assert_eq!(session.epoch(), 0);
        assert!(!session.is_authenticated());

        let profile = session.login("ada@example.com", "correct").await.unwrap();

        assert_eq!(profile.id, 7);
        assert!(session.is_authenticated());
        assert_eq!(session.epoch(), 1);
        assert_eq!(session.profile().map(|p| p.id), Some(7));
        assert_eq!(storage.load().as_deref(), Some("tok_ada"));
        assert_eq!(
            session.snapshot().channel_credential().map(Credential::as_str),
            Some("tok_ada")
        );
    }

    #[tokio::test]
    async fn failed_login_leaves_existing_session() {
        let api = Arc::new(FakeIdentity::default());
        api.account("ada@example.com", "tok_ada", 7);
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);
        session.login("ada@example.com", "correct").await.unwrap();

        let err = session.login("ada@example.com", "wrong").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);

        *api.unreachable.lock().unwrap() = true;
        let err = session.login("ada@example.com", "correct").await.unwrap_err();
        assert!(matches!(err, AuthError::NetworkError(_)));

        assert_eq!(session.epoch(), 1);
        assert_eq!(session.profile().map(|p| p.id), Some(7));
        assert_eq!(storage.load().as_deref(), Some("tok_ada"));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let api = Arc::new(FakeIdentity::default());
        api.account("ada@example.com", "tok_ada", 7);
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);
        session.login("ada@example.com", "correct").await.unwrap();

        session.logout();
        assert!(!session.is_authenticated());
        assert!(session.profile().is_none());
        assert_eq!(session.epoch(), 2);
        assert_eq!(storage.load(), None);

        session.logout();
        assert_eq!(session.epoch(), 2);
    }

    #[tokio::test]
    async fn restored_token_is_loading_until_validated() {
        let api = Arc::new(FakeIdentity::default());
        api.me_result("tok_saved", Ok(profile(3)));
        let storage = Arc::new(MemoryTokenStore::with_token("tok_saved"));
        let session = store_with(&api, &storage);

        assert!(session.is_authenticated());
        assert!(session.is_loading());
        assert!(session.profile().is_none());
        assert_eq!(session.epoch(), 1);
        assert!(session.snapshot().channel_credential().is_none());

        let profile = session.validate().await.unwrap();
        assert_eq!(profile.id, 3);
        assert!(!session.is_loading());
        assert_eq!(session.epoch(), 1);
        assert_eq!(session.snapshot().user_id, Some(3));
    }

    #[tokio::test]
    async fn validate_unauthorized_forces_logout() {
        let api = Arc::new(FakeIdentity::default());
        api.me_result("tok_stale", Err(AuthError::Unauthorized));
        let storage = Arc::new(MemoryTokenStore::with_token("tok_stale"));
        let session = store_with(&api, &storage);

        let err = session.validate().await.unwrap_err();

        assert_eq!(err, AuthError::Unauthorized);
        assert!(session.credential().is_none());
        assert!(session.profile().is_none());
        assert!(!session.is_loading());
        assert_eq!(storage.load(), None);
    }

    #[tokio::test]
    async fn validate_network_error_logs_out() {
        let api = Arc::new(FakeIdentity::default());
        api.me_result(
            "tok_saved",
            Err(AuthError::NetworkError("timeout".to_string())),
        );
        let storage = Arc::new(MemoryTokenStore::with_token("tok_saved"));
        let session = store_with(&api, &storage);

        let err = session.validate().await.unwrap_err();

        assert!(matches!(err, AuthError::NetworkError(_)));
        assert!(!session.is_authenticated());
        assert!(session.profile().is_none());
        assert!(!session.is_loading());
        assert_eq!(session.epoch(), 2);
        assert_eq!(storage.load(), None);
    }

    #[tokio::test]
    async fn refresh_network_error_keeps_session() {
        let api = Arc::new(FakeIdentity::default());
        api.account("ada@example.com", "tok_ada", 7);
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);
        session.login("ada@example.com", "correct").await.unwrap();

        api.me_result("tok_ada", Err(AuthError::NetworkError("timeout".to_string())));
        let err = session.refresh_user().await.unwrap_err();

        assert!(matches!(err, AuthError::NetworkError(_)));
        assert!(session.is_authenticated());
        assert_eq!(session.profile().map(|p| p.id), Some(7));
        assert_eq!(session.epoch(), 1);
        assert_eq!(storage.load().as_deref(), Some("tok_ada"));
    }

    #[tokio::test]
    async fn last_completing_login_wins() {
        let api = Arc::new(FakeIdentity::default());
        api.account("first@example.com", "tok_first", 1);
        api.account("second@example.com", "tok_second", 2);
        let first_gate = api.gate("first@example.com");
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.login("first@example.com", "correct").await }
        });
        tokio::task::yield_now().await;

        session.login("second@example.com", "correct").await.unwrap();
        assert_eq!(session.profile().map(|p| p.id), Some(2));

        first_gate.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(session.profile().map(|p| p.id), Some(1));
        assert_eq!(session.credential().map(|c| c.as_str().to_string()).as_deref(), Some("tok_first"));
        assert_eq!(storage.load().as_deref(), Some("tok_first"));
        assert_eq!(session.epoch(), 2);
    }

    #[tokio::test]
    async fn superseded_validation_does_not_log_out() {
        let api = Arc::new(FakeIdentity::default());
        api.me_result("tok_old", Err(AuthError::Unauthorized));
        api.account("ada@example.com", "tok_new", 9);
        let gate = api.gate("tok_old");
        let storage = Arc::new(MemoryTokenStore::with_token("tok_old"));
        let session = store_with(&api, &storage);

        let validation = tokio::spawn({
            let session = session.clone();
            async move { session.validate().await }
        });
        tokio::task::yield_now().await;

        session.login("ada@example.com", "correct").await.unwrap();
        gate.notify_one();

        assert_eq!(validation.await.unwrap(), Err(AuthError::Unauthorized));
        assert!(session.is_authenticated());
        assert_eq!(session.profile().map(|p| p.id), Some(9));
        assert_eq!(storage.load().as_deref(), Some("tok_new"));
    }

    #[tokio::test]
    async fn expire_only_ends_current_epoch() {
        let api = Arc::new(FakeIdentity::default());
        api.account("ada@example.com", "tok_ada", 7);
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);
        session.login("ada@example.com", "correct").await.unwrap();

        assert!(!session.expire(0));
        assert!(session.is_authenticated());

        assert!(session.expire(1));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn signup_fetches_profile_when_missing() {
        let api = Arc::new(FakeIdentity::default());
        api.me_result("tok_new@example.com", Ok(profile(42)));
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);

        let request = SignupRequest {
            first_name: "New".to_string(),
            last_name: "Hire".to_string(),
            email: "new@example.com".to_string(),
            password: zeroize::Zeroizing::new("pw".to_string()),
            department_id: 1,
            position: "Analyst".to_string(),
            role: None,
        };
        let profile = session.signup(&request).await.unwrap();

        assert_eq!(profile.id, 42);
        assert_eq!(session.epoch(), 1);
        assert_eq!(storage.load().as_deref(), Some("tok_new@example.com"));
    }

    #[tokio::test]
    async fn subscribers_see_each_transition() {
        let api = Arc::new(FakeIdentity::default());
        api.account("ada@example.com", "tok_ada", 7);
        let storage = Arc::new(MemoryTokenStore::new());
        let session = store_with(&api, &storage);
        let mut rx = session.subscribe();

        session.login("ada@example.com", "correct").await.unwrap();
        assert!(rx.has_changed().unwrap());
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.epoch, 1);
        assert_eq!(snap.user_id, Some(7));

        session.logout();
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.epoch, 2);
        assert!(!snap.is_authenticated());
    }
}
