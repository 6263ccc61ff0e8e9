use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::AuthError;
use super::refresher::TokenRefresher;
use super::store::SecretStore;
use super::token::AuthToken;

/// Two rejections within this window revoke the session.
pub const REJECTION_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    NotRequired,
    Bearer,
}

/// Outcome of a server-side credential rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Isolated; retry with a freshly minted token.
    Transient,
    /// Second rejection inside the window. The authenticated flag just went
    /// false and manual login is required.
    Revoked,
    AlreadyRevoked,
}

#[derive(Debug, Default)]
struct AuthState {
    token: Option<AuthToken>,
    last_rejection: Option<Instant>,
    revoked: bool,
}

/// Bearer token lifecycle shared by the stream and the polling client.
pub struct AuthManager {
    mode: AuthMode,
    store: Arc<dyn SecretStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    request_timeout: Duration,
    state: Mutex<AuthState>,
    refresh_lock: AsyncMutex<()>,
    authenticated: watch::Sender<bool>,
}

impl AuthManager {
    pub fn not_required() -> Self {
        Self::build(
            AuthMode::NotRequired,
            Arc::new(super::store::MemoryStore::new()),
            None,
            true,
        )
    }

    pub fn bearer(store: Arc<dyn SecretStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        let authenticated = match store.load() {
            Ok(secret) => secret.is_some(),
            Err(err) => {
                warn!(target: "narrator::auth", error = %err, "secret store unavailable");
                false
            }
        };
        Self::build(AuthMode::Bearer, store, Some(refresher), authenticated)
    }

    fn build(
        mode: AuthMode,
        store: Arc<dyn SecretStore>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        authenticated: bool,
    ) -> Self {
        let (authenticated, _) = watch::channel(authenticated);
        Self {
            mode,
            store,
            refresher,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: Mutex::new(AuthState::default()),
            refresh_lock: AsyncMutex::new(()),
            authenticated,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn is_required(&self) -> bool {
        self.mode == AuthMode::Bearer
    }

    pub fn is_authenticated(&self) -> bool {
        *self.authenticated.borrow()
    }

    pub fn watch_authenticated(&self) -> watch::Receiver<bool> {
        self.authenticated.subscribe()
    }

    /// Caches an access token obtained out of band.
    pub fn install_token(&self, value: impl Into<String>) {
        self.state.lock().token = Some(AuthToken::new(value, Instant::now()));
    }

    /// Token to attach to the next request. `None` when the server does not
    /// need one.
    pub async fn bearer_token(&self) -> Result<Option<String>, AuthError> {
        if self.mode == AuthMode::NotRequired {
            return Ok(None);
        }
        if let Some(value) = self.cached_token()? {
            return Ok(Some(value));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(value) = self.cached_token()? {
            return Ok(Some(value));
        }
        self.refresh().await.map(Some)
    }

    fn cached_token(&self) -> Result<Option<String>, AuthError> {
        let state = self.state.lock();
        if state.revoked {
            return Err(AuthError::InvalidCredentials);
        }
        match state.token.as_ref().map(|token| token.check(Instant::now())) {
            Some(Ok(value)) => Ok(Some(value.to_string())),
            Some(Err(AuthError::Expired)) => {
                debug!(target: "narrator::auth", "access token reached its ttl; refreshing");
                Ok(None)
            }
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        let Some(refresher) = self.refresher.as_ref() else {
            return Err(AuthError::NotRequired);
        };
        let Some(credential) = self.store.load()? else {
            self.revoke("no stored credential");
            return Err(AuthError::InvalidCredentials);
        };

        let refreshed =
            match tokio::time::timeout(self.request_timeout, refresher.refresh(&credential)).await {
                Ok(result) => result,
                Err(_) => Err(AuthError::Timeout),
            };
        let refreshed = match refreshed {
            Ok(refreshed) => refreshed,
            Err(AuthError::InvalidCredentials) => {
                if let Err(err) = self.store.delete() {
                    warn!(target: "narrator::auth", error = %err, "failed to clear rejected credential");
                }
                self.revoke("gateway rejected stored credential");
                return Err(AuthError::InvalidCredentials);
            }
            Err(err) => {
                warn!(target: "narrator::auth", error = %err, "token refresh failed");
                return Err(err);
            }
        };

        if let Some(rotated) = refreshed.refresh_token.as_deref() {
            self.store.save(rotated)?;
        }
        self.state.lock().token = Some(AuthToken::new(
            refreshed.access_token.clone(),
            Instant::now(),
        ));
        info!(target: "narrator::auth", "access token refreshed");
        Ok(refreshed.access_token)
    }

    /// Records a server rejection of the current token. The cached token is
    /// dropped either way.
    pub fn record_rejection(&self, now: Instant) -> Rejection {
        let mut state = self.state.lock();
        state.token = None;
        if state.revoked {
            return Rejection::AlreadyRevoked;
        }
        let last_rejection = state.last_rejection;
        match last_rejection {
            Some(previous) if now.saturating_duration_since(previous) <= REJECTION_WINDOW => {
                state.revoked = true;
                drop(state);
                self.set_authenticated(false);
                warn!(target: "narrator::auth", "credentials rejected twice in a row; login required");
                Rejection::Revoked
            }
            _ => {
                state.last_rejection = Some(now);
                debug!(target: "narrator::auth", "credentials rejected; will refresh and retry");
                Rejection::Transient
            }
        }
    }

    pub fn login(&self, credential: &str) -> Result<(), AuthError> {
        self.store.save(credential)?;
        *self.state.lock() = AuthState::default();
        self.set_authenticated(true);
        info!(target: "narrator::auth", "credential stored");
        Ok(())
    }

    pub fn logout(&self) -> Result<(), AuthError> {
        self.store.delete()?;
        {
            let mut state = self.state.lock();
            state.token = None;
            state.last_rejection = None;
        }
        self.set_authenticated(false);
        info!(target: "narrator::auth", "credential removed");
        Ok(())
    }

    fn revoke(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            state.token = None;
            state.revoked = true;
        }
        warn!(target: "narrator::auth", reason, "authentication lost");
        self.set_authenticated(false);
    }

    fn set_authenticated(&self, value: bool) {
        self.authenticated.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::auth::refresher::RefreshedToken;
    use crate::auth::store::MemoryStore;
    use crate::auth::token::TOKEN_TTL;

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, credential: &str) -> Result<RefreshedToken, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject {
                return Err(AuthError::InvalidCredentials);
            }
            Ok(RefreshedToken {
                access_token: format!("{credential}-access-{call}"),
                refresh_token: None,
            })
        }
    }

    fn manager(reject: bool) -> (AuthManager, Arc<CountingRefresher>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_secret("cred"));
        let refresher = Arc::new(CountingRefresher {
            reject,
            ..CountingRefresher::default()
        });
        let manager = AuthManager::bearer(store.clone(), refresher.clone());
        (manager, refresher, store)
    }

    #[test_timeout::tokio_timeout_test]
    async fn not_required_short_circuits() {
        let manager = AuthManager::not_required();
        assert_eq!(manager.bearer_token().await.expect("token"), None);
        assert!(manager.is_authenticated());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn token_is_cached_until_the_ttl() {
        let (manager, refresher, _store) = manager(false);

        let first = manager.bearer_token().await.expect("token");
        assert_eq!(first.as_deref(), Some("cred-access-1"));
        tokio::time::advance(TOKEN_TTL - Duration::from_secs(1)).await;
        assert_eq!(manager.bearer_token().await.expect("token"), first);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = manager.bearer_token().await.expect("token");
        assert_eq!(second.as_deref(), Some("cred-access-2"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn two_quick_rejections_revoke_once() {
        let (manager, _refresher, _store) = manager(false);
        let mut flag = manager.watch_authenticated();
        assert!(*flag.borrow_and_update());

        let start = Instant::now();
        assert_eq!(manager.record_rejection(start), Rejection::Transient);
        assert!(manager.is_authenticated());
        assert_eq!(
            manager.record_rejection(start + Duration::from_secs(4)),
            Rejection::Revoked
        );
        assert_eq!(
            manager.record_rejection(start + Duration::from_secs(5)),
            Rejection::AlreadyRevoked
        );

        assert!(flag.has_changed().expect("sender alive"));
        assert!(!*flag.borrow_and_update());
        assert!(!flag.has_changed().expect("sender alive"));
        assert!(matches!(
            manager.bearer_token().await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn spaced_rejections_stay_transient() {
        let (manager, _refresher, _store) = manager(false);
        let start = Instant::now();
        assert_eq!(manager.record_rejection(start), Rejection::Transient);
        assert_eq!(
            manager.record_rejection(start + Duration::from_secs(6)),
            Rejection::Transient
        );
        assert!(manager.is_authenticated());
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_credential_is_cleared_and_login_restores() {
        let (manager, _refresher, store) = manager(true);

        assert!(matches!(
            manager.bearer_token().await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(!manager.is_authenticated());
        assert_eq!(store.load().expect("load"), None);

        manager.login("fresh").expect("login");
        assert!(manager.is_authenticated());
        assert_eq!(store.load().expect("load").as_deref(), Some("fresh"));
    }
}
