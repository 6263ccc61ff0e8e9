pub mod error;
pub mod manager;
pub mod refresher;
pub mod store;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

pub use error::AuthError;
pub use manager::{AuthManager, AuthMode, REJECTION_WINDOW, Rejection};
pub use refresher::{HttpTokenRefresher, RefreshedToken, TokenRefresher};
pub use store::{KeyringStore, MemoryStore, SecretStore};
pub use token::{AuthToken, TOKEN_TTL};

use crate::config::AuthSettings;

impl AuthManager {
    /// Builds the manager described by configuration.
    pub fn from_settings(settings: &AuthSettings, request_timeout: Duration) -> Result<Self, AuthError> {
        match settings.mode {
            AuthMode::NotRequired => Ok(AuthManager::not_required().with_request_timeout(request_timeout)),
            AuthMode::Bearer => AuthManager::keyring(settings, request_timeout),
        }
    }

    /// Bearer manager backed by the OS keychain and the HTTP auth gateway,
    /// regardless of the configured mode.
    pub fn keyring(settings: &AuthSettings, request_timeout: Duration) -> Result<Self, AuthError> {
        let store = Arc::new(KeyringStore::for_gateway(&settings.gateway));
        let refresher = Arc::new(HttpTokenRefresher::new(
            settings.gateway.clone(),
            request_timeout,
        )?);
        Ok(AuthManager::bearer(store, refresher).with_request_timeout(request_timeout))
    }
}
