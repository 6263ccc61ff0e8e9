use keyring::Entry;
use parking_lot::Mutex;

use super::error::AuthError;

pub const KEYRING_SERVICE: &str = "beach-narrator";
const DEFAULT_ACCOUNT: &str = "default";

/// Holds the long-lived credential used to mint access tokens.
pub trait SecretStore: Send + Sync {
    fn save(&self, secret: &str) -> Result<(), AuthError>;
    fn load(&self) -> Result<Option<String>, AuthError>;
    fn delete(&self) -> Result<(), AuthError>;
}

/// OS keychain entry under the `beach-narrator` service.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
    account: String,
}

impl KeyringStore {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            account: account.into(),
        }
    }

    /// Account scoped to the gateway host so separate deployments do not
    /// share a credential.
    pub fn for_gateway(gateway: &url::Url) -> Self {
        let host = gateway.host_str().unwrap_or(DEFAULT_ACCOUNT);
        Self::new(format!("{DEFAULT_ACCOUNT}@{host}"))
    }

    fn entry(&self) -> Result<Entry, AuthError> {
        Ok(Entry::new(&self.service, &self.account)?)
    }
}

impl SecretStore for KeyringStore {
    fn save(&self, secret: &str) -> Result<(), AuthError> {
        self.entry()?.set_password(secret)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, AuthError> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self) -> Result<(), AuthError> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    target: "narrator::auth",
                    error = %err,
                    service = %self.service,
                    account = %self.account,
                    "failed to delete keyring entry"
                );
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    secret: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Mutex::new(Some(secret.into())),
        }
    }
}

impl SecretStore for MemoryStore {
    fn save(&self, secret: &str) -> Result<(), AuthError> {
        *self.secret.lock() = Some(secret.to_string());
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, AuthError> {
        Ok(self.secret.lock().clone())
    }

    fn delete(&self) -> Result<(), AuthError> {
        self.secret.lock().take();
        Ok(())
    }
}
