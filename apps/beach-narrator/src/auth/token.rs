use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::error::AuthError;

/// Fixed access token lifetime, counted from issuance on this client.
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: String,
    issued_at: Instant,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, issued_at: Instant) -> Self {
        Self {
            value: value.into(),
            issued_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.age_at(now) >= TOKEN_TTL
    }

    /// The token value if it is still inside its TTL.
    pub fn check(&self, now: Instant) -> Result<&str, AuthError> {
        if self.is_expired_at(now) {
            Err(AuthError::Expired)
        } else {
            Ok(&self.value)
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
