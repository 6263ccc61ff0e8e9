use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access token expired")]
    Expired,
    #[error("stored credentials were rejected; log in again")]
    InvalidCredentials,
    #[error("server does not require authentication")]
    NotRequired,
    #[error("secret store error: {0}")]
    Store(String),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("auth request timed out")]
    Timeout,
}

impl AuthError {
    /// Whether the credential itself is bad, as opposed to the path to the
    /// gateway.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::InvalidCredentials)
    }
}

impl From<keyring::Error> for AuthError {
    fn from(value: keyring::Error) -> Self {
        AuthError::Store(value.to_string())
    }
}
