use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("connection timed out")]
    Timeout,
    #[error("server rejected credentials")]
    AuthRejected,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Auth(#[from] AuthError),
}
