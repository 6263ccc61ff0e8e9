use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use snapshot_wire::Snapshot;

/// Why a session stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFailure {
    RetriesExhausted { attempts: u32 },
    AuthenticationRequired,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::RetriesExhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
            SessionFailure::AuthenticationRequired => f.write_str("login required"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { failure: Option<SessionFailure> },
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub const IDLE: ConnectionState = ConnectionState::Disconnected { failure: None };

    pub fn failure(&self) -> Option<SessionFailure> {
        match self {
            ConnectionState::Disconnected { failure } => *failure,
            _ => None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::IDLE
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected { failure: None } => f.write_str("disconnected"),
            ConnectionState::Disconnected {
                failure: Some(failure),
            } => write!(f, "disconnected ({failure})"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Subscribing => f.write_str("subscribing"),
            ConnectionState::Streaming => f.write_str("streaming"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {delay:?})")
            }
        }
    }
}

/// Fan-out events, in arrival order, for every observer of one session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A new connection or a different session id; diff baselines are stale.
    Reset { session_id: Option<String> },
    Snapshot(Arc<Snapshot>),
    /// Frames have been undecodable long enough to suspect a protocol
    /// mismatch.
    IncompatibleServer { failures: u64 },
    AuthenticationLost,
    /// The stream stopped, either by `disconnect` or by losing the link.
    /// Nothing before this event should be narrated.
    Disconnected,
}
