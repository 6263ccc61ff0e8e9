//! Transport seam between the session driver and the network.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::error::ConnectionError;

pub use memory::{MemoryConnection, MemoryServer, MemoryTransport};
pub use websocket::WebSocketTransport;

pub(crate) const LINK_CAPACITY: usize = 64;

/// Close codes servers use to reject credentials.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn is_auth_rejection(&self) -> bool {
        self.code == CLOSE_UNAUTHORIZED || self.code == CLOSE_POLICY_VIOLATION
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Binary(Vec<u8>),
    Text(String),
    Pong,
    Closed(Option<CloseReason>),
}

/// One open connection. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::Sender<Outgoing>,
    pub incoming: mpsc::Receiver<Incoming>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: ConnectRequest) -> Result<TransportLink, ConnectionError>;
}
