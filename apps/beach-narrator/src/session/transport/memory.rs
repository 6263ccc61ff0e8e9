use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use snapshot_wire::StreamFrame;
use tokio::sync::mpsc;

use super::{
    CloseReason, ConnectRequest, Incoming, LINK_CAPACITY, Outgoing, Transport, TransportLink,
};
use crate::session::error::ConnectionError;
use crate::session::messages::ControlMessage;

/// In-process transport; every successful `open` hands a
/// [`MemoryConnection`] to the paired [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryTransport {
    connections: mpsc::UnboundedSender<MemoryConnection>,
    failures: Mutex<VecDeque<ConnectionError>>,
    opens: AtomicUsize,
}

#[derive(Debug)]
pub struct MemoryServer {
    connections: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// Server side of one in-memory link.
#[derive(Debug)]
pub struct MemoryConnection {
    pub request: ConnectRequest,
    pub from_client: mpsc::Receiver<Outgoing>,
    pub to_client: mpsc::Sender<Incoming>,
}

impl MemoryTransport {
    pub fn pair() -> (Arc<Self>, MemoryServer) {
        let (connections, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connections,
            failures: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
        });
        (transport, MemoryServer { connections: accepted })
    }

    /// Queues an error for the next `open` call.
    pub fn fail_next(&self, error: ConnectionError) {
        self.failures.lock().push_back(error);
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, request: ConnectRequest) -> Result<TransportLink, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(LINK_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(LINK_CAPACITY);
        let connection = MemoryConnection {
            request,
            from_client: outgoing_rx,
            to_client: incoming_tx,
        };
        self.connections
            .send(connection)
            .map_err(|_| ConnectionError::Unreachable("memory server dropped".into()))?;
        Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.connections.recv().await
    }

    /// Connections opened but not yet accepted.
    pub fn try_accept(&mut self) -> Option<MemoryConnection> {
        self.connections.try_recv().ok()
    }
}

impl MemoryConnection {
    /// Next control message from the client, skipping pings. `None` once the
    /// client closes the link.
    pub async fn next_control(&mut self) -> Option<ControlMessage> {
        loop {
            match self.from_client.recv().await? {
                Outgoing::Text(text) => {
                    if let Ok(message) = serde_json::from_str(&text) {
                        return Some(message);
                    }
                }
                Outgoing::Close => return None,
                Outgoing::Ping | Outgoing::Binary(_) => {}
            }
        }
    }

    /// Next raw message from the client, or `None` once it hangs up.
    pub async fn next_outgoing(&mut self) -> Option<Outgoing> {
        self.from_client.recv().await
    }

    pub async fn send_snapshot(&self, body: &[u8]) -> bool {
        self.send(Incoming::Binary(StreamFrame::wrap_snapshot(body)))
            .await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Incoming::Text(text.into())).await
    }

    pub async fn send(&self, message: Incoming) -> bool {
        self.to_client.send(message).await.is_ok()
    }

    pub async fn close(&self, code: Option<u16>) -> bool {
        let reason = code.map(|code| CloseReason {
            code,
            reason: String::new(),
        });
        self.send(Incoming::Closed(reason)).await
    }
}
