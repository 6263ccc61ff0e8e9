//! Resilient snapshot stream: connection state machine, fan-out and
//! reconnect handling for one remote terminal session.

pub mod backoff;
mod driver;
pub mod error;
pub mod messages;
pub mod monitor;
pub mod state;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snapshot_wire::Snapshot;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::auth::AuthManager;

pub use backoff::BackoffPolicy;
pub use error::ConnectionError;
pub use messages::{ControlMessage, ServerMessage};
pub use monitor::DecodeFailureMonitor;
pub use state::{ConnectionState, SessionFailure, StreamEvent};
pub use transport::{
    ConnectRequest, Incoming, MemoryConnection, MemoryServer, MemoryTransport, Outgoing,
    Transport, TransportLink, WebSocketTransport,
};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PONG_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// WebSocket endpoint, e.g. `ws://host/api/stream`.
    pub endpoint: Url,
    pub ping_interval: Duration,
    pub pong_grace: Duration,
    /// Bound on opening the transport.
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
    pub event_capacity: usize,
}

impl SessionOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_grace: DEFAULT_PONG_GRACE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Default)]
struct Control {
    /// Bumped by every `connect` and `disconnect`; a driver only publishes
    /// while its generation is current.
    generation: u64,
    cancel: Option<CancellationToken>,
    driver: Option<JoinHandle<()>>,
    session_id: Option<String>,
}

struct Shared {
    options: SessionOptions,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthManager>,
    control: Mutex<Control>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<StreamEvent>,
    latest: Mutex<Option<Arc<Snapshot>>>,
    session_changed: Notify,
}

impl Shared {
    /// Publishes `state` if `generation` is still current. Holding the
    /// control lock orders this against `disconnect`.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        debug!(target: "narrator::session", state = %state, "connection state");
        self.state.send_replace(state);
        true
    }

    fn emit(&self, generation: u64, event: StreamEvent) -> bool {
        let control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        // No receivers is fine; observers may attach later.
        let _ = self.events.send(event);
        true
    }

    fn session_id(&self) -> Option<String> {
        self.control.lock().session_id.clone()
    }

    fn store_snapshot(&self, snapshot: Arc<Snapshot>) {
        *self.latest.lock() = Some(snapshot);
    }

    fn clear_snapshot(&self) {
        self.latest.lock().take();
    }
}

/// Handle to one streaming connection. Clones share the same socket, state
/// and event fan-out.
#[derive(Clone)]
pub struct StreamSession {
    shared: Arc<Shared>,
}

impl StreamSession {
    pub fn new(options: SessionOptions, transport: Arc<dyn Transport>, auth: Arc<AuthManager>) -> Self {
        let (state, _) = watch::channel(ConnectionState::IDLE);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                options,
                transport,
                auth,
                control: Mutex::new(Control::default()),
                state,
                events,
                latest: Mutex::new(None),
                session_changed: Notify::new(),
            }),
        }
    }

    pub fn websocket(options: SessionOptions, auth: Arc<AuthManager>) -> Self {
        Self::new(options, Arc::new(WebSocketTransport::new()), auth)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    /// Starts the driver. A no-op while one is already running.
    pub fn connect(&self) {
        let mut control = self.shared.control.lock();
        if control
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
        {
            return;
        }

        control.generation += 1;
        let generation = control.generation;
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(driver::run(
            Arc::clone(&self.shared),
            generation,
            cancel.clone(),
        ));
        control.cancel = Some(cancel);
        control.driver = Some(driver);
        info!(target: "narrator::session", endpoint = %self.shared.options.endpoint, "session connecting");
    }

    /// Selects the remote session to stream. Takes effect immediately when
    /// connected and is replayed on every reconnect.
    pub fn subscribe(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        let mut control = self.shared.control.lock();
        if control.session_id.as_deref() == Some(session_id.as_str()) {
            return;
        }
        self.shared.clear_snapshot();
        control.session_id = Some(session_id);
        self.shared.session_changed.notify_one();
    }

    pub fn unsubscribe(&self) {
        let mut control = self.shared.control.lock();
        if control.session_id.take().is_none() {
            return;
        }
        self.shared.clear_snapshot();
        self.shared.session_changed.notify_one();
    }

    /// Stops the driver and every pending wait. Idempotent; a backoff sleep
    /// that is already running can no longer reconnect.
    pub fn disconnect(&self) {
        let mut control = self.shared.control.lock();
        if control.cancel.is_some() {
            // Under the lock, so nothing from the stopped driver can follow it.
            let _ = self.shared.events.send(StreamEvent::Disconnected);
        }
        control.generation += 1;
        control.driver = None;
        let was_running = match control.cancel.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        };
        self.shared.state.send_if_modified(|state| {
            let idle = ConnectionState::IDLE;
            if *state == idle {
                false
            } else {
                *state = idle;
                true
            }
        });
        if was_running {
            info!(target: "narrator::session", "session disconnected");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// New receiver of the event fan-out. Events sent before this call are
    /// not replayed.
    pub fn observe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Last successfully decoded snapshot for the current session id.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.latest.lock().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.shared.auth
    }
}
