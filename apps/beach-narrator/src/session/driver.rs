use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use snapshot_wire::StreamFrame;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::error::ConnectionError;
use super::messages::{ControlMessage, ServerMessage};
use super::monitor::DecodeFailureMonitor;
use super::state::{ConnectionState, SessionFailure, StreamEvent};
use super::transport::{ConnectRequest, Incoming, Outgoing, TransportLink};
use super::Shared;
use crate::auth::Rejection;

const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// How one connection lifetime ended.
enum LinkEnd {
    Cancelled,
    Fatal(SessionFailure),
    Failed {
        error: ConnectionError,
        /// The link reached `Streaming` before failing.
        streamed: bool,
    },
}

impl LinkEnd {
    fn closed(streamed: bool) -> Self {
        LinkEnd::Failed {
            error: ConnectionError::Closed,
            streamed,
        }
    }
}

pub(super) async fn run(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let mut rng = StdRng::from_entropy();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() || !shared.publish(generation, ConnectionState::Connecting) {
            return;
        }

        let error = match connect_once(&shared, generation, &cancel).await {
            LinkEnd::Cancelled => return,
            LinkEnd::Fatal(failure) => {
                error!(target: "narrator::session", %failure, "session stopped");
                if failure == SessionFailure::AuthenticationRequired {
                    shared.emit(generation, StreamEvent::AuthenticationLost);
                }
                shared.publish(
                    generation,
                    ConnectionState::Disconnected {
                        failure: Some(failure),
                    },
                );
                return;
            }
            LinkEnd::Failed { error, streamed } => {
                if streamed {
                    attempt = 0;
                }
                error
            }
        };

        attempt += 1;
        let max_attempts = shared.options.max_attempts;
        if attempt > max_attempts {
            error!(
                target: "narrator::session",
                attempts = max_attempts,
                error = %error,
                "giving up on the session server"
            );
            shared.publish(
                generation,
                ConnectionState::Disconnected {
                    failure: Some(SessionFailure::RetriesExhausted {
                        attempts: max_attempts,
                    }),
                },
            );
            return;
        }

        let delay = shared.options.backoff.delay(attempt, &mut rng);
        warn!(
            target: "narrator::session",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "connection lost; reconnecting"
        );
        if !shared.publish(generation, ConnectionState::Reconnecting { attempt, delay }) {
            return;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_once(shared: &Shared, generation: u64, cancel: &CancellationToken) -> LinkEnd {
    let auth = &shared.auth;
    let bearer = if auth.is_required() {
        if !shared.publish(generation, ConnectionState::Authenticating) {
            return LinkEnd::Cancelled;
        }
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LinkEnd::Cancelled,
            token = auth.bearer_token() => token,
        };
        match token {
            Ok(token) => token,
            Err(err) if err.is_terminal() => {
                return LinkEnd::Fatal(SessionFailure::AuthenticationRequired);
            }
            Err(err) => {
                return LinkEnd::Failed {
                    error: err.into(),
                    streamed: false,
                };
            }
        }
    } else {
        None
    };

    let request = ConnectRequest {
        url: shared.options.endpoint.clone(),
        bearer,
    };
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return LinkEnd::Cancelled,
        opened = tokio::time::timeout(shared.options.request_timeout, shared.transport.open(request)) => opened,
    };
    let link = match opened {
        Ok(Ok(link)) => link,
        Ok(Err(ConnectionError::AuthRejected)) => return rejection(shared, false),
        Ok(Err(error)) => {
            return LinkEnd::Failed {
                error,
                streamed: false,
            };
        }
        Err(_) => {
            return LinkEnd::Failed {
                error: ConnectionError::Timeout,
                streamed: false,
            };
        }
    };

    let subscribed = shared.session_id();
    if !shared.emit(
        generation,
        StreamEvent::Reset {
            session_id: subscribed.clone(),
        },
    ) {
        return LinkEnd::Cancelled;
    }
    let end = serve_link(shared, generation, cancel, link, subscribed).await;
    // A cancelled link was ended by `disconnect`, which reports it.
    if !matches!(end, LinkEnd::Cancelled) {
        shared.emit(generation, StreamEvent::Disconnected);
    }
    end
}

async fn serve_link(
    shared: &Shared,
    generation: u64,
    cancel: &CancellationToken,
    link: TransportLink,
    subscribed: Option<String>,
) -> LinkEnd {
    if !shared.publish(generation, ConnectionState::Subscribing) {
        return LinkEnd::Cancelled;
    }
    if let Some(session_id) = subscribed.clone() {
        if !send_control(&link.outgoing, ControlMessage::Subscribe { session_id }).await {
            return LinkEnd::closed(false);
        }
    }
    if !shared.publish(generation, ConnectionState::Streaming) {
        return LinkEnd::Cancelled;
    }
    info!(target: "narrator::session", session_id = ?subscribed, "streaming");

    stream(shared, generation, cancel, link, subscribed).await
}

async fn stream(
    shared: &Shared,
    generation: u64,
    cancel: &CancellationToken,
    link: TransportLink,
    mut subscribed: Option<String>,
) -> LinkEnd {
    let TransportLink {
        outgoing,
        mut incoming,
    } = link;
    let options = &shared.options;
    let ping_interval = options.ping_interval.max(MIN_PING_INTERVAL);
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;
    let mut monitor = DecodeFailureMonitor::new();
    // Set after a switch; frames still in flight belong to the old id.
    let mut awaiting_ack: Option<String> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = outgoing.try_send(Outgoing::Close);
                return LinkEnd::Cancelled;
            }
            _ = shared.session_changed.notified() => {
                let desired = shared.session_id();
                if desired == subscribed {
                    continue;
                }
                if let Some(session_id) = subscribed.take() {
                    if !send_control(&outgoing, ControlMessage::Unsubscribe { session_id }).await {
                        return LinkEnd::closed(true);
                    }
                }
                if !shared.emit(generation, StreamEvent::Reset { session_id: desired.clone() }) {
                    return LinkEnd::Cancelled;
                }
                if let Some(session_id) = desired.clone() {
                    if !send_control(&outgoing, ControlMessage::Subscribe { session_id }).await {
                        return LinkEnd::closed(true);
                    }
                }
                info!(target: "narrator::session", session_id = ?desired, "subscription changed");
                awaiting_ack = desired.clone();
                subscribed = desired;
            }
            frame = incoming.recv() => {
                pong_deadline = None;
                match frame {
                    Some(Incoming::Binary(_)) if awaiting_ack.is_some() => {
                        trace!(target: "narrator::session", "dropping frame sent before the subscription switch");
                    }
                    Some(Incoming::Binary(bytes)) => {
                        if !handle_frame(shared, generation, &mut monitor, &bytes) {
                            return LinkEnd::Cancelled;
                        }
                    }
                    Some(Incoming::Text(text)) => match ServerMessage::parse(&text) {
                        Some(message) if message.is_unauthorized() => {
                            let _ = outgoing.try_send(Outgoing::Close);
                            return rejection(shared, true);
                        }
                        Some(ServerMessage::Error { code, message }) => {
                            warn!(target: "narrator::session", code = ?code, message = ?message, "server reported an error");
                        }
                        Some(ServerMessage::Subscribed { session_id }) => {
                            debug!(target: "narrator::session", session_id = ?session_id, "subscription acknowledged");
                            if session_id.is_none() || session_id == awaiting_ack {
                                awaiting_ack = None;
                            }
                        }
                        Some(ServerMessage::Pong) | Some(ServerMessage::Unknown) => {}
                        None => trace!(target: "narrator::session", "ignoring unparseable text frame"),
                    },
                    Some(Incoming::Pong) => {}
                    Some(Incoming::Closed(Some(reason))) if reason.is_auth_rejection() => {
                        return rejection(shared, true);
                    }
                    Some(Incoming::Closed(reason)) => {
                        debug!(target: "narrator::session", reason = ?reason, "server closed the stream");
                        return LinkEnd::closed(true);
                    }
                    None => return LinkEnd::closed(true),
                }
            }
            _ = ping.tick() => {
                if outgoing.send(Outgoing::Ping).await.is_err() {
                    return LinkEnd::closed(true);
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + options.pong_grace);
                }
            }
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                warn!(
                    target: "narrator::session",
                    grace_ms = options.pong_grace.as_millis() as u64,
                    "no traffic after ping; dropping the link"
                );
                let _ = outgoing.try_send(Outgoing::Close);
                return LinkEnd::Failed {
                    error: ConnectionError::Timeout,
                    streamed: true,
                };
            }
        }
    }
}

/// Returns false once this driver's generation is stale.
fn handle_frame(
    shared: &Shared,
    generation: u64,
    monitor: &mut DecodeFailureMonitor,
    bytes: &[u8],
) -> bool {
    match StreamFrame::parse(bytes) {
        Some(StreamFrame::Snapshot(body)) => match snapshot_wire::decode(body) {
            Ok(snapshot) => {
                monitor.record_success();
                let snapshot = Arc::new(snapshot);
                if !shared.emit(generation, StreamEvent::Snapshot(Arc::clone(&snapshot))) {
                    return false;
                }
                shared.store_snapshot(snapshot);
                true
            }
            Err(err) => match monitor.record_failure(&err, Instant::now()) {
                Some(failures) => shared.emit(generation, StreamEvent::IncompatibleServer { failures }),
                None => true,
            },
        },
        Some(StreamFrame::Other(kind)) => {
            trace!(target: "narrator::session", kind, "ignoring non-snapshot frame");
            true
        }
        None => true,
    }
}

fn rejection(shared: &Shared, streamed: bool) -> LinkEnd {
    if !shared.auth.is_required() {
        warn!(target: "narrator::session", "server demands credentials but authentication is disabled");
        return LinkEnd::Fatal(SessionFailure::AuthenticationRequired);
    }
    match shared.auth.record_rejection(Instant::now()) {
        Rejection::Transient => LinkEnd::Failed {
            error: ConnectionError::AuthRejected,
            streamed,
        },
        Rejection::Revoked | Rejection::AlreadyRevoked => {
            LinkEnd::Fatal(SessionFailure::AuthenticationRequired)
        }
    }
}

/// False when the link can no longer carry control traffic.
async fn send_control(outgoing: &mpsc::Sender<Outgoing>, message: ControlMessage) -> bool {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(err) => {
            error!(target: "narrator::session", message = ?message, error = %err, "cannot encode control message");
            return false;
        }
    };
    debug!(target: "narrator::session", message = ?message, "sending control message");
    outgoing.send(Outgoing::Text(text)).await.is_ok()
}
