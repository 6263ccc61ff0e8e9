use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use beach_narrator::auth::{AuthError, AuthManager, MemoryStore, RefreshedToken, TokenRefresher};
use beach_narrator::session::{
    ConnectionState, SessionFailure, SessionOptions, StreamEvent, StreamSession,
};
use beach_narrator::{BatchPolicy, FlushEvent, NarrationPipeline};
use snapshot_wire::{Cell, FRAME_SNAPSHOT, Snapshot, SnapshotHeader};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Handshake {
    query_token: Option<String>,
    header_token: Option<String>,
}

#[derive(Clone)]
struct StubState {
    handshakes: mpsc::UnboundedSender<Handshake>,
    subscriptions: mpsc::UnboundedSender<String>,
    accepted_token: Option<String>,
    screen: &'static str,
}

struct FixedRefresher(&'static str);

#[async_trait]
impl TokenRefresher for FixedRefresher {
    async fn refresh(&self, _credential: &str) -> Result<RefreshedToken, AuthError> {
        Ok(RefreshedToken {
            access_token: self.0.to_string(),
            refresh_token: None,
        })
    }
}

fn bearer_auth(token: &'static str) -> Arc<AuthManager> {
    Arc::new(AuthManager::bearer(
        Arc::new(MemoryStore::with_secret("refresh")),
        Arc::new(FixedRefresher(token)),
    ))
}

fn snapshot_body(text: &str) -> Vec<u8> {
    let header = SnapshotHeader {
        cols: 80,
        rows: 24,
        viewport_y: 0,
        cursor_x: text.chars().count() as i32,
        cursor_y: 0,
    };
    let row = text.chars().map(Cell::new).collect();
    let snapshot = Snapshot::from_rows(header, vec![row]).expect("snapshot");
    let mut frame = vec![FRAME_SNAPSHOT];
    frame.extend(snapshot_wire::encode(&snapshot));
    frame
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let handshake = Handshake {
        query_token: query.get("token").cloned(),
        header_token: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string),
    };
    let authorized = match state.accepted_token.as_deref() {
        None => true,
        Some(expected) => handshake.header_token.as_deref() == Some(expected),
    };
    let _ = state.handshakes.send(handshake);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    ws.on_upgrade(move |socket| serve_stream(socket, state))
}

async fn serve_stream(socket: WebSocket, state: StubState) {
    let (mut sender, mut receiver) = socket.split();
    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) != Some("subscribe") {
            continue;
        }
        let session_id = value
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ack = format!(r#"{{"type":"subscribed","session_id":"{session_id}"}}"#);
        let _ = state.subscriptions.send(session_id);
        if sender.send(WsMessage::Text(ack)).await.is_err() {
            break;
        }
        if sender
            .send(WsMessage::Binary(snapshot_body(state.screen)))
            .await
            .is_err()
        {
            break;
        }
    }
}

struct Stub {
    endpoint: Url,
    handshakes: mpsc::UnboundedReceiver<Handshake>,
    subscriptions: mpsc::UnboundedReceiver<String>,
}

async fn spawn_stub(accepted_token: Option<String>, screen: &'static str) -> Stub {
    let (handshakes_tx, handshakes) = mpsc::unbounded_channel();
    let (subscriptions_tx, subscriptions) = mpsc::unbounded_channel();
    let state = StubState {
        handshakes: handshakes_tx,
        subscriptions: subscriptions_tx,
        accepted_token,
        screen,
    };
    let router = Router::new()
        .route("/api/stream", get(stream_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    Stub {
        endpoint: Url::parse(&format!("ws://{addr}/api/stream")).expect("endpoint"),
        handshakes,
        subscriptions,
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn websocket_session_feeds_the_narration_pipeline() {
    let mut stub = spawn_stub(Some("access-token".into()), "user@beach:~$ ls").await;
    let session = StreamSession::websocket(SessionOptions::new(stub.endpoint.clone()), bearer_auth("access-token"));

    let (flush_tx, mut flushes) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let policy = BatchPolicy {
        char_threshold: 10,
        ..BatchPolicy::default()
    };
    let pipeline = NarrationPipeline::new(policy).spawn(
        session.observe(),
        move |event: FlushEvent| {
            let _ = flush_tx.send(event);
        },
        cancel.clone(),
    );

    session.subscribe("demo");
    session.connect();

    let handshake = stub.handshakes.recv().await.expect("handshake");
    assert_eq!(handshake.query_token.as_deref(), Some("access-token"));
    assert_eq!(handshake.header_token.as_deref(), Some("access-token"));
    assert_eq!(stub.subscriptions.recv().await.as_deref(), Some("demo"));

    let flush = flushes.recv().await.expect("flush");
    assert_eq!(flush.text, "user@beach:~$ ls");
    let latest = session.latest_snapshot().expect("latest snapshot");
    assert_eq!(latest.cursor(), (16, 0));
    assert_eq!(session.state(), ConnectionState::Streaming);

    session.disconnect();
    cancel.cancel();
    pipeline.await.expect("pipeline task");
}

#[test_timeout::tokio_timeout_test(30)]
async fn upgrade_rejections_end_in_login_required() {
    let mut stub = spawn_stub(Some("expected".into()), "unused").await;
    let auth = bearer_auth("stale");
    let session = StreamSession::websocket(SessionOptions::new(stub.endpoint.clone()), auth.clone());
    let mut events = session.observe();
    let mut states = session.watch_state();

    session.subscribe("demo");
    session.connect();

    let ended = states
        .wait_for(|state| state.failure().is_some())
        .await
        .expect("terminal state")
        .clone();
    assert_eq!(ended.failure(), Some(SessionFailure::AuthenticationRequired));
    assert!(!auth.is_authenticated());
    assert_eq!(
        events.recv().await.expect("event"),
        StreamEvent::AuthenticationLost
    );

    let mut attempts = 0;
    while stub.handshakes.try_recv().is_ok() {
        attempts += 1;
    }
    assert_eq!(attempts, 2);
    assert!(stub.subscriptions.try_recv().is_err());
}
