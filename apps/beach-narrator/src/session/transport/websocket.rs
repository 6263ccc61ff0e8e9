use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use url::Url;

use super::{
    CloseReason, ConnectRequest, Incoming, LINK_CAPACITY, Outgoing, Transport, TransportLink,
};
use crate::session::error::ConnectionError;

/// Streams over a WebSocket. The bearer token travels as a `token` query
/// value and as an `Authorization` header.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn request_url(request: &ConnectRequest) -> Url {
    let mut url = request.url.clone();
    if let Some(token) = request.bearer.as_deref() {
        url.query_pairs_mut().append_pair("token", token);
    }
    url
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: ConnectRequest) -> Result<TransportLink, ConnectionError> {
        let url = request_url(&request);
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectionError::HandshakeFailed(err.to_string()))?;
        if let Some(token) = request.bearer.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| ConnectionError::HandshakeFailed(err.to_string()))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(ws_request).await.map_err(map_connect_error)?;
        debug!(target: "narrator::session", url = %request.url, "websocket connected");

        let (outgoing_tx, outgoing_rx) = mpsc::channel(LINK_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(LINK_CAPACITY);
        tokio::spawn(pump(stream, outgoing_rx, incoming_tx));

        Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

fn map_connect_error(err: WsError) -> ConnectionError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ConnectionError::AuthRejected
            } else {
                ConnectionError::HandshakeFailed(format!("upgrade refused with {status}"))
            }
        }
        WsError::Io(err) => ConnectionError::Unreachable(err.to_string()),
        other => ConnectionError::HandshakeFailed(other.to_string()),
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    incoming: mpsc::Sender<Incoming>,
) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let message = match message {
                    Some(Outgoing::Text(text)) => Message::Text(text),
                    Some(Outgoing::Binary(bytes)) => Message::Binary(bytes),
                    Some(Outgoing::Ping) => Message::Ping(Vec::new()),
                    Some(Outgoing::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(err) = sink.send(message).await {
                    debug!(target: "narrator::session", error = %err, "websocket send failed");
                    let _ = incoming.send(Incoming::Closed(None)).await;
                    break;
                }
            }
            frame = source.next() => {
                let forwarded = match frame {
                    Some(Ok(Message::Binary(bytes))) => Incoming::Binary(bytes),
                    Some(Ok(Message::Text(text))) => Incoming::Text(text),
                    Some(Ok(Message::Pong(_))) => Incoming::Pong,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|frame| CloseReason {
                            code: u16::from(frame.code),
                            reason: frame.reason.into_owned(),
                        });
                        let _ = incoming.send(Incoming::Closed(reason)).await;
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(target: "narrator::session", error = %err, "websocket read failed");
                        let _ = incoming.send(Incoming::Closed(None)).await;
                        break;
                    }
                    None => {
                        let _ = incoming.send(Incoming::Closed(None)).await;
                        break;
                    }
                };
                if incoming.send(forwarded).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!(target: "narrator::session", "websocket pump stopped");
}
