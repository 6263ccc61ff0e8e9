//! Request/response alternative to the stream: fetch one snapshot.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use snapshot_wire::{ProtocolError, Snapshot};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AuthError, AuthManager};

const ACCEPTED_TYPES: &str = "application/octet-stream, application/json";

#[derive(Debug, Error)]
pub enum PollError {
    #[error("server rejected credentials")]
    Unauthorized,
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct PollingClient {
    client: Client,
    server: Url,
    auth: Arc<AuthManager>,
}

impl PollingClient {
    pub fn new(server: Url, auth: Arc<AuthManager>, timeout: Duration) -> Result<Self, PollError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server,
            auth,
        })
    }

    pub fn snapshot_url(&self, session_id: &str) -> Url {
        let mut url = self.server.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "sessions", session_id, "snapshot"]);
        }
        url
    }

    pub async fn fetch(&self, session_id: &str) -> Result<Snapshot, PollError> {
        let url = self.snapshot_url(session_id);
        let token = self.auth.bearer_token().await?;

        let mut request = self.client.get(url.clone()).header(ACCEPT, ACCEPTED_TYPES);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if self.auth.is_required() {
                let outcome = self.auth.record_rejection(Instant::now());
                warn!(target: "narrator::poll", %status, outcome = ?outcome, "snapshot request rejected");
            }
            return Err(PollError::Unauthorized);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(PollError::NotFound(session_id.to_string()));
        }
        if !status.is_success() {
            return Err(PollError::Status(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response.bytes().await?;
        debug!(
            target: "narrator::poll",
            url = %url,
            content_type = %content_type,
            bytes = body.len(),
            "snapshot fetched"
        );
        decode_body(&content_type, &body)
    }
}

/// Picks the decoder from the response content type.
pub fn decode_body(content_type: &str, body: &[u8]) -> Result<Snapshot, PollError> {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("octet-stream") || content_type.contains("binary") {
        Ok(snapshot_wire::decode(body)?)
    } else if content_type.contains("json") {
        Ok(snapshot_wire::decode_json(body)?)
    } else {
        Err(PollError::UnsupportedContentType(content_type))
    }
}
