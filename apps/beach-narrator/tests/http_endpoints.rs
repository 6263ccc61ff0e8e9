use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

use beach_narrator::auth::{
    AuthError, AuthManager, HttpTokenRefresher, MemoryStore, SecretStore, TokenRefresher,
};
use beach_narrator::polling::{PollError, PollingClient};
use snapshot_wire::{Cell, Color, Snapshot, SnapshotHeader};

fn screen() -> Snapshot {
    let header = SnapshotHeader {
        cols: 10,
        rows: 2,
        viewport_y: 0,
        cursor_x: 2,
        cursor_y: 0,
    };
    let row = vec![
        Cell::new('h').with_foreground(Color::Palette(2)),
        Cell::new('i').with_background(Color::rgb(0x10, 0x20, 0x30)),
    ];
    Snapshot::from_rows(header, vec![row]).expect("snapshot")
}

async fn snapshot_handler(Path(id): Path<String>, headers: HeaderMap) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match id.as_str() {
        "binary" => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            snapshot_wire::encode(&screen()),
        )
            .into_response(),
        "structured" => Json(json!({
            "cols": 10,
            "rows": 2,
            "cursorX": 2,
            "cells": [[
                {"char": "h", "fg": 2},
                {"char": "i", "bg": 0xFF10_2030u32}
            ]]
        }))
        .into_response(),
        "locked" if bearer != Some("Bearer good") => {
            (StatusCode::UNAUTHORIZED, "no").into_response()
        }
        "locked" => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            snapshot_wire::encode(&screen()),
        )
            .into_response(),
        "html" => ([(header::CONTENT_TYPE, "text/html")], "<p>hi</p>").into_response(),
        _ => (StatusCode::NOT_FOUND, "missing").into_response(),
    }
}

async fn refresh_handler(Json(body): Json<Value>) -> Response {
    match body.get("refresh_token").and_then(Value::as_str) {
        Some("valid") | Some("rotated") => Json(json!({
            "access_token": "fresh-access",
            "refresh_token": "rotated"
        }))
        .into_response(),
        Some("flaky") => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "try later"})),
        )
            .into_response(),
        _ => (StatusCode::UNAUTHORIZED, "revoked").into_response(),
    }
}

async fn spawn_server() -> Url {
    let router = Router::new()
        .route("/api/sessions/:id/snapshot", get(snapshot_handler))
        .route("/token/refresh", post(refresh_handler));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    Url::parse(&format!("http://{addr}/")).expect("base url")
}

#[test_timeout::tokio_timeout_test(30)]
async fn polling_decodes_binary_and_structured_bodies() {
    let base = spawn_server().await;
    let client = PollingClient::new(
        base,
        Arc::new(AuthManager::not_required()),
        Duration::from_secs(5),
    )
    .expect("client");

    let binary = client.fetch("binary").await.expect("binary snapshot");
    let structured = client.fetch("structured").await.expect("structured snapshot");
    assert_eq!(binary, screen());
    assert_eq!(structured, binary);

    assert!(matches!(
        client.fetch("html").await,
        Err(PollError::UnsupportedContentType(_))
    ));
    assert!(matches!(
        client.fetch("nope").await,
        Err(PollError::NotFound(id)) if id == "nope"
    ));
}

#[test_timeout::tokio_timeout_test(30)]
async fn polling_rejections_reach_the_auth_manager() {
    let base = spawn_server().await;
    let store = Arc::new(MemoryStore::with_secret("valid"));
    let refresher =
        Arc::new(HttpTokenRefresher::new(base.clone(), Duration::from_secs(5)).expect("refresher"));
    let auth = Arc::new(AuthManager::bearer(store.clone(), refresher));
    let client = PollingClient::new(base, auth.clone(), Duration::from_secs(5)).expect("client");

    // The gateway mints "fresh-access", which the snapshot route refuses.
    assert!(matches!(client.fetch("locked").await, Err(PollError::Unauthorized)));
    assert!(auth.is_authenticated());
    assert_eq!(store.load().expect("load").as_deref(), Some("rotated"));

    assert!(matches!(client.fetch("locked").await, Err(PollError::Unauthorized)));
    assert!(!auth.is_authenticated());
    assert!(matches!(
        client.fetch("binary").await,
        Err(PollError::Auth(AuthError::InvalidCredentials))
    ));

    auth.login("valid").expect("login");
    auth.install_token("good");
    assert_eq!(client.fetch("locked").await.expect("snapshot"), screen());
}

#[test_timeout::tokio_timeout_test(30)]
async fn token_refresh_maps_gateway_responses() {
    let base = spawn_server().await;
    let refresher = HttpTokenRefresher::new(base, Duration::from_secs(5)).expect("refresher");

    let refreshed = refresher.refresh("valid").await.expect("refresh");
    assert_eq!(refreshed.access_token, "fresh-access");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("rotated"));

    assert!(matches!(
        refresher.refresh("revoked").await,
        Err(AuthError::InvalidCredentials)
    ));
    match refresher.refresh("flaky").await {
        Err(AuthError::Gateway(message)) => assert!(message.contains("try later"), "{message}"),
        other => panic!("expected a gateway error, got {other:?}"),
    }
}
