//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{TEST_COOKIE, test_app, test_app_with_org};

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .body(Body::empty())
        .unwrap()
}

fn get_authed(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .header(header::COOKIE, TEST_COOKIE)
        .body(Body::empty())
        .unwrap()
}

fn post_authed(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(header::COOKIE, TEST_COOKIE)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = test_app().await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

/// Protected endpoints reject requests without a session cookie.
#[tokio::test]
async fn test_sessions_requires_auth() {
    let (app, _state) = test_app().await;

    let response = app.oneshot(get("/api/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// An authenticated user with no sessions gets an empty list.
#[tokio::test]
async fn test_sessions_empty_list() {
    let (app, _state) = test_app().await;

    let response = app.oneshot(get_authed("/api/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

/// Caddy validation answers 404 when the relay is not org-scoped.
#[tokio::test]
async fn test_caddy_validate_single_tenant() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(get("/api/caddy/validate?domain=acme.pizzapi.dev"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Caddy validation matches the org subdomain.
#[tokio::test]
async fn test_caddy_validate_org_domain() {
    let app = test_app_with_org("acme").await;

    let response = app
        .clone()
        .oneshot(get("/api/caddy/validate?domain=acme.pizzapi.dev"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/api/caddy/validate?domain=other.pizzapi.dev"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// VAPID key endpoint answers 404 until push is configured.
#[tokio::test]
async fn test_vapid_key_unconfigured() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(get("/api/push/vapid-public-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Subscribing twice upserts; unsubscribing removes the row.
#[tokio::test]
async fn test_push_subscribe_roundtrip() {
    let (app, state) = test_app().await;

    let subscribe = json!({
        "endpoint": "https://push.example/ep-1",
        "keys": {"p256dh": "key", "auth": "secret"},
    });
    let response = app
        .clone()
        .oneshot(post_authed("/api/push/subscribe", subscribe.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut update = subscribe.clone();
    update["enabledEvents"] = json!("agent_error");
    let response = app
        .clone()
        .oneshot(post_authed("/api/push/subscribe", update))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let subs = state.push.list_for_user("u-test").await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].enabled_events, "agent_error");

    let response = app
        .oneshot(post_authed(
            "/api/push/unsubscribe",
            json!({"endpoint": "https://push.example/ep-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.push.list_for_user("u-test").await.unwrap().is_empty());
}

/// Spawning on an unknown runner is a 404.
#[tokio::test]
async fn test_spawn_unknown_runner() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(post_authed(
            "/api/sessions/spawn",
            json!({"runnerId": "ghost", "cwd": "/work"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Spawning outside the runner's roots is forbidden.
#[tokio::test]
async fn test_spawn_outside_roots() {
    let (app, state) = test_app().await;

    state
        .store
        .put_runner(&pizzapi_relay::store::RunnerData {
            runner_id: "r-1".into(),
            user_id: "u-test".into(),
            user_name: "Test User".into(),
            name: None,
            roots: vec!["/home/test".into()],
            skills: Vec::new(),
        })
        .await;

    let response = app
        .clone()
        .oneshot(post_authed(
            "/api/sessions/spawn",
            json!({"runnerId": "r-1", "cwd": "/etc"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A permitted cwd creates the session and the pending link.
    let response = app
        .oneshot(post_authed(
            "/api/sessions/spawn",
            json!({"runnerId": "r-1", "cwd": "/home/test/app"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let session_id = json["sessionId"].as_str().unwrap();
    assert!(state.store.get_session(session_id).await.is_some());
    assert_eq!(
        state.store.take_pending_link(session_id).await.as_deref(),
        Some("r-1")
    );
}

/// Restart and shutdown land on the registered runner socket.
#[tokio::test]
async fn test_runner_restart_and_shutdown() {
    let (app, state) = test_app().await;

    // Unknown runner is a 404.
    let response = app
        .clone()
        .oneshot(post_authed("/api/runners/ghost/restart", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    state
        .store
        .put_runner(&pizzapi_relay::store::RunnerData {
            runner_id: "r-1".into(),
            user_id: "u-test".into(),
            user_name: "Test User".into(),
            name: None,
            roots: vec!["/home/test".into()],
            skills: Vec::new(),
        })
        .await;
    let (handle, mut commands) = pizzapi_relay::registry::SocketHandle::new();
    state.registry.set_runner("r-1", handle);

    let response = app
        .clone()
        .oneshot(post_authed("/api/runners/r-1/restart", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(commands.recv().await.unwrap(), r#"{"type":"restart"}"#);

    let response = app
        .oneshot(post_authed("/api/runners/r-1/shutdown", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(commands.recv().await.unwrap(), r#"{"type":"shutdown"}"#);
}

/// Killing an already-gone session is an idempotent no-op.
#[tokio::test]
async fn test_kill_unknown_session() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(post_authed("/api/sessions/nope/kill", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

/// Snapshot of an unknown session is a 404.
#[tokio::test]
async fn test_snapshot_not_found() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(get_authed("/api/sessions/nope/snapshot"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// A viewer upgrade from an untrusted Origin is rejected before cookies
/// are looked at.
#[tokio::test]
async fn test_viewer_cswsh_guard() {
    let state = common::test_state(None).await;
    let mut settings = (*state.settings).clone();
    settings.trusted_origins = vec!["https://app.pizzapi.dev".to_string()];

    let state = {
        let mut state = state;
        state.gate = std::sync::Arc::new(pizzapi_relay::auth::AuthGate::new(
            std::sync::Arc::new(
                pizzapi_relay::auth::StaticAuthProvider::new()
                    .with_cookie(TEST_COOKIE, common::test_identity()),
            ),
            None,
            settings.trusted_origins.clone(),
            settings.session_cookie.clone(),
        ));
        state.settings = std::sync::Arc::new(settings);
        state
    };
    let app = pizzapi_relay::api::create_router(state);

    let request = Request::builder()
        .uri("/viewer?sessionId=s-1")
        .method(Method::GET)
        .header(header::ORIGIN, "https://evil.example")
        .header(header::COOKIE, TEST_COOKIE)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Recent folders start empty and fill from spawns.
#[tokio::test]
async fn test_recent_folders() {
    let (app, state) = test_app().await;

    let response = app
        .clone()
        .oneshot(get_authed("/api/folders/recent"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!([]));

    state
        .archive
        .record_recent_folder("u-test", "/home/test/app")
        .await
        .unwrap();

    let response = app.oneshot(get_authed("/api/folders/recent")).await.unwrap();
    assert_eq!(body_json(response).await, json!(["/home/test/app"]));
}
