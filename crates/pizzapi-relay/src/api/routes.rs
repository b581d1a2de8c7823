//! Route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::org_middleware;
use crate::ns;

use super::handlers;
use super::state::AppState;

/// Assemble the application router: socket namespaces, the public surface,
/// and the cookie-gated REST routes.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    // Socket namespaces authenticate inside their own handshakes.
    let namespaces = Router::new()
        .route("/runner", get(ns::runner::runner_handler))
        .route("/relay", get(ns::relay::relay_handler))
        .route("/viewer", get(ns::viewer::viewer_handler))
        .route("/terminal", get(ns::terminal::terminal_handler))
        .route("/hub", get(ns::hub::hub_handler));

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/caddy/validate", get(handlers::caddy_validate))
        .route("/api/push/vapid-public-key", get(handlers::vapid_public_key));

    let mut protected = Router::new()
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/spawn", post(handlers::spawn_session))
        .route(
            "/api/sessions/{session_id}/snapshot",
            get(handlers::session_snapshot),
        )
        .route(
            "/api/sessions/{session_id}/kill",
            post(handlers::kill_session),
        )
        .route(
            "/api/sessions/{session_id}/attachments",
            post(handlers::upload_attachment),
        )
        .route(
            "/api/attachments/{attachment_id}",
            get(handlers::get_attachment),
        )
        .route(
            "/api/runners/{runner_id}/restart",
            post(handlers::restart_runner),
        )
        .route(
            "/api/runners/{runner_id}/shutdown",
            post(handlers::shutdown_runner),
        )
        .route("/api/folders/recent", get(handlers::recent_folders))
        .route("/api/push/subscribe", post(handlers::push_subscribe))
        .route("/api/push/unsubscribe", post(handlers::push_unsubscribe))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::identity_middleware,
        ));

    // Multi-tenant deployments additionally require the org session token.
    if state.gate.is_multi_tenant() {
        protected = protected.layer(middleware::from_fn_with_state(
            state.gate.clone(),
            org_middleware,
        ));
    }

    let body_limit = axum::extract::DefaultBodyLimit::max(
        state.settings.attachment_max_bytes as usize + 64 * 1024,
    );

    Router::new()
        .merge(namespaces)
        .merge(public)
        .merge(protected)
        .layer(body_limit)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

fn build_cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .settings
        .trusted_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
