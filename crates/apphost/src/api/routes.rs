//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
///
/// Instance routes take `{repository}/{ref}`; a repository path containing `/`
/// is sent percent-encoded (`group%2Fapp`).
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/git", post(handlers::git_webhook))
        .route("/instances", get(handlers::list_instances))
        .route(
            "/instances/{repository}/{git_ref}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route(
            "/instances/{repository}/{git_ref}/logs",
            get(handlers::get_logs),
        )
        .route(
            "/instances/{repository}/{git_ref}/start",
            post(handlers::start_instance),
        )
        .route(
            "/instances/{repository}/{git_ref}/stop",
            post(handlers::stop_instance),
        )
        .route(
            "/instances/{repository}/{git_ref}/restart",
            post(handlers::restart_instance),
        )
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer.
///
/// Dev mode without configured origins allows any origin; production without
/// configured origins denies cross-origin requests.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let allowed_origins = state.auth.allowed_origins();
    let dev_mode = state.auth.is_dev_mode();

    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
    ];

    if allowed_origins.is_empty() {
        if dev_mode {
            tracing::warn!("CORS: No origins configured in dev mode, allowing any origin");
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods(methods)
                .allow_headers(headers)
        } else {
            tracing::warn!("CORS: No origins configured, denying cross-origin requests");
            CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
        }
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| {
                origin.parse::<HeaderValue>().ok().or_else(|| {
                    tracing::warn!("CORS: Invalid origin in config: {}", origin);
                    None
                })
            })
            .collect();

        if origins.is_empty() {
            tracing::error!("CORS: All configured origins are invalid!");
            CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
        } else {
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(methods)
                .allow_headers(headers)
                .allow_credentials(true)
        }
    }
}
