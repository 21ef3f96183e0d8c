//! Artifact delivery server
//!
//! A small public HTTP surface: health, OpenAPI documentation, and
//! token-addressed artifact downloads with byte-range support. Everything
//! else (job submission, cancellation, events) is library API; only
//! delivery needs to be reachable by download clients.

use crate::config::Config;
use crate::registry::ArtifactRegistry;
use crate::types::Event;
use crate::Result;
use axum::{http::HeaderValue, routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the delivery router
///
/// # Routes
///
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive documentation (if enabled)
/// - `GET /events` - Server-sent events stream
/// - `GET|HEAD /download/:token` - Fetch an artifact by token
pub fn create_router(
    registry: Arc<ArtifactRegistry>,
    config: Arc<Config>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
) -> Router {
    let state = AppState::new(registry, config.clone(), event_tx);

    let router = Router::new()
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        .route("/events", get(routes::event_stream))
        // axum's `get` also answers HEAD with the same handler
        .route("/download/:token", get(routes::download_artifact));

    let router = if config.api.swagger_ui {
        router.merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", ApiDoc::openapi()))
    } else {
        router
    };

    let router = router.with_state(state);

    if config.api.cors_enabled {
        router.layer(build_cors_layer(&config.api.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer from the configured origins
///
/// A list containing `"*"` (or an empty list) allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the delivery server on the configured bind address
///
/// Binds a TCP listener and serves the router until the process shuts
/// down or the server errors out.
pub async fn start_api_server(
    registry: Arc<ArtifactRegistry>,
    config: Arc<Config>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
) -> Result<()> {
    let bind_address = config.api.bind_address;

    let app = create_router(registry, config, event_tx);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(address = %bind_address, "delivery server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("delivery server stopped");
    Ok(())
}
