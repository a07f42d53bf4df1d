//! relaygate - Admission-gated SSRF-safe HTTP relay
//!
//! Fronts a developer-tools API with rate limiting, suspicion scoring,
//! temporary IP blacklisting, and an anonymous token handshake, and
//! exposes a single relay endpoint that forwards caller-specified
//! requests to vetted third-party origins.

mod config;
mod error;
mod gate;
mod models;
mod relay;
mod safety;
mod store;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    config::Config,
    relay::{health_handler, relay_handler, AppState},
};

/// Create the timeout layer (separate function to allow #[allow(deprecated)])
#[allow(deprecated)]
fn create_timeout_layer(timeout_secs: u64) -> tower_http::timeout::TimeoutLayer {
    tower_http::timeout::TimeoutLayer::new(Duration::from_secs(timeout_secs))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let config = Config::from_env();

    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        api_prefix = %config.api_prefix,
        max_concurrent = config.max_concurrent,
        fetch_timeout = config.fetch_timeout,
        max_request_body_size = config.max_request_body_size,
        max_response_body_size = config.max_response_body_size,
        rate_limit_default = config.rate_limit_default,
        relay_rate_limit = config.relay_rate_limit,
        "Starting relaygate"
    );

    let port = config.port;
    let server_timeout = config.server_timeout;

    // Create shared application state
    let state = AppState::new(config)?;

    // Note: Layers are applied bottom-up, so the last layer added is the outermost
    let app = app_router(state)
        // Request tracing
        .layer(TraceLayer::new_for_http())
        // Server-side request timeout (protects against slow clients)
        .layer(create_timeout_layer(server_timeout));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "Server listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Assemble the application routes. The relay route is derived from the
/// configured API prefix so it always sits behind the admission gate.
fn app_router(state: AppState) -> Router {
    let prefix = state.config.api_prefix.trim_end_matches('/').to_string();
    let proxy_path = format!("{prefix}/proxy");
    let max_request_body_size = state.config.max_request_body_size;
    Router::new()
        .route("/health", get(health_handler))
        .route(&proxy_path, post(relay_handler))
        // Admission gate runs before any handler under the API prefix
        .layer(middleware::from_fn_with_state(state.clone(), gate::admission))
        .with_state(state)
        // Limit request body size (protects against large payload attacks)
        .layer(DefaultBodyLimit::max(max_request_body_size))
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state_with(mutate: impl FnOnce(&mut Config)) -> AppState {
        let mut config = Config::from_env();
        config.required_headers = Vec::new();
        mutate(&mut config);
        AppState::new(config).unwrap()
    }

    async fn post_json(
        app: Router,
        uri: &str,
        headers: &[(&str, &str)],
        body: String,
    ) -> (StatusCode, Value) {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = app
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_relay_route_follows_api_prefix() {
        let app = app_router(state_with(|c| c.api_prefix = "/v2".to_string()));

        // The relay sits behind the gate at the configured prefix:
        // gated (401 handshake), not unrouted
        let (status, body) = post_json(app.clone(), "/v2/proxy", &[], "{}".to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["token"].as_str().is_some());

        // The old prefix is neither routed nor gated
        let (status, _) = post_json(app, "/api/proxy", &[], "{}".to_string()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_body_gets_json_envelope() {
        let app = app_router(state_with(|c| c.max_request_body_size = 64));
        let ip = ("x-forwarded-for", "203.0.113.40");

        let (status, body) = post_json(app.clone(), "/api/proxy", &[ip], "{}".to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let token = body["token"].as_str().unwrap().to_string();

        let huge = format!(
            r#"{{"url":"https://example.com","method":"POST","body":"{}"}}"#,
            "x".repeat(256)
        );
        let (status, body) = post_json(
            app,
            "/api/proxy",
            &[ip, ("x-client-token", &token)],
            huge,
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
        assert!(body["error"].as_str().is_some());
    }
}
