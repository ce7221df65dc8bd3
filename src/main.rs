use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{extract::State, routing::get, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use htpi_admin_relay::bus::NatsBus;
use htpi_admin_relay::config::SecurityConfig;
use htpi_admin_relay::relay::RelayState;
use htpi_admin_relay::{config, ws};

#[tokio::main]
async fn main() {
    // Load .env if present so cargo run picks up NATS_URL, NATS_PASSWORD, etc.
    let _ = dotenvy::dotenv();

    // Initialize configuration (this loads the config singleton)
    let config = config::config();

    tracing_subscriber::fmt::init();
    tracing::info!("Starting HTPI Admin Relay in {:?} mode", config.environment);

    // The bus is a hard dependency: no mock fallback, fail loudly
    let bus = NatsBus::connect(&config.bus.url, &config.bus.user, &config.bus.password)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to NATS at {}: {}", config.bus.url, e));

    let state = RelayState::new(Arc::new(bus));
    state
        .start()
        .await
        .unwrap_or_else(|e| panic!("failed to start inbound router: {}", e));

    let app = app(Arc::clone(&state));

    // Allow tests or deployments to override port via env
    let port = std::env::var("HTPI_RELAY_PORT")
        .ok()
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8080);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {}", bind_addr, e));

    tracing::info!("HTPI Admin Relay listening on http://{}", bind_addr);

    axum::serve(listener, app).await.expect("server");
}

fn app(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        // Global middleware
        .layer(cors_layer(&config::config().security))
        .layer(TraceLayer::new_for_http())
}

/// CORS policy from config: explicit origins when configured, permissive
/// when enabled without any, a no-op layer when disabled.
fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if !security.enable_cors {
        return CorsLayer::new();
    }

    let origins = parse_origins(&security.cors_origins);
    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Configured origins that parse as header values; garbage entries are
/// skipped rather than taking the server down.
fn parse_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect()
}

async fn root() -> axum::response::Json<Value> {
    let version = env!("CARGO_PKG_VERSION");

    axum::response::Json(json!({
        "success": true,
        "data": {
            "name": "HTPI Admin Relay",
            "version": version,
            "description": "Real-time admin gateway: authenticates sessions, relays UI actions to backend services over NATS",
            "endpoints": {
                "home": "/ (public)",
                "health": "/health (public)",
                "ws": "/ws (WebSocket - authenticate first frame, then {id, action, payload})",
            }
        }
    }))
}

async fn health(State(state): State<Arc<RelayState>>) -> impl axum::response::IntoResponse {
    let now = chrono::Utc::now();

    if state.bus.is_connected() {
        (
            axum::http::StatusCode::OK,
            axum::response::Json(json!({
                "success": true,
                "data": {
                    "status": "ok",
                    "timestamp": now,
                    "bus": "ok",
                    "sessions": state.registry.len(),
                    "pending_requests": state.table.len(),
                }
            })),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::response::Json(json!({
                "success": false,
                "error": "message bus unavailable",
                "data": {
                    "status": "degraded",
                    "timestamp": now,
                    "bus": "disconnected",
                }
            })),
        )
    }
}
