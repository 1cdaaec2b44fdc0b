//! HTTP interface: an Axum JSON API over the trade engine.
//!
//! Caller identity travels in the request body; authenticating it is the
//! job of whatever sits in front of this server. CORS is open for local
//! development.

pub mod routes;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::AppState;

/// Start the API server in a background task.
pub fn spawn_api(engine: AppState, port: u16) -> JoinHandle<()> {
    let app = build_router(engine);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "API server starting on http://localhost:{port}");

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "Failed to bind API port");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    })
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(engine: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/listings", post(routes::create_listing))
        .route("/api/trades", get(routes::list_trades))
        .route("/api/trades/:id", get(routes::get_trade))
        .route("/api/trades/:id/buyer-deposit", post(routes::buyer_deposit))
        .route("/api/trades/:id/seller-deposit", post(routes::seller_deposit))
        .route("/api/trades/:id/release", post(routes::mark_item_released))
        .route("/api/trades/:id/confirm", post(routes::confirm_delivery))
        .route("/api/trades/:id/refund-timeout", post(routes::refund_timeout))
        .route("/api/trades/:id/emergency-withdraw", post(routes::emergency_withdraw))
        .route("/api/trades/:id/archive", post(routes::archive))
        .route("/api/events", get(routes::get_events))
        .layer(cors)
        .with_state(engine)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
