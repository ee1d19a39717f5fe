//! REST API server for meetbot.
//!
//! Provides HTTP endpoints for:
//! - Session inspection (list, get)
//! - Manual standup triggering

pub mod error;
pub mod routes;

use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tracing::info;

pub use routes::sessions::{ApiCommand, SessionsState};

pub struct ApiServer {
    port: u16,
    sessions_state: SessionsState,
}

impl ApiServer {
    pub fn new(port: u16, sessions_state: SessionsState) -> Self {
        Self {
            port,
            sessions_state,
        }
    }

    pub async fn start(self) -> Result<()> {
        let app = Router::new()
            // Root and version endpoints
            .route("/", get(status))
            .route("/version", get(version))
            // Session endpoints
            .merge(routes::sessions::router(self.sessions_state))
            .layer(ServiceBuilder::new());

        let listener = tokio::net::TcpListener::bind(&format!("127.0.0.1:{}", self.port)).await?;

        info!("API server listening on http://127.0.0.1:{}", self.port);
        info!("Endpoints:");
        info!("  GET  /              - Service info");
        info!("  GET  /version       - Get version info");
        info!("  GET  /sessions      - List sessions");
        info!("  GET  /sessions/:id  - Get single session");
        info!("  POST /trigger       - Trigger a standup now");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "meetbot",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "meetbot"
    }))
}
