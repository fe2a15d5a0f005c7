//! Status endpoint: the manager's view of every network.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use dovesnap::ManagerHandle;
use dovesnap::driver::TopologySnapshot;
use dovesnap_common::DovesnapResult;

use super::ApiError;

async fn root() -> Json<Value> {
    Json(json!({ "message": "dovesnapd running" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn networks(State(handle): State<ManagerHandle>) -> Result<Json<TopologySnapshot>, ApiError> {
    Ok(Json(handle.query().await?))
}

/// The status router.
pub fn router(handle: ManagerHandle) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/version", get(version))
        .route("/networks", get(networks))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the status API on all addresses at `port`.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(port: u16, handle: ManagerHandle) -> DovesnapResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Status API listening");
    axum::serve(listener, router(handle)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_reports_package_version() {
        let Json(value) = version().await;
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
        let Json(value) = root().await;
        assert_eq!(value["message"], "dovesnapd running");
    }
}
