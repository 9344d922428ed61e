use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{pods, replicasets, services};

/// The REST surface: a thin mapping of verbs onto store operations. No
/// controller logic lives here; controllers observe the writes and
/// converge asynchronously.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/v1/namespaces/{ns}/pods",
            get(pods::list_pods).post(pods::create_pod),
        )
        .route(
            "/api/v1/namespaces/{ns}/pods/{name}",
            get(pods::get_pod)
                .put(pods::replace_pod)
                .delete(pods::delete_pod),
        )
        .route(
            "/api/v1/namespaces/{ns}/services",
            get(services::list_services).post(services::create_service),
        )
        .route(
            "/api/v1/namespaces/{ns}/services/{name}",
            get(services::get_service)
                .put(services::replace_service)
                .delete(services::delete_service),
        )
        .route(
            "/api/apps/v1/namespaces/{ns}/replicasets",
            get(replicasets::list_replicasets).post(replicasets::create_replicaset),
        )
        .route(
            "/api/apps/v1/namespaces/{ns}/replicasets/{name}",
            get(replicasets::get_replicaset)
                .put(replicasets::replace_replicaset)
                .delete(replicasets::delete_replicaset),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
