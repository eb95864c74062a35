use std::future::ready;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::health::{HealthRegistry, HealthStatus};

#[derive(Clone)]
pub struct AppState {
    pub liveness: HealthRegistry,
    pub shutdown: CancellationToken,
}

async fn index() -> &'static str {
    "lifecycle manager"
}

/// 503 once shutdown has begun.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    ready(state.liveness.get_status()).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .with_state(state)
}

/// Add the prometheus endpoint to a router.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route("/metrics", get(move || ready(recorder_handle.render()))))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Bind the probe listener. Done before anything else starts so a taken port
/// fails startup.
pub async fn bind(addr: &str) -> Result<TcpListener, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("probe server listening on {}", addr);
    Ok(listener)
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
