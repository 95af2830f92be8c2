//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use k2m_core::consumer::ConsumerState;
use k2m_core::health::{ComponentStatus, HaltedPartition, HealthCheck, HealthStatus};
use k2m_core::metrics::ConsumerMetrics;
use k2m_core::shutdown::Shutdown;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<ConsumerMetrics>,
    pub consumer: watch::Receiver<ConsumerState>,
}

/// Body of `/health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub consumer: ConsumerReport,
    pub components: BTreeMap<String, ComponentReport>,
}

#[derive(Debug, Serialize)]
pub struct ConsumerReport {
    pub state: &'static str,
    pub consuming: bool,
    pub assigned_partitions: i64,
    pub halted_partitions: Vec<HaltedReport>,
}

#[derive(Debug, Serialize)]
pub struct HaltedReport {
    pub partition: String,
    pub offset: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ComponentReport {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentReport {
    fn from(status: &ComponentStatus) -> Self {
        let (status, message) = match status {
            ComponentStatus::Healthy => ("healthy", None),
            ComponentStatus::Degraded(msg) => ("degraded", Some(msg.clone())),
            ComponentStatus::Unhealthy(msg) => ("unhealthy", Some(msg.clone())),
            ComponentStatus::Unknown => ("unknown", None),
        };
        Self { status, message }
    }
}

impl From<HaltedPartition> for HaltedReport {
    fn from(halted: HaltedPartition) -> Self {
        Self {
            partition: halted.tp.to_string(),
            offset: halted.offset,
            reason: halted.reason,
        }
    }
}

impl ServerState {
    fn consumer_state(&self) -> ConsumerState {
        *self.consumer.borrow()
    }

    /// Alive until the consumer closed or a component failed.
    fn is_alive(&self) -> bool {
        self.consumer_state() != ConsumerState::Closed
            && self.health.overall_status() != HealthStatus::Unhealthy
    }

    /// Ready once partitions can be consumed.
    fn is_ready(&self) -> bool {
        let member = matches!(
            self.consumer_state(),
            ConsumerState::Assigned | ConsumerState::Polling | ConsumerState::Rebalancing
        );
        member && self.health.is_ready()
    }

    fn report(&self) -> HealthReport {
        let status = match self.health.overall_status() {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };

        HealthReport {
            status,
            consumer: ConsumerReport {
                state: self.consumer_state().as_str(),
                consuming: self.health.is_consuming(),
                assigned_partitions: self.metrics.partitions_assigned(),
                halted_partitions: self
                    .health
                    .halted_partitions()
                    .into_iter()
                    .map(HaltedReport::from)
                    .collect(),
            },
            components: self
                .health
                .get_all_statuses()
                .iter()
                .map(|(name, status)| (name.clone(), ComponentReport::from(status)))
                .collect(),
        }
    }
}

/// Serve `/health`, `/healthz` and `/readyz` on `health_port` and `/metrics`
/// on `metrics_port` until `shutdown` fires.
pub async fn start_server(
    state: Arc<ServerState>,
    health_port: u16,
    metrics_port: u16,
    shutdown: Shutdown,
) {
    let health_router = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(Arc::clone(&state));
    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    tokio::join!(
        serve("health", health_port, health_router, shutdown.clone()),
        serve("metrics", metrics_port, metrics_router, shutdown),
    );
    info!("HTTP servers stopped");
}

async fn serve(name: &'static str, port: u16, router: Router, shutdown: Shutdown) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(server = name, port = port, error = %e, "Failed to bind server");
            return;
        }
    };
    info!(server = name, port = port, "Server started");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!(server = name, error = %e, "Server error");
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let report = state.report();
    let code = if state.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus_text(),
    )
}
