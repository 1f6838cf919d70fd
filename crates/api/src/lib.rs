//! CO2 Monitor API Server
//!
//! REST API for ingesting CO2 sensor readings and querying sensor status,
//! alert episodes and 30-day metrics.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod error;
mod routes;

pub use config::{LogFormat, ServerConfig};
pub use error::ApiError;

use alerting::SensorService;
use storage::{Repository, SensorStore, SqliteRepository};

/// Application state shared across handlers
pub struct AppState {
    /// Ingestion and query service
    pub service: SensorService,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: std::time::Instant,
    /// Prometheus exporter, when enabled
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new application state
    pub fn new(service: SensorService) -> Self {
        Self {
            service,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
            prometheus: None,
        }
    }

    /// Attach a Prometheus handle to serve `/metrics`
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub storage: String,
    pub locked_sensors: usize,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(prometheus_handler))
        .route("/v1/sensors/:sensor_id", get(routes::sensors::get_status))
        .route(
            "/v1/sensors/:sensor_id/measurements",
            post(routes::sensors::post_measurement),
        )
        .route("/v1/sensors/:sensor_id/metrics", get(routes::sensors::get_metrics))
        .route("/v1/sensors/:sensor_id/alerts", get(routes::alerts::get_alerts))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let response = HealthResponse {
        status: "healthy".to_string(),
        timestamp,
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        storage: state.service.store().backend().to_string(),
        locked_sensors: state.service.manager().locked_sensors(),
    };

    Json(response)
}

/// Prometheus text exposition
async fn prometheus_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Initialize logging
pub fn init_logging(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match config.log_format {
        LogFormat::Json => builder.json().try_init()?,
        LogFormat::Pretty => builder.try_init()?,
    }

    Ok(())
}

/// Open the configured store
pub async fn open_store(
    config: &ServerConfig,
) -> Result<Arc<dyn SensorStore>, storage::StorageError> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(SqliteRepository::connect(url).await?)),
        None => Ok(Arc::new(Repository::new())),
    }
}

/// Run the server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = open_store(&config).await?;
    let mut state = AppState::new(SensorService::new(store));

    if config.prometheus {
        let handle = PrometheusBuilder::new().install_recorder()?;
        state = state.with_prometheus(handle);
        info!("Prometheus exporter enabled at /metrics");
    }

    let app = create_router(Arc::new(state));

    info!("Starting API server on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
