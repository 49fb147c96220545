//! Pythia -- privacy-preserving telemetry with forecast-based anomaly alerts.
//!
//! Clients buffer events and add calibrated noise before sending them. The
//! server persists the noised batches, aggregates them per segment, compares
//! the totals to an external forecast, and raises deduplicated alerts.

pub mod api;
pub mod buffer;
pub mod config;
pub mod detect;
pub mod error;
pub mod event;
pub mod ingest;
pub mod notify;
pub mod privacy;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

pub use crate::error::Error;

use crate::config::PipelineConfig;
use crate::detect::{AnomalyDetector, ForecastSource, HttpForecastClient};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::storage::Pool;

/// The configured notifier: the webhook when a URL is set, the log otherwise.
pub fn build_notifier(config: &PipelineConfig) -> crate::error::Result<Arc<dyn Notifier>> {
    Ok(match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.notify.timeout_secs),
        )?),
        None => Arc::new(LogNotifier),
    })
}

/// Detector wired to the configured forecast service and notifier. Pass
/// `forecast` to replace the HTTP forecast client.
pub fn build_detector(
    pool: Pool,
    config: &PipelineConfig,
    forecast: Option<Arc<dyn ForecastSource>>,
) -> crate::error::Result<AnomalyDetector> {
    let forecast = match forecast {
        Some(f) => f,
        None => Arc::new(HttpForecastClient::new(
            config.detection.forecast_url.clone(),
            Duration::from_secs(config.detection.forecast_timeout_secs),
        )?),
    };
    Ok(AnomalyDetector::new(
        pool,
        forecast,
        build_notifier(config)?,
        config.detection.clone(),
    ))
}

/// Start the Pythia server: API, ingestion, and scheduled detection. Returns
/// once `shutdown` is cancelled and in-flight requests have finished.
pub async fn serve(config: PipelineConfig, shutdown: CancellationToken) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.server.db_path.clone();
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    // 2. Detection
    let schedule = scheduler::parse_schedule(&config.detection.schedule)?;
    let detector = Arc::new(build_detector(pool.clone(), &config, None)?);

    // 3. Start detection loop (background task)
    let loop_handle = tokio::spawn(scheduler::run_detection_loop(
        detector.clone(),
        schedule,
        shutdown.clone(),
    ));

    // 4. Start API Server
    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let app = api::router(api::state::AppState::new(pool, detector, config));

    tracing::info!(%addr, "Pythia listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    shutdown.cancel();
    loop_handle.await?;
    tracing::info!("Pythia stopped");
    Ok(())
}
