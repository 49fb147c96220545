//! Periodic detection driven by a cron expression.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detect::AnomalyDetector;
use crate::error::{Error, Result};

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| Error::Config(format!("invalid cron expression '{expr}': {e}")))
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run a detection cycle at every tick of `schedule` until `shutdown` fires.
///
/// A tick that lands while a cycle triggered elsewhere (for example by
/// ingestion) is still running is coalesced by the detector.
pub async fn run_detection_loop(
    detector: Arc<AnomalyDetector>,
    schedule: Schedule,
    shutdown: CancellationToken,
) {
    info!("Detection scheduler started");

    loop {
        let now = Utc::now();
        let Some(next) = next_fire(&schedule, now) else {
            warn!("Cron schedule has no upcoming runs, stopping detection scheduler");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(next = %next.to_rfc3339(), "Next detection cycle scheduled");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Detection scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match detector.run_cycle().await {
            Ok(report) if report.coalesced => {
                debug!("Scheduled detection coalesced with running cycle");
            }
            Ok(report) => {
                info!(emitted = report.emitted.len(), "Scheduled detection finished");
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Scheduled detection failed, will retry next tick");
            }
            Err(e) => {
                error!(error = %e, "Scheduled detection failed");
            }
        }
    }
}
