use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::DetectionConfig;
use crate::detect::aggregate::{aggregate_segments, SegmentTotals};
use crate::detect::anomaly::{classify, Candidate};
use crate::detect::dedup::{alert_id, DedupWindow};
use crate::detect::forecast::{Forecast, ForecastSource};
use crate::detect::store::{AlertStore, InsertOutcome};
use crate::detect::{AlertRecord, AlertType};
use crate::error::Result;
use crate::notify::Notifier;
use crate::storage::{self, events, Pool};

/// What one detection cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Another cycle was already running; this trigger was dropped.
    pub coalesced: bool,
    /// The forecast was a placeholder and comparison was skipped.
    pub forecast_skipped: bool,
    pub events: usize,
    pub segments: usize,
    pub candidates: usize,
    pub suppressed: usize,
    pub duplicates: usize,
    pub emitted: Vec<String>,
    pub notify_failures: usize,
}

/// Clears the in-flight flag however the cycle exits.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fetch, aggregate, compare, dedup, persist, notify.
///
/// One instance holds the dedup map for its process. Run several detectors
/// against the same database and only the deterministic alert id prevents
/// duplicates; the time window is not shared.
pub struct AnomalyDetector {
    pool: Pool,
    store: AlertStore,
    forecast: Arc<dyn ForecastSource>,
    notifier: Arc<dyn Notifier>,
    config: DetectionConfig,
    dedup: Mutex<DedupWindow>,
    processing: AtomicBool,
}

impl AnomalyDetector {
    pub fn new(
        pool: Pool,
        forecast: Arc<dyn ForecastSource>,
        notifier: Arc<dyn Notifier>,
        config: DetectionConfig,
    ) -> Self {
        let store = AlertStore::new(pool.clone());
        let dedup = Mutex::new(DedupWindow::from_minutes(config.dedup_window_minutes));
        Self {
            pool,
            store,
            forecast,
            notifier,
            config,
            dedup,
            processing: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &AlertStore {
        &self.store
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`. Returns immediately with `coalesced` set if
    /// a cycle is already in flight.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        if self.processing.swap(true, Ordering::AcqRel) {
            debug!("detection cycle already running, dropping trigger");
            return Ok(CycleReport {
                coalesced: true,
                ..CycleReport::default()
            });
        }
        let _guard = ProcessingGuard(&self.processing);
        self.cycle(now).await
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        // Fetch
        let pool = self.pool.clone();
        let since = now - Duration::days(self.config.window_days);
        let limit = self.config.fetch_limit;
        let rows = storage::run_blocking(move || events::fetch_since(&pool, since, limit)).await?;
        report.events = rows.len();

        // Aggregate
        let segments = aggregate_segments(&rows);
        report.segments = segments.len();
        let Some(latest_day) = segments.iter().map(|s| s.key.day).max() else {
            debug!("no events in window, nothing to compare");
            return Ok(report);
        };

        // Compare
        let forecast = self.forecast.fetch().await?;
        if forecast.is_fallback() && self.config.skip_fallback_forecast {
            info!(
                forecast = forecast.forecast,
                "forecast service returned a fallback baseline, skipping comparison"
            );
            report.forecast_skipped = true;
            return Ok(report);
        }

        self.lock_dedup().prune(now);

        for segment in segments.iter().filter(|s| s.key.day == latest_day) {
            let Some(candidate) =
                classify(forecast.forecast, segment.total_count, self.config.threshold)
            else {
                continue;
            };
            report.candidates += 1;

            // Dedup
            let segment_id = segment.key.segment_id();
            if self.lock_dedup().is_suppressed(&segment_id, now) {
                debug!(segment = %segment.key, "alert suppressed by dedup window");
                report.suppressed += 1;
                continue;
            }

            let alert = build_alert(segment, &candidate, &forecast, now);
            let store = self.store.clone();
            let record = alert.clone();
            match storage::run_blocking(move || store.insert_alert(&record)).await? {
                InsertOutcome::Duplicate => {
                    debug!(alert_id = %alert.id, "alert already stored");
                    report.duplicates += 1;
                    self.lock_dedup().record(&segment_id, now);
                }
                InsertOutcome::Inserted => {
                    self.lock_dedup().record(&segment_id, now);
                    warn!(
                        alert_id = %alert.id,
                        severity = %alert.severity,
                        segment = %segment.key,
                        actual = segment.total_count,
                        forecast = forecast.forecast,
                        "anomaly detected"
                    );
                    if let Err(e) = self.notifier.notify(&alert).await {
                        warn!(alert_id = %alert.id, error = %e, "alert notification failed");
                        report.notify_failures += 1;
                    }
                    report.emitted.push(alert.id);
                }
            }
        }

        info!(
            events = report.events,
            segments = report.segments,
            candidates = report.candidates,
            emitted = report.emitted.len(),
            suppressed = report.suppressed,
            "detection cycle complete"
        );
        Ok(report)
    }

    fn lock_dedup(&self) -> std::sync::MutexGuard<'_, DedupWindow> {
        self.dedup.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn build_alert(
    segment: &SegmentTotals,
    candidate: &Candidate,
    forecast: &Forecast,
    now: DateTime<Utc>,
) -> AlertRecord {
    let key = &segment.key;
    let segment_id = key.segment_id();
    let pct = candidate.percentage.round();
    let (title, direction) = match candidate.alert_type {
        AlertType::Spike => (format!("Traffic spike: {} / {}", key.device, key.country), "above"),
        _ => (format!("Traffic drop: {} / {}", key.device, key.country), "below"),
    };
    let message = format!(
        "{} / {} recorded {:.0} events on {}, {pct:.0}% {direction} the forecast of {:.0}.",
        key.device,
        key.country,
        segment.display_total(),
        key.day,
        forecast.forecast
    );

    AlertRecord {
        id: alert_id(candidate.alert_type, &segment_id, key.day, candidate.percentage),
        alert_type: candidate.alert_type,
        title,
        message,
        timestamp: now,
        severity: candidate.severity,
        data: json!({
            "segment": segment_id,
            "day": key.day.to_string(),
            "device": key.device,
            "country": key.country,
            "actual": segment.total_count,
            "event_count": segment.event_count,
            "forecast": forecast.forecast,
            "drop": candidate.drop,
            "percentage": pct,
            "mape": forecast.mape,
            "forecast_generated_at": forecast.generated_at.to_rfc3339(),
        }),
        acknowledged: false,
        acknowledged_at: None,
        created_at: now,
    }
}
