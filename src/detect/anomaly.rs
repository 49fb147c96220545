use serde::Serialize;

use crate::detect::{AlertType, Severity};

/// A deviation large enough to alert on, before deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candidate {
    pub alert_type: AlertType,
    /// `(forecast - actual) / forecast`. Negative when actual exceeds forecast.
    pub drop: f64,
    /// `|drop| * 100`.
    pub percentage: f64,
    pub severity: Severity,
}

/// Relative shortfall against the forecast, or `None` when the forecast is
/// zero (or not a number) and no comparison is possible.
pub fn relative_drop(forecast: f64, actual: f64) -> Option<f64> {
    if forecast == 0.0 || !forecast.is_finite() || !actual.is_finite() {
        return None;
    }
    Some((forecast - actual) / forecast)
}

pub fn severity_for(percentage: f64) -> Severity {
    if percentage > 50.0 {
        Severity::High
    } else if percentage > 25.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Classify `actual` against `forecast`. Alerts only when `|drop|` is
/// strictly greater than `threshold`.
pub fn classify(forecast: f64, actual: f64, threshold: f64) -> Option<Candidate> {
    let drop = relative_drop(forecast, actual)?;
    if drop.abs() <= threshold {
        return None;
    }
    let alert_type = if drop < 0.0 {
        AlertType::Spike
    } else {
        AlertType::Drop
    };
    let percentage = drop.abs() * 100.0;
    Some(Candidate {
        alert_type,
        drop,
        percentage,
        severity: severity_for(percentage),
    })
}
