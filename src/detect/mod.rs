//! Segment aggregation, anomaly classification, deduplication, and alert
//! persistence.

pub mod aggregate;
pub mod anomaly;
pub mod dedup;
pub mod engine;
pub mod forecast;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::aggregate::{aggregate_segments, SegmentKey, SegmentTotals};
pub use self::anomaly::{classify, Candidate};
pub use self::dedup::{alert_id, DedupWindow};
pub use self::engine::{AnomalyDetector, CycleReport};
pub use self::forecast::{Forecast, ForecastSource, HttpForecastClient, StaticForecast};
pub use self::store::{AlertQuery, AlertStore, AlertSummary, InsertOutcome};

/// Kind of alert raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Spike,
    Drop,
    Anomaly,
    Info,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Spike => "spike",
            AlertType::Drop => "drop",
            AlertType::Anomaly => "anomaly",
            AlertType::Info => "info",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spike" => Ok(AlertType::Spike),
            "drop" => Ok(AlertType::Drop),
            "anomaly" => Ok(AlertType::Anomaly),
            "info" => Ok(AlertType::Info),
            other => Err(format!("unknown alert type '{other}'")),
        }
    }
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A persisted alert. Only acknowledgment mutates it after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub data: serde_json::Value,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
