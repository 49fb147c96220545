//! Alert deduplication.
//!
//! Two layers cooperate:
//!
//! * [`DedupWindow`] is the primary suppression rule: once a segment has
//!   alerted, further detections for it are dropped until the window has
//!   elapsed, whatever their magnitude.
//! * [`alert_id`] gives every candidate a deterministic id so the persistent
//!   store can refuse exact repeats. This is the only guarantee that holds
//!   across processes; the window map is local to one detector instance.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::detect::AlertType;

#[derive(Debug, Clone)]
pub struct DedupWindow {
    window: Duration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_alert: HashMap::new(),
        }
    }

    pub fn from_minutes(minutes: i64) -> Self {
        Self::new(Duration::minutes(minutes))
    }

    /// Whether `segment` alerted less than one window before `now`.
    pub fn is_suppressed(&self, segment: &str, now: DateTime<Utc>) -> bool {
        self.last_alert
            .get(segment)
            .is_some_and(|last| now - *last < self.window)
    }

    pub fn record(&mut self, segment: &str, now: DateTime<Utc>) {
        self.last_alert.insert(segment.to_string(), now);
    }

    /// Forget segments whose window has passed.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.last_alert.retain(|_, last| now - *last < window);
    }

    pub fn len(&self) -> usize {
        self.last_alert.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_alert.is_empty()
    }
}

fn slug(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Deterministic id from type, segment, day and percentage rounded to a
/// whole number.
pub fn alert_id(alert_type: AlertType, segment: &str, day: NaiveDate, percentage: f64) -> String {
    format!(
        "{}_{}_{}_{}",
        alert_type.as_str(),
        slug(segment),
        day.format("%Y%m%d"),
        percentage.round() as i64
    )
}
