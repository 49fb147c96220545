use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::event::EventRecord;

const UNKNOWN: &str = "unknown";

/// `(day, device, country)` grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentKey {
    pub day: NaiveDate,
    pub device: String,
    pub country: String,
}

impl SegmentKey {
    /// Day-independent identity used for time-window deduplication.
    pub fn segment_id(&self) -> String {
        format!("{}:{}", self.device, self.country)
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} on {}", self.device, self.country, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentTotals {
    pub key: SegmentKey,
    /// Number of rows in the group.
    pub event_count: usize,
    /// Sum of noised counts. May be negative.
    pub total_count: f64,
}

impl SegmentTotals {
    /// Total suitable for display, floored at zero.
    pub fn display_total(&self) -> f64 {
        self.total_count.max(0.0)
    }
}

fn country_key(country: &str) -> String {
    let trimmed = country.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN) {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Group events by UTC day, device and country. Output is sorted by key.
pub fn aggregate_segments(events: &[EventRecord]) -> Vec<SegmentTotals> {
    let mut groups: BTreeMap<SegmentKey, (usize, f64)> = BTreeMap::new();
    for e in events {
        let key = SegmentKey {
            day: e.timestamp.date_naive(),
            device: e
                .device
                .map(|d| d.as_str().to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            country: country_key(&e.country),
        };
        let entry = groups.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += e.count;
    }

    groups
        .into_iter()
        .map(|(key, (event_count, total_count))| SegmentTotals {
            key,
            event_count,
            total_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Device;
    use chrono::{TimeZone, Utc};
    use serde_json::Map;

    fn ev(day: u32, hour: u32, device: Option<Device>, country: &str, count: f64) -> EventRecord {
        EventRecord {
            event_type: "pageview".into(),
            count,
            timestamp: Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap(),
            session_id: "s".into(),
            device,
            country: country.into(),
            page: None,
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_groups_by_day_device_country() {
        let events = vec![
            ev(1, 1, Some(Device::Desktop), "US", 1.5),
            ev(1, 23, Some(Device::Desktop), "US", 0.5),
            ev(2, 0, Some(Device::Desktop), "US", 1.0),
            ev(1, 5, Some(Device::Mobile), "US", 1.0),
        ];
        let segs = aggregate_segments(&events);
        assert_eq!(segs.len(), 3);

        let desktop_day1 = segs
            .iter()
            .find(|s| s.key.device == "Desktop" && s.key.day.to_string() == "2025-03-01")
            .unwrap();
        assert_eq!(desktop_day1.event_count, 2);
        assert!((desktop_day1.total_count - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_device_and_country_become_unknown() {
        let events = vec![
            ev(1, 1, None, "Unknown", 1.0),
            ev(1, 2, None, "", 1.0),
            ev(1, 3, None, "unknown", 1.0),
        ];
        let segs = aggregate_segments(&events);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].key.device, "unknown");
        assert_eq!(segs[0].key.country, "unknown");
        assert_eq!(segs[0].event_count, 3);
        assert_eq!(segs[0].key.segment_id(), "unknown:unknown");
    }

    #[test]
    fn test_negative_totals_floor_for_display() {
        let segs = aggregate_segments(&[
            ev(1, 1, Some(Device::Tablet), "FR", -2.0),
            ev(1, 2, Some(Device::Tablet), "FR", 0.5),
        ]);
        assert!((segs[0].total_count + 1.5).abs() < 1e-12);
        assert_eq!(segs[0].display_total(), 0.0);
    }
}
