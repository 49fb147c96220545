//! Persisted telemetry events.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{format_ts, parse_ts, Pool};
use crate::event::EventRecord;

/// Insert a validated batch in one transaction. Returns the number of rows.
pub fn insert_events(pool: &Pool, events: &[EventRecord]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO events (event_type, count, timestamp, session_id, device, country, page, attributes_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for e in events {
            stmt.execute(params![
                e.event_type,
                e.count,
                format_ts(&e.timestamp),
                e.session_id,
                e.device.map(|d| d.as_str()),
                e.country,
                e.page,
                serde_json::to_string(&e.attributes)?,
            ])?;
        }
    }
    tx.commit()?;
    Ok(events.len())
}

/// Events at or after `since`, newest first, at most `limit` rows.
pub fn fetch_since(pool: &Pool, since: DateTime<Utc>, limit: usize) -> Result<Vec<EventRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT event_type, count, timestamp, session_id, device, country, page, attributes_json
         FROM events
         WHERE timestamp >= ?1
         ORDER BY timestamp DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![format_ts(&since), limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut events = Vec::new();
    for r in rows {
        let (event_type, count, ts, session_id, device, country, page, attrs) = r?;
        events.push(EventRecord {
            event_type,
            count,
            timestamp: parse_ts(&ts)?,
            session_id,
            // Unrecognised device strings aggregate as "unknown".
            device: device.and_then(|d| d.parse().ok()),
            country,
            page,
            attributes: serde_json::from_str(&attrs).unwrap_or_default(),
        });
    }
    Ok(events)
}

pub fn count_events(pool: &Pool) -> Result<usize> {
    let conn = pool.get()?;
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Device;
    use crate::storage::test_pool;
    use chrono::Duration;
    use serde_json::Map;

    fn event(ts: DateTime<Utc>, device: Option<Device>) -> EventRecord {
        EventRecord {
            event_type: "pageview".into(),
            count: 1.2,
            timestamp: ts,
            session_id: "s-1".into(),
            device,
            country: "US".into(),
            page: Some("/".into()),
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_insert_and_fetch_window() {
        let (_dir, pool) = test_pool();
        let now = Utc::now();
        let batch = vec![
            event(now - Duration::days(10), Some(Device::Desktop)),
            event(now - Duration::days(2), Some(Device::Mobile)),
            event(now, None),
        ];
        assert_eq!(insert_events(&pool, &batch).unwrap(), 3);
        assert_eq!(count_events(&pool).unwrap(), 3);

        let recent = fetch_since(&pool, now - Duration::days(7), 1000).unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first
        assert!(recent[0].device.is_none());
        assert_eq!(recent[1].device, Some(Device::Mobile));
        assert_eq!(recent[1].page.as_deref(), Some("/"));
    }

    #[test]
    fn test_fetch_respects_limit() {
        let (_dir, pool) = test_pool();
        let now = Utc::now();
        let batch: Vec<_> = (0..20)
            .map(|i| event(now - Duration::minutes(i), Some(Device::Desktop)))
            .collect();
        insert_events(&pool, &batch).unwrap();

        let rows = fetch_since(&pool, now - Duration::days(1), 5).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows[0].timestamp >= rows[4].timestamp);
    }
}
