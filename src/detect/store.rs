//! Alert persistence.
//!
//! Inserts are idempotent by id: the store checks for an existing row before
//! writing instead of relying on a database conflict clause, so the same
//! contract holds for any append-only backend.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Row};
use serde::{Deserialize, Serialize};

use crate::detect::{AlertRecord, AlertType, Severity};
use crate::error::{Error, Result};
use crate::storage::{format_ts, parse_ts, Pool};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with this id already existed; nothing was written.
    Duplicate,
}

/// Filters for [`AlertStore::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
    pub acknowledged: Option<bool>,
    pub severity: Option<Severity>,
    #[serde(rename = "type")]
    pub alert_type: Option<AlertType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total: usize,
    pub unacknowledged: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct AlertStore {
    pool: Pool,
}

const COLUMNS: &str =
    "id, type, title, message, timestamp, severity, data_json, acknowledged, acknowledged_at, created_at";

fn storage_err(e: impl Into<anyhow::Error>) -> Error {
    Error::Storage(e.into())
}

type RawRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    bool,
    Option<String>,
    String,
);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_record(raw: RawRow) -> Result<AlertRecord> {
    let (id, kind, title, message, ts, severity, data, acknowledged, ack_at, created) = raw;
    Ok(AlertRecord {
        id,
        alert_type: kind
            .parse::<AlertType>()
            .map_err(|e: String| storage_err(anyhow::anyhow!(e)))?,
        title,
        message,
        timestamp: parse_ts(&ts)?,
        severity: severity
            .parse::<Severity>()
            .map_err(|e: String| storage_err(anyhow::anyhow!(e)))?,
        data: serde_json::from_str(&data).map_err(storage_err)?,
        acknowledged,
        acknowledged_at: ack_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created)?,
    })
}

impl AlertStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Insert unless an alert with the same id is already stored.
    pub fn insert_alert(&self, alert: &AlertRecord) -> Result<InsertOutcome> {
        if self.exists(&alert.id)? {
            return Ok(InsertOutcome::Duplicate);
        }
        let conn = self.pool.get()?;
        let data = serde_json::to_string(&alert.data).map_err(storage_err)?;
        conn.execute(
            "INSERT INTO alerts (id, type, title, message, timestamp, severity, data_json, acknowledged, acknowledged_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                alert.id,
                alert.alert_type.as_str(),
                alert.title,
                alert.message,
                format_ts(&alert.timestamp),
                alert.severity.as_str(),
                data,
                alert.acknowledged,
                alert.acknowledged_at.as_ref().map(format_ts),
                format_ts(&alert.created_at),
            ],
        )?;
        Ok(InsertOutcome::Inserted)
    }

    pub fn get(&self, id: &str) -> Result<Option<AlertRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM alerts WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], raw_row)?;
        let first = rows.next().transpose()?;
        first.map(into_record).transpose()
    }

    /// Set or clear the acknowledgment flag. `acknowledged_at` follows it.
    pub fn acknowledge(&self, id: &str, acknowledged: bool) -> Result<AlertRecord> {
        let ack_at = acknowledged.then(|| format_ts(&Utc::now()));
        let updated = {
            let conn = self.pool.get()?;
            conn.execute(
                "UPDATE alerts SET acknowledged = ?1, acknowledged_at = ?2 WHERE id = ?3",
                params![acknowledged, ack_at, id],
            )?
        };
        if updated == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        self.get(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Newest first, filtered.
    pub fn list(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>> {
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(ack) = query.acknowledged {
            args.push(SqlValue::Integer(ack as i64));
            clauses.push(format!("acknowledged = ?{}", args.len()));
        }
        if let Some(severity) = query.severity {
            args.push(SqlValue::Text(severity.as_str().to_string()));
            clauses.push(format!("severity = ?{}", args.len()));
        }
        if let Some(kind) = query.alert_type {
            args.push(SqlValue::Text(kind.as_str().to_string()));
            clauses.push(format!("type = ?{}", args.len()));
        }
        let limit = query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        args.push(SqlValue::Integer(limit as i64));

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM alerts {filter} ORDER BY created_at DESC, id LIMIT ?{}",
            args.len()
        );

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), raw_row)?;
        let mut alerts = Vec::new();
        for r in rows {
            alerts.push(into_record(r?)?);
        }
        Ok(alerts)
    }

    pub fn summary(&self) -> Result<AlertSummary> {
        let conn = self.pool.get()?;
        let mut summary = AlertSummary::default();

        let (total, unacked): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN acknowledged = 0 THEN 1 ELSE 0 END), 0) FROM alerts",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        summary.total = total as usize;
        summary.unacknowledged = unacked as usize;

        for (column, target) in [
            ("severity", &mut summary.by_severity),
            ("type", &mut summary.by_type),
        ] {
            let mut stmt =
                conn.prepare(&format!("SELECT {column}, COUNT(*) FROM alerts GROUP BY {column}"))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for r in rows {
                let (key, n) = r?;
                target.insert(key, n as usize);
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use chrono::Duration;
    use serde_json::json;

    fn alert(id: &str, kind: AlertType, severity: Severity, age_min: i64) -> AlertRecord {
        let ts = Utc::now() - Duration::minutes(age_min);
        AlertRecord {
            id: id.into(),
            alert_type: kind,
            title: format!("alert {id}"),
            message: "something moved".into(),
            timestamp: ts,
            severity,
            data: json!({ "segment": "Desktop:US" }),
            acknowledged: false,
            acknowledged_at: None,
            created_at: ts,
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (_dir, pool) = test_pool();
        let store = AlertStore::new(pool.clone());
        let a = alert("spike_x_1", AlertType::Spike, Severity::High, 0);

        assert_eq!(store.insert_alert(&a).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_alert(&a).unwrap(), InsertOutcome::Duplicate);

        let conn = pool.get().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_get_round_trips_record() {
        let (_dir, pool) = test_pool();
        let store = AlertStore::new(pool);
        let a = alert("drop_y_1", AlertType::Drop, Severity::Medium, 3);
        store.insert_alert(&a).unwrap();

        let got = store.get("drop_y_1").unwrap().unwrap();
        assert_eq!(got.alert_type, AlertType::Drop);
        assert_eq!(got.severity, Severity::Medium);
        assert_eq!(got.data["segment"], "Desktop:US");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_acknowledge_sets_and_clears() {
        let (_dir, pool) = test_pool();
        let store = AlertStore::new(pool);
        store
            .insert_alert(&alert("a1", AlertType::Spike, Severity::Low, 0))
            .unwrap();

        let acked = store.acknowledge("a1", true).unwrap();
        assert!(acked.acknowledged);
        assert!(acked.acknowledged_at.is_some());

        let unacked = store.acknowledge("a1", false).unwrap();
        assert!(!unacked.acknowledged);
        assert!(unacked.acknowledged_at.is_none());
    }

    #[test]
    fn test_acknowledge_unknown_is_not_found() {
        let (_dir, pool) = test_pool();
        let store = AlertStore::new(pool);
        let err = store.acknowledge("nope", true).unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "nope"));
    }

    #[test]
    fn test_list_filters_and_summary() {
        let (_dir, pool) = test_pool();
        let store = AlertStore::new(pool);
        store
            .insert_alert(&alert("a", AlertType::Spike, Severity::High, 30))
            .unwrap();
        store
            .insert_alert(&alert("b", AlertType::Drop, Severity::Low, 20))
            .unwrap();
        store
            .insert_alert(&alert("c", AlertType::Spike, Severity::Medium, 10))
            .unwrap();
        store.acknowledge("a", true).unwrap();

        let all = store.list(&AlertQuery::default()).unwrap();
        assert_eq!(
            all.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "b", "a"]
        );

        let spikes = store
            .list(&AlertQuery {
                alert_type: Some(AlertType::Spike),
                acknowledged: Some(false),
                ..AlertQuery::default()
            })
            .unwrap();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].id, "c");

        let limited = store
            .list(&AlertQuery {
                limit: Some(1),
                ..AlertQuery::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);

        let summary = store.summary().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.unacknowledged, 2);
        assert_eq!(summary.by_type["spike"], 2);
        assert_eq!(summary.by_severity["low"], 1);
    }
}
