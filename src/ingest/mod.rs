//! Ingestion boundary: validate incoming batches and persist them.
//!
//! A batch is accepted or rejected as a whole. Rejected events are reported
//! back with per-event details and never written.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::EventRecord;
use crate::storage::{self, events, Pool};

/// Parse and check a batch. The body must be a non-empty JSON array of at
/// most `max_batch` event objects.
pub fn validate_batch(body: &Value, max_batch: usize) -> Result<Vec<EventRecord>> {
    let Some(items) = body.as_array() else {
        return Err(Error::validation(
            "request body must be a JSON array of events",
            vec![format!("got {}", json_kind(body))],
        ));
    };
    if items.is_empty() {
        return Err(Error::validation("batch is empty", Vec::new()));
    }
    if items.len() > max_batch {
        return Err(Error::validation(
            "batch too large",
            vec![format!("{} events, limit is {max_batch}", items.len())],
        ));
    }

    let mut accepted = Vec::with_capacity(items.len());
    let mut details = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match serde_json::from_value::<EventRecord>(item.clone()) {
            Ok(event) => {
                let problems = check_event(&event);
                if problems.is_empty() {
                    accepted.push(event);
                } else {
                    details.extend(problems.into_iter().map(|p| format!("events[{i}]: {p}")));
                }
            }
            Err(e) => details.push(format!("events[{i}]: {e}")),
        }
    }

    if !details.is_empty() {
        debug!(rejected = details.len(), "batch failed validation");
        return Err(Error::validation("invalid events in batch", details));
    }
    Ok(accepted)
}

fn check_event(event: &EventRecord) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if event.event_type.trim().is_empty() {
        problems.push("event_type must not be empty");
    }
    if event.session_id.trim().is_empty() {
        problems.push("session_id must not be empty");
    }
    if !event.count.is_finite() {
        problems.push("count must be a finite number");
    }
    problems
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validate then store a batch in one transaction. Returns the number of
/// rows inserted.
pub async fn ingest(pool: &Pool, body: &Value, max_batch: usize) -> Result<usize> {
    let batch = validate_batch(body, max_batch)?;
    let pool = pool.clone();
    let inserted = storage::run_blocking(move || events::insert_events(&pool, &batch)).await?;
    info!(inserted, "event batch ingested");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use serde_json::json;

    fn event(session: &str) -> Value {
        json!({
            "event_type": "pageview",
            "count": 0.73,
            "timestamp": "2025-03-01T10:00:00Z",
            "session_id": session,
            "device": "Desktop",
            "country": "US"
        })
    }

    #[test]
    fn test_accepts_well_formed_batch() {
        let batch = json!([event("a"), event("b")]);
        let events = validate_batch(&batch, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].session_id, "b");
    }

    #[test]
    fn test_rejects_non_array_and_empty() {
        let err = validate_batch(&json!({"events": []}), 10).unwrap_err();
        assert!(matches!(err, Error::Validation { ref details, .. } if details[0] == "got an object"));
        assert!(matches!(
            validate_batch(&json!([]), 10).unwrap_err(),
            Error::Validation { .. }
        ));
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let batch = Value::Array((0..4).map(|_| event("a")).collect());
        assert!(validate_batch(&batch, 3).is_err());
        assert!(validate_batch(&batch, 4).is_ok());
    }

    #[test]
    fn test_details_name_each_bad_event() {
        let mut missing = event("a");
        missing.as_object_mut().unwrap().remove("session_id");
        let blank = event(" ");
        let batch = json!([event("ok"), missing, blank]);

        match validate_batch(&batch, 10).unwrap_err() {
            Error::Validation { details, .. } => {
                assert_eq!(details.len(), 2);
                assert!(details[0].starts_with("events[1]:"));
                assert!(details[0].contains("session_id"));
                assert_eq!(details[1], "events[2]: session_id must not be empty");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_batch_writes_nothing() {
        let (_dir, pool) = test_pool();
        let batch = json!([event("ok"), {"event_type": "click"}]);
        assert!(ingest(&pool, &batch, 10).await.is_err());
        assert_eq!(events::count_events(&pool).unwrap(), 0);

        let inserted = ingest(&pool, &json!([event("ok")]), 10).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(events::count_events(&pool).unwrap(), 1);
    }
}
