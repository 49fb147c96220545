//! Batch transmission to the ingestion endpoint.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::EventRecord;

/// How a noised batch leaves the client.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Transmit a batch. `Ok` only on confirmed acceptance.
    async fn send(&self, batch: &[EventRecord]) -> Result<()>;

    /// Last-chance transmission on teardown. Implementations should return
    /// as fast as possible; the caller may exit right after.
    async fn send_final(&self, batch: &[EventRecord]) -> Result<()> {
        self.send(batch).await
    }
}

/// Posts batches as a JSON array to the ingestion endpoint.
pub struct HttpTransport {
    client: Client,
    final_client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let final_client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            final_client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[EventRecord]) -> Result<()> {
        let response = self.client.post(&self.endpoint).json(batch).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        check_application_error(&body)?;
        debug!(events = batch.len(), %status, "batch accepted");
        Ok(())
    }

    async fn send_final(&self, batch: &[EventRecord]) -> Result<()> {
        // Status only; the body is not awaited.
        let response = self
            .final_client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, ""))
        }
    }
}

/// A 4xx means the batch itself was refused and resending it cannot help.
/// 408 and 429 are the exceptions: the server asked to be tried again.
fn status_error(status: StatusCode, body: &str) -> Error {
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if !status.is_client_error() || retryable {
        return Error::TransientIo(format!("ingestion endpoint returned {status}"));
    }

    let value = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let message = match value.get("error").and_then(Value::as_str) {
        Some(msg) => format!("ingestion endpoint rejected batch ({status}): {msg}"),
        None => format!("ingestion endpoint rejected batch ({status})"),
    };
    let details = value
        .get("details")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|d| d.as_str().map(str::to_string).unwrap_or_else(|| d.to_string()))
                .collect()
        })
        .unwrap_or_default();
    Error::validation(message, details)
}

/// A 2xx response can still carry `{"error": ...}`.
fn check_application_error(body: &str) -> Result<()> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Ok(());
    };
    match value.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(err) => Err(Error::TransientIo(format!(
            "ingestion endpoint reported error: {err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::{json, Map};

    async fn stub_endpoint(status: u16, body: Value) -> String {
        let app = Router::new().route(
            "/events",
            post(move || {
                let body = body.clone();
                async move { (HttpStatus::from_u16(status).unwrap(), Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/events")
    }

    fn batch() -> Vec<EventRecord> {
        vec![EventRecord {
            event_type: "pageview".into(),
            count: 1.2,
            timestamp: Utc::now(),
            session_id: "s-1".into(),
            device: None,
            country: "US".into(),
            page: None,
            attributes: Map::new(),
        }]
    }

    #[tokio::test]
    async fn test_bad_request_is_a_rejection() {
        let endpoint = stub_endpoint(
            400,
            json!({ "error": "invalid events in batch", "details": ["events[0]: bad count"] }),
        )
        .await;
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();

        let err = transport.send(&batch()).await.unwrap_err();
        assert!(!err.is_transient());
        match err {
            Error::Validation { message, details } => {
                assert!(message.contains("invalid events in batch"));
                assert_eq!(details, vec!["events[0]: bad count".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_errors_and_throttling_stay_transient() {
        for status in [500, 503, 429, 408] {
            let endpoint = stub_endpoint(status, json!({ "error": "busy" })).await;
            let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
            let err = transport.send(&batch()).await.unwrap_err();
            assert!(err.is_transient(), "status {status} should be retried");
        }
    }

    #[tokio::test]
    async fn test_accepted_batch() {
        let endpoint = stub_endpoint(200, json!({ "success": true, "inserted": 1 })).await;
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
        assert!(transport.send(&batch()).await.is_ok());
        assert!(transport.send_final(&batch()).await.is_ok());
    }

    #[test]
    fn test_application_error_detection() {
        assert!(check_application_error(r#"{"success":true,"inserted":3}"#).is_ok());
        assert!(check_application_error(r#"{"success":true,"error":null}"#).is_ok());
        assert!(check_application_error("").is_ok());
        assert!(check_application_error(r#"{"error":"db down","details":[]}"#).is_err());
    }
}
