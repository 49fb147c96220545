//! Forecast baseline source.
//!
//! The forecasting service is an opaque oracle returning one expected daily
//! total plus a quality signal (MAPE).

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub forecast: f64,
    pub mape: f64,
    #[serde(deserialize_with = "de_timestamp")]
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub future: Vec<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Accepts RFC 3339 as well as zone-less ISO timestamps, read as UTC.
fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

impl Forecast {
    /// The service answers with a placeholder value when it had too little
    /// data to fit a model.
    pub fn is_fallback(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("status"))
            .and_then(Value::as_str)
            == Some("fallback_used")
    }
}

#[async_trait::async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self) -> Result<Forecast>;
}

/// Queries the forecasting service over HTTP with a bounded timeout.
pub struct HttpForecastClient {
    client: Client,
    url: String,
}

impl HttpForecastClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ForecastSource for HttpForecastClient {
    async fn fetch(&self) -> Result<Forecast> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::TransientIo(format!(
                "forecast service returned {status}"
            )));
        }
        let forecast: Forecast = response.json().await?;
        debug!(
            forecast = forecast.forecast,
            mape = forecast.mape,
            "forecast baseline fetched"
        );
        Ok(forecast)
    }
}

/// A fixed baseline, for offline runs and tests.
pub struct StaticForecast(pub f64);

#[async_trait::async_trait]
impl ForecastSource for StaticForecast {
    async fn fetch(&self) -> Result<Forecast> {
        Ok(Forecast {
            forecast: self.0,
            mape: 0.0,
            generated_at: Utc::now(),
            future: Vec::new(),
            metadata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_service_response() {
        let body = r#"{
            "forecast": 152.4,
            "mape": 12.5,
            "future": [{"ds": "2025-03-02", "yhat": 150.0}],
            "generatedAt": "2025-03-01T12:00:00Z",
            "metadata": {"algorithm": "prophet", "status": "success"}
        }"#;
        let f: Forecast = serde_json::from_str(body).unwrap();
        assert_eq!(f.forecast, 152.4);
        assert_eq!(f.future.len(), 1);
        assert!(!f.is_fallback());
    }

    #[test]
    fn test_minimal_response_and_fallback_flag() {
        let f: Forecast = serde_json::from_str(
            r#"{"forecast": 100.0, "mape": 25.0, "generatedAt": "2025-03-01T12:00:00Z",
                "metadata": {"status": "fallback_used"}}"#,
        )
        .unwrap();
        assert!(f.is_fallback());

        let f: Forecast = serde_json::from_str(
            r#"{"forecast": 1.0, "mape": 2.0, "generatedAt": "2025-03-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(f.metadata.is_none());
    }

    #[test]
    fn test_accepts_zoneless_timestamp() {
        let f: Forecast = serde_json::from_str(
            r#"{"forecast": 1.0, "mape": 2.0, "generatedAt": "2025-03-01T12:00:00.123456"}"#,
        )
        .unwrap();
        assert_eq!(f.generated_at.to_rfc3339(), "2025-03-01T12:00:00.123456+00:00");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // Port 9 (discard) on localhost is not expected to serve HTTP.
        let client =
            HttpForecastClient::new("http://127.0.0.1:9/forecast", Duration::from_millis(500))
                .unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(err.is_transient());
    }
}
