//! API route definitions.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::state::AppState;
use crate::detect::{AlertQuery, AlertRecord, CycleReport};
use crate::error::{Error, Result};
use crate::ingest;
use crate::storage::{events, run_blocking};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_events))
        .route("/alerts", get(list_alerts))
        .route("/alerts/acknowledge", post(acknowledge_alert))
        .route("/detect", post(trigger_detection))
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>> {
    let pool = state.pool.clone();
    let stored_events = run_blocking(move || events::count_events(&pool)).await?;
    Ok(Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "events": stored_events,
            "detection_running": state.detector.is_processing(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    })))
}

/// The body is taken raw so malformed JSON gets the same `{error, details}`
/// shape as any other validation failure.
async fn ingest_events(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let batch: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::validation("request body is not valid JSON", vec![e.to_string()]))?;
    let inserted = ingest::ingest(&state.pool, &batch, state.config.server.max_batch).await?;

    if state.config.detection.detect_on_ingest {
        let detector = state.detector.clone();
        tokio::spawn(async move {
            match detector.run_cycle().await {
                Ok(report) if report.coalesced => debug!("ingest-triggered detection coalesced"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ingest-triggered detection failed"),
            }
        });
    }

    Ok(Json(json!({ "success": true, "inserted": inserted })))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Value>> {
    let store = state.store.clone();
    let (alerts, summary) = run_blocking(move || -> Result<_> {
        Ok((store.list(&query)?, store.summary()?))
    })
    .await?;
    Ok(Json(json!({ "alerts": alerts, "summary": summary })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest {
    alert_id: String,
    #[serde(default = "default_true")]
    acknowledged: bool,
}

fn default_true() -> bool {
    true
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AlertRecord>> {
    let req: AcknowledgeRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::validation("invalid acknowledge request", vec![e.to_string()]))?;
    let store = state.store.clone();
    let alert = run_blocking(move || store.acknowledge(&req.alert_id, req.acknowledged)).await?;
    Ok(Json(alert))
}

async fn trigger_detection(State(state): State<AppState>) -> Result<Json<CycleReport>> {
    let report = state.detector.run_cycle().await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    use crate::api::{router, state::AppState};
    use crate::config::PipelineConfig;
    use crate::detect::{AlertType, AnomalyDetector, Severity, StaticForecast};
    use crate::notify::LogNotifier;
    use crate::storage::{test_pool, Pool};

    use super::*;

    fn app_state(pool: &Pool, forecast: f64) -> AppState {
        let config = PipelineConfig::default();
        let detector = Arc::new(AnomalyDetector::new(
            pool.clone(),
            Arc::new(StaticForecast(forecast)),
            Arc::new(LogNotifier),
            config.detection.clone(),
        ));
        AppState::new(pool.clone(), detector, config)
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn events_body(n: usize) -> String {
        let now = Utc::now().to_rfc3339();
        let events: Vec<Value> = (0..n)
            .map(|i| {
                json!({
                    "event_type": "pageview",
                    "count": 1.0,
                    "timestamp": now,
                    "session_id": format!("s-{i}"),
                    "device": "Desktop",
                    "country": "US"
                })
            })
            .collect();
        Value::Array(events).to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, pool) = test_pool();
        let resp = router(app_state(&pool, 100.0))
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["events"], 0);
    }

    #[tokio::test]
    async fn test_ingest_accepts_batch() {
        let (_dir, pool) = test_pool();
        let resp = router(app_state(&pool, 100.0))
            .oneshot(post_json("/api/v1/events", events_body(3)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body, json!({ "success": true, "inserted": 3 }));
        assert_eq!(events::count_events(&pool).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_json() {
        let (_dir, pool) = test_pool();
        let resp = router(app_state(&pool, 100.0))
            .oneshot(post_json("/api/v1/events", "[{not json".into()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "request body is not valid JSON");
        assert_eq!(body["details"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_missing_field() {
        let (_dir, pool) = test_pool();
        let body = json!([{ "event_type": "click", "count": 1.0 }]).to_string();
        let resp = router(app_state(&pool, 100.0))
            .oneshot(post_json("/api/v1/events", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["details"][0].as_str().unwrap().starts_with("events[0]:"));
        assert_eq!(events::count_events(&pool).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_preflight_is_answered() {
        let (_dir, pool) = test_pool();
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/v1/events")
            .header(header::ORIGIN, "https://shop.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let resp = router(app_state(&pool, 100.0)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_detect_then_list_and_acknowledge() {
        let (_dir, pool) = test_pool();
        let app = router(app_state(&pool, 150.0));

        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/events", events_body(500)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/detect", String::new()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report = body_json(resp).await;
        assert_eq!(report["emitted"].as_array().unwrap().len(), 1);
        let id = report["emitted"][0].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/alerts?acknowledged=false&type=spike")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let alerts: Vec<AlertRecord> = serde_json::from_value(body["alerts"].clone()).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Spike);
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(body["summary"]["unacknowledged"], 1);

        let ack = json!({ "alertId": id, "acknowledged": true }).to_string();
        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/alerts/acknowledge", ack))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let record: AlertRecord = serde_json::from_value(body_json(resp).await).unwrap();
        assert!(record.acknowledged);
        assert!(record.acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_is_404() {
        let (_dir, pool) = test_pool();
        let ack = json!({ "alertId": "spike_nope_20250101_50" }).to_string();
        let resp = router(app_state(&pool, 100.0))
            .oneshot(post_json("/api/v1/alerts/acknowledge", ack))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_falls_back() {
        let (_dir, pool) = test_pool();
        let resp = router(app_state(&pool, 100.0))
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
