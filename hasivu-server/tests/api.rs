use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use hasivu_core::pipeline::Record;
use hasivu_server::{AppState, create_app, infra::config::Config};

fn test_state() -> AppState {
    let mut config = Config::default();
    config.orchestrator.queue.idle_poll_ms = 5;
    config.server.shutdown_timeout = std::time::Duration::from_secs(5);
    AppState::build(config).unwrap()
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn order(id: u64, total: f64) -> Record {
    let mut record = Record::new();
    record.insert("order_id".into(), json!(id));
    record.insert("total".into(), json!(total));
    record
}

#[tokio::test]
async fn health_is_unavailable_until_components_start() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = send(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["data"]["status"], "unhealthy");

    state.start().await.unwrap();
    let (status, body) = send(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["components"].as_array().unwrap().len(), 2);

    state.shutdown().await;
}

#[tokio::test]
async fn enqueue_merge_and_stats() {
    let state = test_state();
    let app = create_app(state.clone());

    let job = json!({
        "payload": {"order_id": 42},
        "priority": "high",
        "dedupe_key": "order-42",
    });
    let (status, body) = send(&app, "POST", "/api/v1/queues/orders/jobs", Some(job.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["accepted"], true);
    let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "POST", "/api/v1/queues/orders/jobs", Some(job)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], false);
    assert_eq!(body["data"]["merged_into"], job_id.as_str());

    let (status, body) = send(&app, "GET", "/api/v1/queues/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queues"]["orders"]["ready"], 1);
    assert_eq!(body["data"]["total_dead_letters"], 0);

    let (status, body) = send(&app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["priority"], "P1");

    let (status, _) = send(&app, "DELETE", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn queue_named_jobs_is_routable() {
    let app = create_app(test_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/queues/jobs/jobs",
        Some(json!({"payload": {"menu": "week-42"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queue"], "jobs");

    let (status, body) = send(&app, "GET", "/api/v1/queues/jobs/dead-letters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    let (status, body) = send(&app, "GET", "/api/v1/queues/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["school_load"].is_object());
}

#[tokio::test]
async fn oversized_delay_is_a_bad_request() {
    let app = create_app(test_state());

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/queues/orders/jobs",
        Some(json!({"payload": {}, "delay_ms": u64::MAX})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", "/api/v1/queues/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["queues"].get("orders").is_none());
}

#[tokio::test]
async fn malformed_identifiers_are_bad_requests() {
    let app = create_app(test_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/queues/bad!name/jobs",
        Some(json!({"payload": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["status"], 400);

    let (status, _) = send(&app, "POST", "/api/v1/dead-letters/not-a-uuid/replay", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/api/v1/runs/nope/cancel", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dead_letter_listing_and_purge() {
    let app = create_app(test_state());

    let (status, body) = send(&app, "GET", "/api/v1/queues/orders/dead-letters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    let (status, body) = send(&app, "DELETE", "/api/v1/queues/orders/dead-letters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["purged"], 0);

    let missing = uuid::Uuid::now_v7();
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/dead-letters/{missing}/replay"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pipeline_lifecycle_over_http() {
    let state = test_state();
    state
        .pipelines
        .connectors()
        .datasets()
        .insert("orders", vec![order(1, 12.5), order(2, 30.0), order(3, 7.25)]);
    let app = create_app(state.clone());

    let definition = json!({
        "id": "orders-copy",
        "name": "Copy orders",
        "source": {"type": "memory", "dataset": "orders"},
        "sink": {"type": "memory", "dataset": "orders_copy"},
        "batch_size": 2,
    });
    let (status, _) = send(&app, "POST", "/api/v1/pipelines", Some(definition.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "POST", "/api/v1/pipelines", Some(definition)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["status"], 409);

    let (status, body) = send(&app, "POST", "/api/v1/pipelines/orders-copy/runs?wait=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "succeeded");
    assert_eq!(body["data"]["metrics"]["loaded"], 3);
    assert_eq!(state.pipelines.connectors().datasets().len("orders_copy"), 3);

    let (status, body) = send(&app, "GET", "/api/v1/pipelines/orders-copy/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    let run_id = body["data"][0]["run_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/api/v1/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pipeline_id"], "orders-copy");

    let (status, body) = send(&app, "GET", "/api/v1/pipelines/orders-copy", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["last_status"], "succeeded");

    // A finished run leaves nothing to resume from.
    let (status, _) = send(&app, "GET", "/api/v1/pipelines/orders-copy/checkpoint", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", &format!("/api/v1/runs/{run_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", "/api/v1/pipelines/orders-copy", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/api/v1/pipelines/orders-copy", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_pipeline_definition_is_rejected() {
    let app = create_app(test_state());
    let definition = json!({
        "id": "broken",
        "name": "Broken schedule",
        "schedule": "every tuesday",
        "source": {"type": "memory", "dataset": "a"},
        "sink": {"type": "memory", "dataset": "b"},
    });
    let (status, _) = send(&app, "POST", "/api/v1/pipelines", Some(definition)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn integrations_sync_requires_connection() {
    let state = test_state();
    let app = create_app(state.clone());

    let (status, body) = send(&app, "GET", "/api/v1/integrations", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|component| component["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["queue", "pipelines"]);

    let (status, _) = send(&app, "POST", "/api/v1/integrations/queue/sync", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    state.start().await.unwrap();
    let (status, body) = send(&app, "POST", "/api/v1/integrations/queue/sync", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items_processed"], 0);

    let (status, body) = send(&app, "POST", "/api/v1/integrations/pipelines/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "connected");

    let (status, _) = send(&app, "POST", "/api/v1/integrations/unknown/restart", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    state.shutdown().await;
}

#[tokio::test]
async fn circuit_breaker_manual_overrides() {
    let state = test_state();
    state.breakers.get_or_create("webhook.orders");
    let app = create_app(state);

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/circuit-breakers/webhook.orders/open",
        Some(json!({"reason": "vendor maintenance"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "forced_open");

    let (_, body) = send(&app, "GET", "/api/v1/circuit-breakers", None).await;
    assert_eq!(body["data"]["total"], 1);

    let (status, body) = send(&app, "POST", "/api/v1/circuit-breakers/webhook.orders/close", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "closed");

    let (status, _) = send(&app, "POST", "/api/v1/circuit-breakers/missing/open", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn anomaly_detection_and_feedback() {
    let app = create_app(test_state());

    let mut samples: Vec<Value> = (0..19)
        .map(|i| {
            json!({
                "service": "kitchen-management",
                "metric": "order_processing_time",
                "value": 100.0 + (i % 3) as f64,
                "timestamp": format!("2026-03-02T12:00:{:02}Z", i),
            })
        })
        .collect();
    samples.push(json!({
        "service": "kitchen-management",
        "metric": "order_processing_time",
        "value": 500.0,
        "timestamp": "2026-03-02T12:00:00Z",
    }));

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/monitoring/anomalies",
        Some(json!({ "samples": samples })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let alerts = body["data"]["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["severity"], "critical");
    let alert_id = alerts[0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/monitoring/anomalies/{alert_id}/feedback"),
        Some(json!({"false_positive": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["true_positives"], 1);

    let unknown = uuid::Uuid::now_v7();
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/monitoring/anomalies/{unknown}/feedback"),
        Some(json!({"false_positive": true})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/monitoring/anomalies",
        Some(json!({ "samples": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn registered_baseline_drives_detection() {
    let app = create_app(test_state());

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/monitoring/baselines",
        Some(json!({
            "service": "database",
            "metric": "query_latency",
            "baseline": {"mean": 100.0, "std": 10.0},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = send(
        &app,
        "POST",
        "/api/v1/monitoring/anomalies",
        Some(json!({"samples": [
            {"service": "database", "metric": "query_latency", "value": 180.0,
             "timestamp": "2026-03-02T12:00:00Z"}
        ]})),
    )
    .await;
    let alerts = body["data"]["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["expected"], 100.0);
}

#[tokio::test]
async fn performance_report_flags_sla_violations() {
    let app = create_app(test_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/monitoring/report",
        Some(json!({
            "observations": {
                "hasivu_auth_availability": 0.98,
                "hasivu_auth_response_time_seconds": 0.3,
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let violations = body["data"]["sla_violations"].as_array().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0]["severity"], "critical");
    assert_eq!(body["data"]["summary"]["critical_violations"], 1);
}
