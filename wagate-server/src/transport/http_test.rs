use super::AppState;
use super::http::router;
use crate::actor::LimiterActor;
use crate::client::{ApiError, ApiRequest, ApiTransport, WhatsAppClient};
use crate::config::{SchedulerConfig, WhatsAppConfig};
use crate::events::{EventBus, EventKind, Topic};
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

struct FixedTransport {
    response: Result<Value, (u16, &'static str)>,
}

#[async_trait]
impl ApiTransport for FixedTransport {
    async fn call(&self, _request: &ApiRequest) -> Result<Value, ApiError> {
        match &self.response {
            Ok(value) => Ok(value.clone()),
            Err((status, body)) => Err(ApiError::Status {
                status: *status,
                body: body.to_string(),
            }),
        }
    }
}

fn state(response: Result<Value, (u16, &'static str)>) -> AppState {
    let events = EventBus::new(64);
    let metrics = Arc::new(Metrics::new());
    metrics.attach(&events);
    let limiter = LimiterActor::spawn(&SchedulerConfig::default(), events.clone(), metrics.clone());
    let scheduler = Scheduler::new(limiter);
    let config = WhatsAppConfig {
        base_url: "http://localhost".to_string(),
        api_version: "v21.0".to_string(),
        access_token: "token".to_string(),
        phone_number_id: "106540352242922".to_string(),
        business_account_id: None,
        verify_token: None,
    };
    let client = WhatsAppClient::new(
        Arc::new(FixedTransport { response }),
        scheduler.clone(),
        events.clone(),
        &config,
    );
    AppState {
        scheduler,
        client,
        events,
        metrics,
        verify_token: Some("s3cret".to_string()),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = router(state(Ok(json!({}))));
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn test_status_reports_absent_limiters_as_full() {
    let app = router(state(Ok(json!({}))));
    let response = app
        .oneshot(
            Request::get("/status?scope=106540352242922")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["scope"], "106540352242922");
    assert_eq!(json["categories"]["messaging"]["reservoir"], 80);
    assert_eq!(json["categories"]["messaging"]["active"], false);
    assert_eq!(json["categories"]["global"]["reservoir"], 1000);
}

#[tokio::test]
async fn test_send_message_success() {
    let state = state(Ok(json!({
        "messaging_product": "whatsapp",
        "messages": [{ "id": "wamid.ABC" }]
    })));
    let mut sent = state.events.subscribe(Topic::Kind(EventKind::MessageSent));
    let app = router(state);

    let response = app
        .oneshot(post_json(
            "/messages",
            json!({ "messaging_product": "whatsapp", "to": "15550001111", "type": "text", "text": { "body": "hi" } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["messages"][0]["id"], "wamid.ABC");
    assert_eq!(
        sent.try_recv().unwrap().correlation_id.as_deref(),
        Some("wamid.ABC")
    );
}

#[tokio::test]
async fn test_send_message_upstream_error_keeps_status() {
    let app = router(state(Err((400, r#"{"error":{"code":131030}}"#))));

    let response = app
        .oneshot(post_json(
            "/messages",
            json!({ "to": "15550001111", "type": "text", "text": { "body": "hi" } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("131030"));
}

#[tokio::test]
async fn test_webhook_ingestion() {
    let state = state(Ok(json!({})));
    let mut received = state
        .events
        .subscribe(Topic::Kind(EventKind::MessageReceived));
    let metrics = state.metrics.clone();
    let app = router(state);

    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "102290129340398",
            "changes": [{
                "field": "messages",
                "value": {
                    "metadata": { "phone_number_id": "106540352242922" },
                    "messages": [
                        { "from": "16505551234", "id": "wamid.1", "type": "text", "text": { "body": "a" } },
                        { "from": "16505551234", "id": "wamid.2", "type": "text", "text": { "body": "b" } }
                    ],
                    "statuses": [
                        { "id": "wamid.0", "status": "read", "recipient_id": "16505551234" }
                    ]
                }
            }]
        }]
    });

    let response = app.oneshot(post_json("/webhook", payload)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["received"], 3);
    assert_eq!(
        received.try_recv().unwrap().correlation_id.as_deref(),
        Some("wamid.1")
    );
    assert_eq!(
        metrics
            .messages_received
            .load(std::sync::atomic::Ordering::Relaxed),
        2
    );
}

#[tokio::test]
async fn test_webhook_verification() {
    let app = router(state(Ok(json!({}))));

    let response = app
        .clone()
        .oneshot(
            Request::get("/webhook?hub.mode=subscribe&hub.verify_token=s3cret&hub.challenge=1158201444")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"1158201444");

    let response = app
        .oneshot(
            Request::get("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_events_rejects_unknown_type() {
    let app = router(state(Ok(json!({}))));
    let response = app
        .oneshot(
            Request::get("/events?type=sms_sent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = router(state(Ok(json!({}))));
    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("wagate_api_calls_total"));
}
