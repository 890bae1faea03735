mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{orchestrator, FakeBroker, FakeHub, MNQ};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use trailgate::api::{create_router, AppState};
use trailgate::domain::{ContractDirectory, OrderKind};
use trailgate::strategy::FlipPolicy;

fn app(broker: Arc<FakeBroker>) -> axum::Router {
    let orch = Arc::new(orchestrator(broker.clone(), Arc::new(FakeHub::new()), FlipPolicy::disabled()));
    let state = AppState::new(orch, Arc::new(ContractDirectory::new("MNQZ5")), broker);
    create_router(state)
}

async fn post(app: axum::Router, body: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

const ENTRY: &str = "Next Candle Predictor: order buy @ 2 filled on MNQZ5. Entry Price: 21000.1 \
                     Comment: entry|atr=40|stop loss=20990|ts=1730000000";

#[tokio::test]
async fn entry_alert_places_limit_and_reports_levels() {
    let broker = Arc::new(FakeBroker::new());
    let (status, body) = post(app(broker.clone()), ENTRY).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["contractId"], MNQ);
    assert_eq!(body["entryPrice"], 21000.0);
    // 40 ticks * 0.25 = 10 points
    assert_eq!(body["trigger"], 21010.0);
    assert_eq!(body["atr"]["points"], 10.0);
    assert_eq!(body["atr"]["ticksRounded"], 40.0);
    assert_eq!(body["parsed"]["direction"], "buy");
    assert_eq!(body["parsed"]["ts_ms"], 1_730_000_000_000i64);
    assert!(body["tag"].as_str().unwrap().starts_with("MNQZ5_buy_"));

    let limits = broker.placements_of(OrderKind::Limit);
    assert_eq!(limits.len(), 1);
    assert_eq!(body["limitOrderId"], limits[0].0.as_str());
}

#[tokio::test]
async fn json_envelope_is_unwrapped() {
    let broker = Arc::new(FakeBroker::new());
    let envelope = serde_json::json!({ "message": ENTRY }).to_string();
    let (status, body) = post(app(broker), &envelope).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn malformed_and_incomplete_alerts_are_rejected() {
    let broker = Arc::new(FakeBroker::new());

    let (status, body) = post(app(broker.clone()), "hello").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Parse error"));

    let no_atr = "Next Candle Predictor: order buy @ 2 filled on MNQZ5. Entry Price: 21000 Comment: entry";
    let (status, body) = post(app(broker.clone()), no_atr).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("ATR not found"));

    assert!(broker.placements().is_empty());
}

#[tokio::test]
async fn exit_is_skipped_and_close_flattens() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_net(&common::mnq(), 2);
    let router = app(broker.clone());

    let exit = "Next Candle Predictor: order sell @ 2 filled on MNQZ5. Entry Price: 21000 Comment: exit long";
    let (status, body) = post(router.clone(), exit).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reason"], "exit signal");

    let close = "Next Candle Predictor: order sell @ 2 filled on MNQZ5. Entry Price: 21000 \
                 Comment: Close entry(s) order long|ts=1730000100";
    let (status, body) = post(router.clone(), close).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "close_done");
    assert_eq!(body["flat"], true);
    assert_eq!(body["netAfter"], 0);
    assert_eq!(broker.net(&common::mnq()), 0);

    // entry stamped before the close is stale
    let (status, body) = post(router, ENTRY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "skipped");
    assert_eq!(body["reason"], "stale_vs_close_ts");
    assert_eq!(body["lastCloseTs"], 1_730_000_100_000i64);
}

#[tokio::test]
async fn health_reports_streams_and_watchers() {
    let broker = Arc::new(FakeBroker::new());
    let router = app(broker);
    post(router.clone(), ENTRY).await;

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_watchers"], 1);
    assert_eq!(body["streams"][0]["contract_id"], MNQ);
    assert_eq!(body["streams"][0]["connected"], true);
}
