//! HTTP contract tests: the router wired to an in-memory store, driven
//! through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use sb_domain::config::Config;
use sb_domain::{ConfigSnapshot, Session, SessionStatus};
use sb_gateway::api;
use sb_gateway::api::webhook;
use sb_gateway::runtime::lifecycle::LifecycleController;
use sb_gateway::runtime::pool::PoolManager;
use sb_gateway::runtime::registry::SessionRegistry;
use sb_gateway::runtime::spawn::{SpawnJob, SpawnQueue};
use sb_gateway::state::AppState;
use sb_gateway::token::TokenIssuer;
use sb_store::{keys, MemoryStore, StateStore};
use sb_supervisor::Supervisor;

const WEBHOOK_SECRET: &str = "hook-secret";

struct Rig {
    app: Router,
    store: Arc<MemoryStore>,
    _rx: tokio::sync::mpsc::Receiver<SpawnJob>,
}

fn rig() -> Rig {
    rig_with(Config::default())
}

fn rig_with(config: Config) -> Rig {
    let config = Arc::new(config);
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn StateStore> = store.clone();
    let supervisor = Arc::new(Supervisor::new(None));
    let registry = Arc::new(SessionRegistry::new(
        store_dyn.clone(),
        supervisor.clone(),
        Duration::from_millis(100),
    ));
    let (queue, rx) = SpawnQueue::bounded(config.agent.max_queue());
    let pool = Arc::new(PoolManager::new(
        store_dyn.clone(),
        registry.clone(),
        queue.clone(),
        config.clone(),
    ));
    let tokens = Arc::new(TokenIssuer::new("lk-key".into(), "lk-secret".into(), 7200));
    let lifecycle = Arc::new(LifecycleController::new(
        store_dyn.clone(),
        registry.clone(),
        pool.clone(),
        queue.clone(),
        tokens.clone(),
        config.clone(),
    ));

    let state = AppState {
        config,
        store: store_dyn,
        supervisor,
        registry,
        pool,
        spawn_queue: queue,
        lifecycle,
        webhook_secret: Some(Arc::new(WEBHOOK_SECRET.to_string())),
        tokens,
    };

    Rig {
        app: api::router(state),
        store,
        _rx: rx,
    }
}

async fn preload_pool(store: &MemoryStore, id: &str) {
    let mut s = Session::prewarmed(
        id,
        ConfigSnapshot {
            voice_id: "Olivia".into(),
            opening_line: None,
            system_prompt: None,
        },
    );
    s.status = SessionStatus::Ready;
    store.put_session(&s).await.unwrap();
    store.add_to_index(keys::INDEX_POOL_READY, id).await.unwrap();
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn send_webhook(app: &Router, body: &serde_json::Value, signature: Option<&str>) -> (StatusCode, serde_json::Value) {
    let raw = body.to_string();
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook/media")
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header(webhook::SIGNATURE_HEADER, sig);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(raw)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// /session/start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn pool_hit_start_returns_ready_session() {
    let rig = rig();
    preload_pool(&rig.store, "P1").await;

    let (status, body) = send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "alice" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "P1");
    assert_eq!(body["roomName"], "P1");
    assert_eq!(body["status"], "ready");
    assert!(!body["token"].as_str().unwrap().is_empty());

    // The pool agent is now alice's.
    assert_eq!(rig.store.index_size(keys::INDEX_POOL_READY).await.unwrap(), 0);
    assert_eq!(rig.store.index_size(keys::INDEX_READY).await.unwrap(), 1);
    let s = rig.store.get_session("P1").await.unwrap().unwrap();
    assert_eq!(s.user_identity, "alice");
}

#[tokio::test]
async fn cold_start_returns_starting_session() {
    let rig = rig();
    let (status, body) = send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "bob", "correlationToken": "c-1" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "starting");
    assert_eq!(body["correlationToken"], "c-1");
    let id = body["sessionId"].as_str().unwrap();
    assert!(rig.store.get_session(id).await.unwrap().is_some());
}

#[tokio::test]
async fn start_without_user_name_is_rejected() {
    let rig = rig();
    let (status, _) = send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn same_user_twice_gets_the_same_session() {
    let rig = rig();
    let body = serde_json::json!({ "userName": "carol", "voiceId": "Craig" });
    let (_, first) = send(&rig.app, "POST", "/session/start", Some(body)).await;

    let body = serde_json::json!({ "userName": "carol", "voiceId": "Olivia" });
    let (_, second) = send(&rig.app, "POST", "/session/start", Some(body)).await;

    assert_eq!(first["sessionId"], second["sessionId"]);
}

#[tokio::test]
async fn capacity_limit_maps_to_503() {
    let mut config = Config::default();
    config.agent.max_bots = 0;
    let rig = rig_with(config);

    let (status, body) = send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "dave" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["retryAfterSeconds"].is_number());
}

#[tokio::test]
async fn rate_limit_maps_to_429() {
    let mut config = Config::default();
    config.server.rate_limit.max_requests = 1;
    let rig = rig_with(config);

    let (first, _) = send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "u1" })),
    )
    .await;
    assert_eq!(first, StatusCode::OK);

    let (second, _) = send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "u2" })),
    )
    .await;
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// /session/end & /session/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn end_is_idempotent_and_reports_duration() {
    let rig = rig();
    preload_pool(&rig.store, "P1").await;
    send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "alice" })),
    )
    .await;

    // 61 seconds of conversation bills as 2 minutes (ceiling).
    rig.store
        .patch_session(
            "P1",
            &[(
                sb_store::codec::fields::CONVERSATION_START_AT,
                sb_store::codec::timestamp_to_string(
                    chrono::Utc::now() - chrono::Duration::seconds(61),
                ),
            )],
        )
        .await
        .unwrap();

    let (status, body) = send(
        &rig.app,
        "POST",
        "/session/end",
        Some(serde_json::json!({ "sessionId": "P1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let seconds = body["durationSeconds"].as_u64().unwrap();
    assert!((61..=62).contains(&seconds));
    assert_eq!(body["durationMinutes"], 2);
    assert_eq!(body["cleanupReport"]["session_id"], "P1");

    // Second end: same report, still 200.
    let (status, again) = send(
        &rig.app,
        "POST",
        "/session/end",
        Some(serde_json::json!({ "sessionId": "P1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["cleanupReport"], body["cleanupReport"]);

    // The record is gone.
    let (status, _) = send(&rig.app, "GET", "/session/P1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn end_unknown_session_is_404() {
    let rig = rig();
    let (status, _) = send(
        &rig.app,
        "POST",
        "/session/end",
        Some(serde_json::json!({ "sessionId": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_projection_exposes_status_and_error() {
    let rig = rig();
    preload_pool(&rig.store, "P1").await;

    let (status, body) = send(&rig.app, "GET", "/session/P1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "P1");
    assert_eq!(body["status"], "ready");
    assert_eq!(body["error"], serde_json::Value::Null);
    assert!(body["startupTimeSeconds"].is_number());

    let (status, _) = send(&rig.app, "GET", "/session/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_logs_come_from_the_store_mirror() {
    let rig = rig();
    preload_pool(&rig.store, "P1").await;
    rig.store.append_log("P1", "Pipeline started").await.unwrap();
    rig.store.append_log("P1", "[stderr] warn: slow tts").await.unwrap();

    let (status, body) = send(&rig.app, "GET", "/session/P1/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    let lines = body["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "Pipeline started");

    let (status, _) = send(&rig.app, "GET", "/session/ghost/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// /webhook/media
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn signed_disconnect_tears_the_session_down() {
    let rig = rig();
    preload_pool(&rig.store, "S2").await;
    send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "alice" })),
    )
    .await;

    let event = serde_json::json!({
        "event": "participant_left",
        "room": { "name": "S2" },
    });
    let signature = webhook::sign(WEBHOOK_SECRET.as_bytes(), event.to_string().as_bytes());

    let (status, body) = send_webhook(&rig.app, &event, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["event"], "participant_left");

    // Record and indexes are gone.
    assert!(rig.store.get_session("S2").await.unwrap().is_none());
    let (status, _) = send(&rig.app, "GET", "/session/S2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Replaying the same webhook is a 200 no-op.
    let (status, _) = send_webhook(&rig.app, &event, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn participant_join_marks_the_conversation_active() {
    let rig = rig();
    preload_pool(&rig.store, "S2").await;
    send(
        &rig.app,
        "POST",
        "/session/start",
        Some(serde_json::json!({ "userName": "alice" })),
    )
    .await;

    let event = serde_json::json!({
        "event": "participant_joined",
        "room": { "name": "S2" },
        "participant": { "identity": "alice" },
    });
    let signature = webhook::sign(WEBHOOK_SECRET.as_bytes(), event.to_string().as_bytes());
    let (status, _) = send_webhook(&rig.app, &event, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);

    let s = rig.store.get_session("S2").await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Active);
    assert!(s.conversation_start_at.is_some());
}

#[tokio::test]
async fn bad_signature_is_401_and_missing_is_401() {
    let rig = rig();
    let event = serde_json::json!({ "event": "participant_left", "room": { "name": "x" } });

    let (status, _) = send_webhook(&rig.app, &event, Some("deadbeef")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_webhook(&rig.app, &event, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bad_json_with_valid_signature_is_400() {
    let rig = rig();
    let raw = "not json at all";
    let signature = webhook::sign(WEBHOOK_SECRET.as_bytes(), raw.as_bytes());

    let response = rig
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/media")
                .header(webhook::SIGNATURE_HEADER, signature)
                .body(Body::from(raw))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn health_reports_counts_and_capacity() {
    let rig = rig();
    preload_pool(&rig.store, "P1").await;

    let (status, body) = send(&rig.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storeConnected"], true);
    assert_eq!(body["sessions"]["pool"], 1);
    assert_eq!(body["sessions"]["ready"], 0);
    assert_eq!(body["capacity"]["maxBots"], 50);
}
