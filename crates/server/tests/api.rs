//! End-to-end exercises of the REST surface against a real database file.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sparkq_db::models::project::{CreateProject, Project};
use sparkq_db::Db;
use sparkq_server::{router, AppState, ServerMode};
use sparkq_services::services::config::{ConfigHandle, LoadedConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn test_app() -> (axum::Router, Db, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Db::connect(&dir.path().join("sparkq.db")).await.unwrap();

    // The singleton project normally comes from `sparkq setup`.
    db.with_exclusive(|conn| {
        Box::pin(async move {
            Project::create(
                conn,
                &CreateProject {
                    name: "cockpit".to_string(),
                    repo_path: None,
                    prd_path: None,
                },
            )
            .await
        })
    })
    .await
    .unwrap();

    let config = ConfigHandle::new(LoadedConfig::defaults_in(dir.path().to_path_buf()));
    let state = AppState::new(
        db.clone(),
        config,
        ServerMode::Dev,
        None,
        CancellationToken::new(),
    );
    (router(state), db, dir)
}

async fn request(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_session(app: &axum::Router, name: &str) -> String {
    let (status, body) = request(
        app,
        Method::POST,
        "/api/sessions",
        Some(json!({ "name": name })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["id"].as_str().unwrap().to_string()
}

async fn create_queue(app: &axum::Router, session_id: &str, name: &str) -> String {
    let (status, body) = request(
        app,
        Method::POST,
        "/api/queues",
        Some(json!({ "session_id": session_id, "name": name })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["id"].as_str().unwrap().to_string()
}

async fn enqueue(app: &axum::Router, queue_id: &str, payload: Value, timeout: i64) -> String {
    let (status, body) = request(
        app,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "queue_id": queue_id,
            "tool_name": "run_script",
            "task_class": "FAST_SCRIPT",
            "payload": payload,
            "timeout": timeout,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_version() {
    let (app, _db, _dir) = test_app().await;

    let (status, body) = request(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].as_str().is_some());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["data"]["version"].as_str().is_some());
}

#[tokio::test]
async fn production_health_refuses_build_mismatch() {
    let dir = TempDir::new().unwrap();
    let db = Db::connect(&dir.path().join("sparkq.db")).await.unwrap();
    let assets = dir.path().join("dist");
    std::fs::create_dir_all(&assets).unwrap();
    std::fs::write(assets.join("version.txt"), "not-the-server-build").unwrap();

    let config = ConfigHandle::new(LoadedConfig::defaults_in(dir.path().to_path_buf()));
    let state = AppState::new(
        db,
        config,
        ServerMode::Production,
        Some(assets),
        CancellationToken::new(),
    );
    let app = router(state);

    let (status, body) = request(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "build_version_mismatch");
}

#[tokio::test]
async fn basic_fifo_scenario() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;

    let t1 = enqueue(&app, &queue, json!({"k": 1}), 30).await;
    let t2 = enqueue(&app, &queue, json!({"k": 2}), 30).await;

    let (status, body) = request(
        &app,
        Method::GET,
        &format!("/api/tasks?queue_id={queue}&status=queued&sort_by=created_at&sort_dir=asc"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], t1.as_str());
    assert_eq!(items[1]["id"], t2.as_str());
    assert_eq!(items[0]["queue_name"], "q1");

    // Claim drains in insertion order.
    let (status, body) =
        request(&app, Method::POST, &format!("/api/tasks/{t1}/claim"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");

    let (status, _) = request(&app, Method::POST, &format!("/api/tasks/{t2}/claim"), None).await;
    assert_eq!(status, StatusCode::OK);

    // Nothing queued anymore; claiming an already-running task is NotFound.
    let (status, body) =
        request(&app, Method::POST, &format!("/api/tasks/{t1}/claim"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;
    let task = enqueue(&app, &queue, json!({"k": 1}), 30).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let app = app.clone();
        let uri = format!("/api/tasks/{task}/claim");
        handles.push(tokio::spawn(async move {
            request(&app, Method::POST, &uri, None).await
        }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        match status {
            StatusCode::OK => {
                winners += 1;
                assert_eq!(body["data"]["attempts"], 1);
            }
            StatusCode::NOT_FOUND => losers += 1,
            other => panic!("unexpected status {other}: {body}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 9);
}

#[tokio::test]
async fn requeue_creates_a_new_task_and_preserves_the_source() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;
    let t1 = enqueue(&app, &queue, json!({"k": 1}), 30).await;

    request(&app, Method::POST, &format!("/api/tasks/{t1}/claim"), None).await;
    let (status, _) = request(
        &app,
        Method::POST,
        &format!("/api/tasks/{t1}/fail"),
        Some(json!({"error": "boom"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/tasks/{t1}/requeue"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let t2 = body["data"]["id"].as_str().unwrap().to_string();
    assert_ne!(t2, t1);
    assert_eq!(body["data"]["status"], "queued");
    assert_eq!(body["data"]["payload"], json!({"k": 1}));
    assert_eq!(body["data"]["timeout"], 30);

    let (_, body) = request(&app, Method::GET, &format!("/api/tasks/{t1}"), None).await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["error"], "boom");
}

#[tokio::test]
async fn archived_queue_name_is_reusable_and_unarchive_conflicts() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let alpha = create_queue(&app, &session, "alpha").await;

    let (status, _) = request(
        &app,
        Method::PUT,
        &format!("/api/queues/{alpha}/archive"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Name freed by archival.
    let _alpha2 = create_queue(&app, &session, "alpha").await;

    // Restoring the original collides with the live holder.
    let (status, body) = request(
        &app,
        Method::PUT,
        &format!("/api/queues/{alpha}/unarchive"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    create_queue(&app, &session, "q1").await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/api/sessions",
        Some(json!({"name": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let (status, body) = request(
        &app,
        Method::POST,
        "/api/queues",
        Some(json!({"session_id": session, "name": "q1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
}

#[tokio::test]
async fn pagination_truncates_and_pages_are_disjoint() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;
    for i in 0..150 {
        enqueue(&app, &queue, json!({"i": i}), 30).await;
    }

    let (status, body) = request(
        &app,
        Method::GET,
        &format!("/api/tasks?queue_id={queue}&limit=100&offset=0&sort_by=created_at&sort_dir=asc"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 100);
    assert_eq!(body["data"]["offset"], 0);
    assert_eq!(body["data"]["total_count"], 150);
    assert_eq!(body["data"]["truncated"], true);
    let first_ids: Vec<String> = body["data"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .collect();

    let (status, body) = request(
        &app,
        Method::GET,
        &format!(
            "/api/tasks?queue_id={queue}&limit=100&offset=100&sort_by=created_at&sort_dir=asc"
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let second_ids: Vec<String> = body["data"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(second_ids.len(), 50);
    for id in &second_ids {
        assert!(!first_ids.contains(id), "duplicate {id} across pages");
    }
}

#[tokio::test]
async fn validation_boundaries() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;

    // timeout = 0 rejected on enqueue.
    let (status, body) = request(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "queue_id": queue,
            "tool_name": "run_script",
            "task_class": "FAST_SCRIPT",
            "payload": {},
            "timeout": 0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");

    // limit bounds: 0 and max+1 rejected (max itself accepted), with the
    // documented ceiling reported.
    for bad in ["limit=0", "limit=501"] {
        let (status, body) =
            request(&app, Method::GET, &format!("/api/tasks?{bad}"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad}");
        assert_eq!(body["error"]["code"], "validation");
        assert_eq!(body["error"]["max_limit"], 500, "{bad}");
    }
    let (status, _) = request(&app, Method::GET, "/api/tasks?limit=500", None).await;
    assert_eq!(status, StatusCode::OK);

    // Bad cursor fingerprint.
    let (status, body) = request(&app, Method::GET, "/api/tasks?cursor=garbage", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn wrong_state_transitions_conflict() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;
    let task = enqueue(&app, &queue, json!({}), 30).await;

    // Complete and fail require a running task.
    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/tasks/{task}/complete"),
        Some(json!({"result": {"summary": "done"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let (status, _) = request(
        &app,
        Method::POST,
        &format!("/api/tasks/{task}/fail"),
        Some(json!({"error": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Requeue requires a failed task.
    let (status, _) = request(
        &app,
        Method::POST,
        &format!("/api/tasks/{task}/requeue"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Completing without a usable summary is a validation error.
    request(&app, Method::POST, &format!("/api/tasks/{task}/claim"), None).await;
    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/tasks/{task}/complete"),
        Some(json!({"result": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn ended_entities_refuse_new_work() {
    let (app, _db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;

    let (status, body) = request(
        &app,
        Method::PUT,
        &format!("/api/sessions/{session}"),
        Some(json!({"status": "ended"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ended");

    // Enqueue under an ended session is a conflict even though the queue
    // itself is still active.
    let (status, body) = request(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "queue_id": queue,
            "tool_name": "run_script",
            "task_class": "FAST_SCRIPT",
            "payload": {},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    // Ending twice conflicts.
    let (status, _) = request(
        &app,
        Method::PUT,
        &format!("/api/sessions/{session}"),
        Some(json!({"status": "ended"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let (app, _db, _dir) = test_app().await;

    for uri in [
        "/api/sessions/sess_000000000000",
        "/api/queues/que_000000000000",
        "/api/tasks/task_000000000000",
    ] {
        let (status, body) = request(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"]["code"], "not_found");
    }
}

#[tokio::test]
async fn session_delete_cascades() {
    let (app, db, _dir) = test_app().await;
    let session = create_session(&app, "s1").await;
    let queue = create_queue(&app, &session, "q1").await;
    enqueue(&app, &queue, json!({}), 30).await;

    let (status, _) = request(
        &app,
        Method::DELETE,
        &format!("/api/sessions/{session}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&app, Method::GET, &format!("/api/queues/{queue}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(tasks, 0);
}
