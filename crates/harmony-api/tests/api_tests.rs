// SPDX-License-Identifier: GPL-3.0-or-later
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use harmony_api::{router, ApiState};
use harmony_application::{AppState, LibraryRepository};
use harmony_config::AppConfig;
use harmony_domain::{Artist, ArtistKey};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn test_router() -> (axum::Router, AppState, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("harmony.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("migrate");

    let state = AppState::new(AppConfig::default(), pool).expect("state");
    let api_state = ApiState {
        app: state.clone(),
        health: None,
    };
    (router(api_state), state, dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_endpoint() {
    let (router, _state, _dir) = test_router().await;
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn enqueue_and_list_jobs() {
    let (router, _state, _dir) = test_router().await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/v1/queue/jobs",
            json!({
                "job_type": "artist_sync",
                "payload": {"artist_key": "spotify:abc"},
                "idempotency_key": "artist_sync:spotify:abc"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["deduplicated"], false);
    let job_id = body["job_id"].as_i64().unwrap();

    // duplicate intent collapses onto the same job
    let response = router
        .clone()
        .oneshot(post_json(
            "/api/v1/queue/jobs",
            json!({
                "job_type": "artist_sync",
                "payload": {"artist_key": "spotify:abc"},
                "idempotency_key": "artist_sync:spotify:abc"
            }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["deduplicated"], true);
    assert_eq!(body["job_id"].as_i64().unwrap(), job_id);

    let response = router
        .oneshot(get("/api/v1/queue/jobs?state=pending"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["job_type"], "artist_sync");
}

#[tokio::test]
async fn unknown_job_type_gets_error_envelope() {
    let (router, _state, _dir) = test_router().await;
    let response = router
        .oneshot(post_json(
            "/api/v1/queue/jobs",
            json!({"job_type": "tagging", "payload": {}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn watchlist_crud_roundtrip() {
    let (router, _state, _dir) = test_router().await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/v1/watchlist",
            json!({"artist_key": "spotify:abc", "priority": 7}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["priority"], 7);
    assert_eq!(body["paused"], false);

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/v1/watchlist/spotify:abc/pause",
            json!({"paused": true, "reason": "requested"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["paused"], true);
    assert_eq!(body["pause_reason"], "requested");

    let response = router
        .clone()
        .oneshot(get("/api/v1/watchlist"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/watchlist/spotify:abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_watchlist_key_is_rejected() {
    let (router, _state, _dir) = test_router().await;
    let response = router
        .oneshot(post_json(
            "/api/v1/watchlist",
            json!({"artist_key": "no-colon-here"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ingest_submission_reports_partial_success() {
    let (router, _state, _dir) = test_router().await;
    let response = router
        .oneshot(post_json(
            "/api/v1/ingest",
            json!({
                "mode": "FREE",
                "lines": ["Radiohead - Airbag", "garbage line"]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["accepted"].as_array().unwrap().len(), 1);
    assert_eq!(body["skipped"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_artist_is_not_found() {
    let (router, _state, _dir) = test_router().await;
    let response = router
        .oneshot(get("/api/v1/artists/spotify:ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn artist_reads_carry_etag_and_cache_headers() {
    let (router, state, _dir) = test_router().await;

    let key = ArtistKey::new("spotify", "abc");
    state
        .library
        .create_artist(&Artist::new(key.clone(), "Radiohead"), None)
        .await
        .unwrap();

    let first = router
        .clone()
        .oneshot(get("/api/v1/artists/spotify:abc"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first
        .headers()
        .get(header::ETAG)
        .expect("etag header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(etag.starts_with('"'));

    // cache hit serves the same strong etag
    let second = router
        .oneshot(get("/api/v1/artists/spotify:abc"))
        .await
        .unwrap();
    let cached_etag = second
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(etag, cached_etag);
    assert!(second
        .headers()
        .get(header::CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("public, max-age="));
}

#[tokio::test]
async fn dead_letter_listing_is_empty_initially() {
    let (router, _state, _dir) = test_router().await;
    let response = router
        .oneshot(get("/api/v1/queue/dead-letter"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body.as_array().unwrap().is_empty());
}
