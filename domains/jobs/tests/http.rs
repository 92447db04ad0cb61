//! HTTP surface tests for the jobs domain router

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use storyreel_jobs::{AuthConfig, Claims, JobsState};

use common::{build_engine, seed_project, test_limits, wait_for, BlockingProvider, InstantProvider};

const SECRET: &str = "http-test-secret";

fn app(engine: &common::Engine) -> Router {
    storyreel_jobs::routes().with_state(JobsState {
        store: Arc::clone(&engine.store),
        hub: Arc::clone(&engine.hub),
        scheduler: Arc::clone(&engine.scheduler),
        auth: AuthConfig { jwt_secret: SECRET.to_string() },
    })
}

fn mint_token(user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id,
        email: "user@example.com".to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_ref())).unwrap()
}

fn authed_request(method: Method, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"));
    if let Some(b) = body {
        builder = builder.header("content-type", "application/json");
        builder.body(Body::from(serde_json::to_string(&b).unwrap())).unwrap()
    } else {
        builder.body(Body::empty()).unwrap()
    }
}

async fn parse_body(response: axum::http::Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn project_create_and_fetch() {
    let engine = build_engine(Arc::new(InstantProvider), test_limits());
    let app = app(&engine);
    let user_id = Uuid::new_v4();
    let token = mint_token(user_id);

    let resp = app
        .clone()
        .oneshot(authed_request(
            Method::POST,
            "/v1/projects",
            &token,
            Some(json!({
                "name": "My Story",
                "story_text": "Once upon a time",
                "style": "noir",
                "scene_count": 3,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = parse_body(resp).await;
    assert_eq!(body["status"], "draft");
    assert_eq!(body["scene_count"], 3);
    let project_id = body["id"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, &format!("/v1/projects/{project_id}"), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Validation failures
    let resp = app
        .clone()
        .oneshot(authed_request(
            Method::POST,
            "/v1/projects",
            &token,
            Some(json!({ "name": " ", "story_text": "x", "style": "noir", "scene_count": 1 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(authed_request(
            Method::POST,
            "/v1/projects",
            &token,
            Some(json!({ "name": "x", "story_text": "x", "style": "noir", "scene_count": 0 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // scene_count boundary: 20 is the largest accepted value
    let resp = app
        .clone()
        .oneshot(authed_request(
            Method::POST,
            "/v1/projects",
            &token,
            Some(json!({ "name": "x", "story_text": "x", "style": "noir", "scene_count": 20 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = parse_body(resp).await;
    assert_eq!(body["scene_count"], 20);

    let resp = app
        .clone()
        .oneshot(authed_request(
            Method::POST,
            "/v1/projects",
            &token,
            Some(json!({ "name": "x", "story_text": "x", "style": "noir", "scene_count": 21 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Other users cannot read it
    let stranger = mint_token(Uuid::new_v4());
    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, &format!("/v1/projects/{project_id}"), &stranger, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // No token at all
    let resp = app
        .oneshot(Request::builder().uri(format!("/v1/projects/{project_id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_start_get_cancel_over_http() {
    let engine = build_engine(Arc::new(BlockingProvider), test_limits());
    let app = app(&engine);
    let user_id = Uuid::new_v4();
    let token = mint_token(user_id);
    let project = seed_project(&engine.store, user_id, 1);

    let start = |key: &'static str| {
        let token = token.clone();
        let uri = format!("/v1/projects/{}/jobs", project.id);
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("idempotency-key", key)
            .header("x-trace-id", "trace-http")
            .body(Body::empty())
            .unwrap();
        req
    };

    let resp = app.clone().oneshot(start("key-1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = parse_body(resp).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["trace_id"], "trace-http");
    let job_id = body["id"].as_str().unwrap().to_string();

    // Idempotent repeat returns the same job
    let resp = app.clone().oneshot(start("key-1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = parse_body(resp).await;
    assert_eq!(body["id"].as_str().unwrap(), job_id);

    // Job with tasks
    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, &format!("/v1/jobs/{job_id}"), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = parse_body(resp).await;
    assert_eq!(body["job"]["id"].as_str().unwrap(), job_id);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 4);

    // Strangers see 403, unknown jobs 404
    let stranger = mint_token(Uuid::new_v4());
    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, &format!("/v1/jobs/{job_id}"), &stranger, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, &format!("/v1/jobs/{}", Uuid::new_v4()), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Cancel, then watch it finalize
    let resp = app
        .clone()
        .oneshot(authed_request(Method::POST, &format!("/v1/jobs/{job_id}/cancel"), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = parse_body(resp).await;
    assert_eq!(body["cancel_requested"], json!(true));

    let job_uuid: Uuid = job_id.parse().unwrap();
    let finished =
        wait_for(&engine.store, job_uuid, Duration::from_secs(5), |j| j.is_terminal()).await;
    assert_eq!(finished.status, storyreel_jobs::JobStatus::Canceled);

    // Retry over HTTP brings it back to queued
    let resp = app
        .clone()
        .oneshot(authed_request(Method::POST, &format!("/v1/jobs/{job_id}/retry"), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = parse_body(resp).await;
    assert_eq!(body["status"], "queued");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_on_running_job_conflicts() {
    let engine = build_engine(Arc::new(BlockingProvider), test_limits());
    let app = app(&engine);
    let user_id = Uuid::new_v4();
    let token = mint_token(user_id);
    let project = seed_project(&engine.store, user_id, 1);

    let job = engine
        .scheduler
        .start_job(user_id, project.id, "t".to_string(), None)
        .unwrap();

    let resp = app
        .oneshot(authed_request(Method::POST, &format!("/v1/jobs/{}/retry", job.id), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = parse_body(resp).await;
    assert_eq!(body["error"]["code"], "INVALID_JOB_STATE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assets_listing_over_http() {
    let engine = build_engine(Arc::new(InstantProvider), test_limits());
    let app = app(&engine);
    let user_id = Uuid::new_v4();
    let token = mint_token(user_id);
    let project = seed_project(&engine.store, user_id, 1);

    let job = engine
        .scheduler
        .start_job(user_id, project.id, "t".to_string(), None)
        .unwrap();
    wait_for(&engine.store, job.id, Duration::from_secs(5), |j| j.is_terminal()).await;

    let resp = app
        .clone()
        .oneshot(authed_request(
            Method::GET,
            &format!("/v1/assets?project_id={}", project.id),
            &token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = parse_body(resp).await;
    assert_eq!(body["total"], 4, "storyboard, image, audio, final video");
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 4);

    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, "/v1/assets?type=final_video", &token, None))
        .await
        .unwrap();
    let body = parse_body(resp).await;
    assert_eq!(body["total"], 1);
    let asset_id = body["items"][0]["id"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, &format!("/v1/assets/{asset_id}"), &token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = parse_body(resp).await;
    assert_eq!(body["type"], "final_video");

    // Assets are owner-scoped
    let stranger = mint_token(Uuid::new_v4());
    let resp = app
        .clone()
        .oneshot(authed_request(Method::GET, "/v1/assets", &stranger, None))
        .await
        .unwrap();
    let body = parse_body(resp).await;
    assert_eq!(body["total"], 0);
    let resp = app
        .oneshot(authed_request(Method::GET, &format!("/v1/assets/{asset_id}"), &stranger, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_limit_maps_to_429() {
    let limits = storyreel_jobs::EngineLimits { max_user_jobs: 1, ..test_limits() };
    let engine = build_engine(Arc::new(BlockingProvider), limits);
    let app = app(&engine);
    let user_id = Uuid::new_v4();
    let token = mint_token(user_id);
    let project_a = seed_project(&engine.store, user_id, 1);
    let project_b = seed_project(&engine.store, user_id, 1);

    engine
        .scheduler
        .start_job(user_id, project_a.id, "t".to_string(), None)
        .unwrap();

    let resp = app
        .oneshot(authed_request(
            Method::POST,
            &format!("/v1/projects/{}/jobs", project_b.id),
            &token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = parse_body(resp).await;
    assert_eq!(body["error"]["code"], "USER_JOB_LIMIT");
    assert_eq!(body["error"]["retryable"], json!(true));
}
