//! Operator API
//!
//! Endpoints:
//! - GET    /status                       - queue snapshot plus pool stats
//! - POST   /control/{start,pause,resume,stop} - global transitions
//! - PUT    /workers                      - change the concurrency cap
//! - POST   /files/scan                   - rescan the input folder
//! - GET    /credentials                  - list keys (masked)
//! - POST   /credentials                  - validate and add a key
//! - DELETE /credentials/{index}          - remove a key from pool + key store
//! - PUT    /credentials/{index}/active   - toggle a key
//! - DELETE /jobs/{id}                    - dismiss a finished entry
//! - POST   /jobs/{id}/reset              - make an error entry's file pending again

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, extract::rejection::JsonRejection};
use credential_pool::CredentialSummary;
use job_queue::{JobId, Scheduler};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Shared state for operator API handlers.
#[derive(Clone)]
pub struct AdminState {
    scheduler: Scheduler,
}

impl AdminState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

/// Build the operator router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/control/start", post(start))
        .route("/control/pause", post(pause))
        .route("/control/resume", post(resume))
        .route("/control/stop", post(stop))
        .route("/workers", put(set_workers))
        .route("/files/scan", post(scan_files))
        .route("/credentials", get(list_credentials).post(add_credential))
        .route("/credentials/{index}", delete(remove_credential))
        .route("/credentials/{index}/active", put(set_credential_active))
        .route("/jobs/{id}", delete(dismiss_job))
        .route("/jobs/{id}/reset", post(reset_job))
        .with_state(state)
}

type ApiResponse = (StatusCode, [(axum::http::header::HeaderName, &'static str); 1], String);

fn respond(status: StatusCode, body: Value) -> ApiResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    respond(status, json!({ "error": message.to_string() }))
}

fn queue_error(err: job_queue::Error) -> ApiResponse {
    let status = match err {
        job_queue::Error::Validation(_) => StatusCode::BAD_REQUEST,
        job_queue::Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

fn pool_error(err: credential_pool::Error) -> ApiResponse {
    let status = match err {
        credential_pool::Error::InvalidCredential(_) => StatusCode::BAD_REQUEST,
        credential_pool::Error::Duplicate(_) => StatusCode::CONFLICT,
        credential_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        credential_pool::Error::Network(_) => StatusCode::BAD_GATEWAY,
        credential_pool::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

fn json_rejection(rejection: JsonRejection) -> ApiResponse {
    error_response(StatusCode::BAD_REQUEST, rejection.body_text())
}

/// Response for a successful global transition.
fn state_response(scheduler: &Scheduler) -> ApiResponse {
    respond(
        StatusCode::OK,
        json!({ "state": scheduler.state(), "workers": scheduler.workers() }),
    )
}

/// GET /status - queue snapshot with pool stats.
async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.scheduler.snapshot();
    let pool = state.scheduler.pool().stats().await;

    let mut body = serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}));
    body["pool"] = json!(pool);
    respond(StatusCode::OK, body)
}

async fn start(State(state): State<AdminState>) -> impl IntoResponse {
    match state.scheduler.start().await {
        Ok(()) => state_response(&state.scheduler),
        Err(e) => queue_error(e),
    }
}

async fn pause(State(state): State<AdminState>) -> impl IntoResponse {
    match state.scheduler.pause() {
        Ok(()) => state_response(&state.scheduler),
        Err(e) => queue_error(e),
    }
}

async fn resume(State(state): State<AdminState>) -> impl IntoResponse {
    match state.scheduler.resume() {
        Ok(()) => state_response(&state.scheduler),
        Err(e) => queue_error(e),
    }
}

/// POST /control/stop - always succeeds, stopping twice is a no-op.
async fn stop(State(state): State<AdminState>) -> impl IntoResponse {
    state.scheduler.stop();
    state_response(&state.scheduler)
}

#[derive(Deserialize)]
struct WorkersRequest {
    workers: usize,
}

/// PUT /workers - change the concurrency cap.
async fn set_workers(
    State(state): State<AdminState>,
    body: Result<Json<WorkersRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection(rejection),
    };
    match state.scheduler.set_concurrency(req.workers) {
        Ok(()) => respond(StatusCode::OK, json!({ "workers": state.scheduler.workers() })),
        Err(e) => queue_error(e),
    }
}

/// POST /files/scan - rescan the input folder for new files.
async fn scan_files(State(state): State<AdminState>) -> impl IntoResponse {
    match state.scheduler.scan_input().await {
        Ok(added) => respond(
            StatusCode::OK,
            json!({
                "added": added,
                "files": state.scheduler.snapshot().files.len(),
            }),
        ),
        Err(e) => queue_error(e),
    }
}

/// GET /credentials - list all keys, masked.
async fn list_credentials(State(state): State<AdminState>) -> impl IntoResponse {
    let credentials: Vec<CredentialSummary> = state.scheduler.pool().list().await;
    respond(StatusCode::OK, json!({ "credentials": credentials }))
}

#[derive(Deserialize)]
struct AddCredentialRequest {
    api_key: String,
}

/// POST /credentials - validate a key against the service and add it.
async fn add_credential(
    State(state): State<AdminState>,
    body: Result<Json<AddCredentialRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection(rejection),
    };

    let pool = state.scheduler.pool();
    match pool.add(&req.api_key).await {
        Ok(id) => {
            let summary = pool.list().await.into_iter().find(|c| c.id == id);
            respond(
                StatusCode::CREATED,
                json!({ "status": "added", "credential": summary }),
            )
        }
        Err(e) => {
            warn!(error = %e, "credential rejected");
            pool_error(e)
        }
    }
}

/// DELETE /credentials/{index} - remove from pool and key store.
async fn remove_credential(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    match state.scheduler.pool().remove(index).await {
        Ok(Some(_)) => {
            info!(index, "credential removed via operator API");
            respond(StatusCode::OK, json!({ "index": index, "status": "removed" }))
        }
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("no credential at index {index}"),
        ),
        Err(e) => pool_error(e),
    }
}

#[derive(Deserialize)]
struct ActiveRequest {
    active: bool,
}

/// PUT /credentials/{index}/active - enable or disable a key.
async fn set_credential_active(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
    body: Result<Json<ActiveRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection(rejection),
    };
    match state.scheduler.pool().set_active(index, req.active).await {
        Ok(()) => respond(
            StatusCode::OK,
            json!({ "index": index, "active": req.active }),
        ),
        Err(e) => pool_error(e),
    }
}

/// DELETE /jobs/{id} - dismiss a completed or failed entry.
async fn dismiss_job(
    State(state): State<AdminState>,
    Path(id): Path<JobId>,
) -> impl IntoResponse {
    match state.scheduler.dismiss(id) {
        Ok(()) => respond(StatusCode::OK, json!({ "id": id, "status": "dismissed" })),
        Err(e) => queue_error(e),
    }
}

/// POST /jobs/{id}/reset - return an error entry's file to pending.
async fn reset_job(State(state): State<AdminState>, Path(id): Path<JobId>) -> impl IntoResponse {
    match state.scheduler.reset_to_pending(id) {
        Ok(()) => respond(StatusCode::OK, json!({ "id": id, "status": "pending" })),
        Err(e) => queue_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use credential_pool::{KeyStore, Pool};
    use enhance_client::HttpConnector;
    use job_queue::SchedulerConfig;
    use media_tools::Ffmpeg;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Mock enhancement service: every key validates except `bad-key`.
    async fn mock_service() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/video/"))
            .and(header("X-API-Key", "bad-key"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/video/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "requestId": "req-validate" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/account/v1/credits/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "available_credits": 40,
                "reserved_credits": 0,
                "total_credits": 40
            })))
            .mount(&server)
            .await;
        server
    }

    struct TestApp {
        dir: tempfile::TempDir,
        scheduler: Scheduler,
        _server: MockServer,
    }

    impl TestApp {
        async fn new(files: &[&str]) -> Self {
            let server = mock_service().await;
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("input");
            std::fs::create_dir(&input).unwrap();
            for name in files {
                std::fs::write(input.join(name), b"source").unwrap();
            }

            let connector = HttpConnector::new(&server.uri(), Duration::from_secs(5)).unwrap();
            let store = KeyStore::load(dir.path().join("credentials.json"))
                .await
                .unwrap();
            let pool = Arc::new(Pool::with_store(Arc::new(connector), Arc::new(store)));
            let config = SchedulerConfig {
                input_dir: Some(input),
                output_dir: Some(dir.path().join("output")),
                ..SchedulerConfig::default()
            };
            let scheduler = Scheduler::new(pool, Arc::new(Ffmpeg::default()), config);
            scheduler.scan_input().await.unwrap();

            Self {
                dir,
                scheduler,
                _server: server,
            }
        }

        fn router(&self) -> Router {
            build_admin_router(AdminState::new(self.scheduler.clone()))
        }

        async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(v) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(v.to_string())
                }
                None => Body::empty(),
            };
            let response = self
                .router()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, json)
        }
    }

    #[tokio::test]
    async fn status_reports_pending_files_and_empty_pool() {
        let app = TestApp::new(&["a.mp4", "b.png", "notes.txt"]).await;

        let (status, json) = app.call("GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["workers"], 2);
        assert_eq!(json["active"], 0);
        assert_eq!(json["files"].as_array().unwrap().len(), 2);
        assert_eq!(json["jobs"], json!([]));
        assert_eq!(json["pool"]["total"], 0);
    }

    #[tokio::test]
    async fn add_credential_validates_and_persists() {
        let app = TestApp::new(&[]).await;

        let (status, json) = app
            .call(
                "POST",
                "/credentials",
                Some(json!({ "api_key": "good-key-123456" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "got: {json}");
        assert_eq!(json["credential"]["key"], "good-key...");
        assert_eq!(json["credential"]["credits"]["available"], 40.0);

        let (_, listed) = app.call("GET", "/credentials", None).await;
        let listed = listed["credentials"].as_array().unwrap().clone();
        assert_eq!(listed.len(), 1);
        assert!(
            !listed[0].to_string().contains("good-key-123456"),
            "listing must never expose the full key"
        );

        let store = KeyStore::load(app.dir.path().join("credentials.json"))
            .await
            .unwrap();
        assert_eq!(store.keys().await, vec!["good-key-123456".to_string()]);
    }

    #[tokio::test]
    async fn add_invalid_credential_returns_400() {
        let app = TestApp::new(&[]).await;

        let (status, json) = app
            .call("POST", "/credentials", Some(json!({ "api_key": "bad-key" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("invalid credential"));
        assert!(app.scheduler.pool().is_empty().await);
    }

    #[tokio::test]
    async fn add_duplicate_credential_returns_409() {
        let app = TestApp::new(&[]).await;
        let body = json!({ "api_key": "dup-key-0001" });

        let (first, _) = app.call("POST", "/credentials", Some(body.clone())).await;
        assert_eq!(first, StatusCode::CREATED);
        let (second, _) = app.call("POST", "/credentials", Some(body)).await;
        assert_eq!(second, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn add_credential_with_malformed_body_returns_400() {
        let app = TestApp::new(&[]).await;

        let (status, json) = app
            .call("POST", "/credentials", Some(json!({ "key": "missing-field" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn remove_credential_updates_pool_and_store() {
        let app = TestApp::new(&[]).await;
        app.scheduler.pool().add("first-key-0001").await.unwrap();
        app.scheduler.pool().add("second-key-002").await.unwrap();

        let (status, _) = app.call("DELETE", "/credentials/0", None).await;
        assert_eq!(status, StatusCode::OK);

        let listed = app.scheduler.pool().list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "second-k...");

        let store = KeyStore::load(app.dir.path().join("credentials.json"))
            .await
            .unwrap();
        assert_eq!(store.keys().await, vec!["second-key-002".to_string()]);
    }

    #[tokio::test]
    async fn remove_out_of_range_credential_returns_404() {
        let app = TestApp::new(&[]).await;

        let (status, _) = app.call("DELETE", "/credentials/3", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn toggle_credential_active() {
        let app = TestApp::new(&[]).await;
        app.scheduler.pool().add("toggle-key-001").await.unwrap();

        let (status, json) = app
            .call("PUT", "/credentials/0/active", Some(json!({ "active": false })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active"], false);
        assert_eq!(app.scheduler.pool().stats().await.active, 0);

        let (status, _) = app
            .call("PUT", "/credentials/9/active", Some(json!({ "active": true })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_without_credentials_returns_400() {
        let app = TestApp::new(&["a.mp4"]).await;

        let (status, json) = app.call("POST", "/control/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "no API keys configured");
        assert_eq!(app.scheduler.state(), job_queue::ProcessingState::Stopped);
    }

    #[tokio::test]
    async fn pause_and_resume_require_matching_state() {
        let app = TestApp::new(&[]).await;

        let (status, json) = app.call("POST", "/control/pause", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "cannot pause while stopped");

        let (status, _) = app.call("POST", "/control/resume", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let app = TestApp::new(&[]).await;

        for _ in 0..2 {
            let (status, json) = app.call("POST", "/control/stop", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["state"], "stopped");
        }
    }

    #[tokio::test]
    async fn set_workers_enforces_bounds() {
        let app = TestApp::new(&[]).await;

        let (status, json) = app.call("PUT", "/workers", Some(json!({ "workers": 8 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["workers"], 8);

        for workers in [0, 51] {
            let (status, _) = app
                .call("PUT", "/workers", Some(json!({ "workers": workers })))
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "workers={workers}");
        }
        assert_eq!(app.scheduler.workers(), 8);
    }

    #[tokio::test]
    async fn scan_picks_up_new_files() {
        let app = TestApp::new(&["a.mp4"]).await;
        std::fs::write(app.dir.path().join("input").join("b.jpg"), b"img").unwrap();

        let (status, json) = app.call("POST", "/files/scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["added"], 1);
        assert_eq!(json["files"], 2);
    }

    #[tokio::test]
    async fn unknown_job_returns_404() {
        let app = TestApp::new(&[]).await;
        let id = uuid::Uuid::new_v4();

        let (status, _) = app.call("DELETE", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.call("POST", &format!("/jobs/{id}/reset"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
