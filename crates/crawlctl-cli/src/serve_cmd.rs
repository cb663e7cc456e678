use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::extract::{Form, FromRequest, Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crawlctl_core::{ControlAck, InstanceSummary, Orchestrator, OrchestratorError};

use crate::site_config::{self, SiteEntry, SiteForm};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    /// Keep an extractor rejection's status and message.
    pub fn rejected(rejection: impl IntoResponse + std::fmt::Display) -> Self {
        let message = rejection.to_string();
        Self {
            status: rejection.into_response().status(),
            message,
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        if err.is_not_found() {
            Self::not_found(err.to_string())
        } else {
            Self::internal(err.into())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct LaunchRequest {
    /// Export destination handed to the worker.
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    pub process_id: u32,
}

#[derive(Debug, Serialize)]
pub struct SiteConfigResponse {
    pub status: &'static str,
    pub message: String,
    pub data: SiteEntry,
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub site_config_path: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/instances", get(list_instances).post(launch_instance))
        .route("/api/instances/{pid}/stream", get(stream_instance))
        .route("/api/instances/{pid}/pause", post(pause_instance))
        .route("/api/instances/{pid}/resume", post(resume_instance))
        .route("/api/instances/{pid}/stop", post(stop_instance))
        .route("/api/config", post(submit_site_config))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let orchestrator = state.orchestrator.clone();
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("crawlctl serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers run in their own process groups, so the terminal's Ctrl+C
    // did not reach them.
    let stopped = orchestrator.stop_all().await;
    tracing::info!(stopped = stopped.len(), "crawlctl serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Response {
    let instances = state.orchestrator.list().await;

    let rows = if instances.is_empty() {
        "<tr><td colspan=\"3\">No running workers.</td></tr>".to_string()
    } else {
        instances
            .iter()
            .map(|i| {
                format!(
                    "<tr><td><a href=\"/api/instances/{pid}/stream\">{pid}</a></td><td>{status}</td><td>{created}</td></tr>",
                    pid = i.process_id,
                    status = i.status,
                    created = i.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>crawlctl</title></head><body>\
<h1>crawlctl</h1>\
<p><a href=\"/api/instances\">/api/instances</a></p>\
<table><tr><th>Process</th><th>Status</th><th>Started</th></tr>{rows}</table>\
<h2>Site config</h2>\
<form method=\"post\" action=\"/api/config\">\
<p><label>Name <input name=\"name\"></label></p>\
<p><label>Start URL <input name=\"url\"></label></p>\
<p><label>Title selector <input name=\"title\"></label></p>\
<p><label>Link selector <input name=\"link\"></label></p>\
<p><label>Content selector <input name=\"content\"></label></p>\
<p><label>Next page selector <input name=\"next_page\"></label></p>\
<p><button type=\"submit\">Save</button></p>\
</form>\
</body></html>"
    );

    Html(html).into_response()
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceSummary>> {
    Json(state.orchestrator.list().await)
}

/// `POST /api/instances`. The JSON body is optional.
async fn launch_instance(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<LaunchResponse>), AppError> {
    let request: LaunchRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LaunchRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid launch request: {e}")))?
    };

    let process_id = state
        .orchestrator
        .launch(request.output.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(LaunchResponse { process_id })))
}

async fn stream_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Response, AppError> {
    let lines = state.orchestrator.stream(pid)?;
    let body = Body::from_stream(lines.map(|line| Ok::<_, Infallible>(format!("{}\n", line.text))));
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn pause_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.orchestrator.pause(pid).await?))
}

async fn resume_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.orchestrator.resume(pid).await?))
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.orchestrator.stop(pid).await?))
}

/// `POST /api/config`. Takes a JSON object, or the index page's
/// url-encoded form.
async fn submit_site_config(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<SiteConfigResponse>, AppError> {
    let url_encoded = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    let form = if url_encoded {
        let Form(form) = Form::<SiteForm>::from_request(request, &state)
            .await
            .map_err(AppError::rejected)?;
        form
    } else {
        let Json(form) = Json::<SiteForm>::from_request(request, &state)
            .await
            .map_err(AppError::rejected)?;
        form
    };

    let path = state.site_config_path.clone();
    let data = tokio::task::spawn_blocking(move || site_config::write_site_config(&path, form))
        .await
        .map_err(|e| AppError::internal(e.into()))?
        .map_err(AppError::internal)?;

    Ok(Json(SiteConfigResponse {
        status: "success",
        message: format!("site config saved to {}", state.site_config_path.display()),
        data,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crawlctl_core::{Orchestrator, OrchestratorConfig, WorkerCommand};

    use super::AppState;

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn state_with(program: &str, site_config_path: std::path::PathBuf) -> AppState {
        AppState {
            orchestrator: Orchestrator::new(OrchestratorConfig {
                command: WorkerCommand::new(program),
                stop_timeout: Duration::from_secs(5),
                ..OrchestratorConfig::default()
            }),
            site_config_path,
        }
    }

    fn idle_state() -> AppState {
        state_with("/nonexistent/worker", std::path::PathBuf::from("config.json"))
    }

    async fn send(state: AppState, request: Request<Body>) -> axum::response::Response {
        super::build_router(state).oneshot(request).await.unwrap()
    }

    async fn get(state: AppState, uri: &str) -> axum::response::Response {
        send(state, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    async fn post(state: AppState, uri: &str, body: &str) -> axum::response::Response {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(state, request).await
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_returns_html() {
        let resp = get(idle_state(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap()
            .to_string();
        assert!(
            content_type.contains("text/html"),
            "content-type should contain text/html, got: {content_type}"
        );
        let html = body_text(resp).await;
        assert!(html.contains("No running workers."));
        assert!(html.contains("action=\"/api/config\""));
    }

    #[tokio::test]
    async fn test_list_instances_empty() {
        let resp = get(idle_state(), "/api/instances").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_stream_unknown_instance_is_404() {
        let resp = get(idle_state(), "/api/instances/999999/stream").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "no live instance with process id 999999");
    }

    #[tokio::test]
    async fn test_pause_and_resume_unknown_instance_are_404() {
        for action in ["pause", "resume"] {
            let resp = post(idle_state(), &format!("/api/instances/999999/{action}"), "").await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{action}");
        }
    }

    #[tokio::test]
    async fn test_stop_unknown_instance_is_already_gone() {
        let resp = post(idle_state(), "/api/instances/999999/stop", "").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["process_id"], 999999);
        assert_eq!(json["action"], "stop");
        assert_eq!(json["outcome"], "already_gone");
        assert_eq!(json["affected"], 0);
    }

    #[tokio::test]
    async fn test_non_numeric_pid_is_rejected() {
        let resp = post(idle_state(), "/api/instances/abc/stop", "").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_launch_failure_is_500_with_error_body() {
        let resp = post(idle_state(), "/api/instances", "").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        let msg = json["error"].as_str().unwrap();
        assert!(msg.contains("/nonexistent/worker"), "unexpected: {msg}");
    }

    #[tokio::test]
    async fn test_launch_rejects_malformed_body() {
        let resp = post(idle_state(), "/api/instances", "{not json").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("invalid launch request"));
    }

    #[tokio::test]
    async fn test_submit_site_config_accepts_url_encoded_form() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let state = state_with("/nonexistent/worker", path.clone());

        // name=政策 (percent-encoded UTF-8)
        let form = "name=%E6%94%BF%E7%AD%96&url=https%3A%2F%2Fwww.gov.cn%2F\
                    &title=h1&link=a.item&content=div.body&next_page=a.next";
        let request = Request::builder()
            .method("POST")
            .uri("/api/config")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();
        let resp = send(state, request).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["name"], "政策");
        assert_eq!(json["data"]["selectors"]["next_page"], "a.next");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("政策"));
        let written: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(written[0]["url"], "https://www.gov.cn/");
        assert_eq!(written[0]["selectors"]["title"], "h1");
    }

    #[tokio::test]
    async fn test_submit_site_config_accepts_json_body() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let state = state_with("/nonexistent/worker", path.clone());

        let body = serde_json::json!({
            "name": "国务院政策",
            "url": "https://www.gov.cn/zhengce/",
            "title": "h1::text",
            "link": "ul.list a::attr(href)",
            "content": "div.pages_content",
            "next_page": "a.next::attr(href)"
        });
        let resp = post(state, "/api/config", &body.to_string()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "success");
        assert_eq!(
            json["data"],
            serde_json::json!({
                "name": "国务院政策",
                "url": "https://www.gov.cn/zhengce/",
                "selectors": {
                    "title": "h1::text",
                    "link": "ul.list a::attr(href)",
                    "content": "div.pages_content",
                    "next_page": "a.next::attr(href)"
                }
            })
        );

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, serde_json::json!([json["data"].clone()]));
    }

    #[tokio::test]
    async fn test_submit_site_config_json_missing_field_is_422() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let state = state_with("/nonexistent/worker", path.clone());

        let resp = post(state, "/api/config", r#"{"name": "only"}"#).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().is_some_and(|m| !m.is_empty()));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_submit_site_config_missing_field_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let state = state_with("/nonexistent/worker", path.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/api/config")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("name=only"))
            .unwrap();
        let resp = send(state, request).await;
        assert!(resp.status().is_client_error());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_stream_and_list_with_fake_worker() {
        use crawlctl_test_utils::{FakeWorker, tagged_lines};

        let worker = FakeWorker::tagged_slow(3, 0.1);
        let state = state_with(&worker.program(), worker.dir().join("config.json"));

        let resp = post(state.clone(), "/api/instances", "{}").await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let pid = body_json(resp).await["process_id"].as_u64().unwrap();

        let listed = body_json(get(state.clone(), "/api/instances").await).await;
        assert_eq!(listed[0]["process_id"], pid);
        let status = listed[0]["status"].as_str().unwrap();
        assert!(matches!(status, "spawned" | "running"), "unexpected: {status}");
        assert!(listed[0]["created_at"].is_string());

        let resp = get(state.clone(), &format!("/api/instances/{pid}/stream")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let text = tokio::time::timeout(Duration::from_secs(10), body_text(resp))
            .await
            .unwrap();
        let expected: String = tagged_lines(3).iter().map(|l| format!("{l}\n")).collect();
        assert_eq!(text, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_resume_stop_over_http() {
        use crawlctl_test_utils::FakeWorker;

        let worker = FakeWorker::long_running();
        let state = state_with(&worker.program(), worker.dir().join("config.json"));

        let resp = post(
            state.clone(),
            "/api/instances",
            &format!(r#"{{"output": "{}"}}"#, worker.dir().join("out.json").display()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let pid = body_json(resp).await["process_id"].as_u64().unwrap();

        let paused = body_json(post(state.clone(), &format!("/api/instances/{pid}/pause"), "").await).await;
        assert_eq!(paused["outcome"], "paused");
        assert_eq!(paused["action"], "pause");

        let resumed =
            body_json(post(state.clone(), &format!("/api/instances/{pid}/resume"), "").await).await;
        assert_eq!(resumed["outcome"], "resumed");

        let stopped = body_json(post(state.clone(), &format!("/api/instances/{pid}/stop"), "").await).await;
        assert_eq!(stopped["outcome"], "terminated");

        let listed = body_json(get(state.clone(), "/api/instances").await).await;
        assert_eq!(listed, serde_json::json!([]));

        let resp = get(state, &format!("/api/instances/{pid}/stream")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
