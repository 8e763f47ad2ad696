use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::{tokens_match, ApiAuth, AppState};

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
        .into_response()
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "opsdeck server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    tracing::info!("opsdeck server stopped");
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/commands", get(command_state).post(run_command))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, max-age=0"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::PRAGMA,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::EXPIRES,
            HeaderValue::from_static("0"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::VARY,
            HeaderValue::from_static("Authorization"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cross-origin-resource-policy"),
            HeaderValue::from_static("same-origin"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
        ))
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS || request.uri().path() == "/global/health" {
        return next.run(request).await;
    }

    let expected = match &state.auth {
        ApiAuth::Token(token) => token.clone(),
        ApiAuth::Misconfigured => {
            tracing::error!("refusing request: no API token configured in production");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server misconfigured",
                "SERVER_MISCONFIGURED",
            );
        }
    };

    let provided = extract_request_token(request.headers());
    if provided
        .as_deref()
        .is_some_and(|token| tokens_match(token, &expected))
    {
        return next.run(request).await;
    }

    error_response(
        StatusCode::UNAUTHORIZED,
        "Unauthorized: missing or invalid API token",
        "AUTH_REQUIRED",
    )
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn is_json_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("application/json"))
}

async fn global_health() -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn command_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.state().await)
}

async fn run_command(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json_request(&headers) {
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
            "UNSUPPORTED_MEDIA_TYPE",
        );
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body", "INVALID_JSON")
        }
    };

    // `commandId` is the older name for the same field.
    let task_id = payload
        .get("taskId")
        .or_else(|| payload.get("commandId"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if task_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "taskId is required", "INVALID_REQUEST");
    }
    let params = payload
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match state.orchestrator.run_task(task_id, params).await {
        Ok(run) => Json(json!({ "success": true, "run": run })).into_response(),
        Err(err) => {
            let status = StatusCode::from_u16(err.kind().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                tracing::error!(task_id, error = %err, "command failed");
            }
            error_response(status, err.to_string(), err.code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use opsdeck_observability::ProcessKind;
    use opsdeck_orchestrator::{Orchestrator, OrchestratorConfig};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_workspace() -> TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).expect("scripts dir");
        std::fs::write(scripts.join("engage-x.js"), "sleep 1\n").expect("script");
        dir
    }

    fn test_state(dir: &TempDir, auth: ApiAuth) -> AppState {
        let mut config = OrchestratorConfig::for_workspace(dir.path());
        config.task_env.node_bin = "sh".to_string();
        AppState::new(Orchestrator::new(config, ProcessKind::Server), auth)
    }

    fn token_auth() -> ApiAuth {
        ApiAuth::resolve(Some(TOKEN), true)
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, headers, payload)
    }

    #[tokio::test]
    async fn health_is_public_and_carries_security_headers() {
        let dir = test_workspace();
        let app = app_router(test_state(&dir, token_auth()));
        let req = Request::builder()
            .uri("/global/health")
            .body(Body::empty())
            .expect("request");
        let (status, headers, payload) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.get("ok").and_then(Value::as_bool), Some(true));
        assert_eq!(headers[header::CACHE_CONTROL], "no-store, max-age=0");
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::REFERRER_POLICY], "no-referrer");
        assert_eq!(headers[header::EXPIRES], "0");
        assert_eq!(headers[header::VARY], "Authorization");
        assert_eq!(headers["cross-origin-resource-policy"], "same-origin");
        assert_eq!(
            headers["permissions-policy"],
            "camera=(), microphone=(), geolocation=()"
        );
    }

    #[tokio::test]
    async fn state_requires_bearer_token() {
        let dir = test_workspace();
        let app = app_router(test_state(&dir, token_auth()));

        let req = Request::builder()
            .uri("/api/commands")
            .body(Body::empty())
            .expect("request");
        let (status, headers, payload) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(payload["code"], "AUTH_REQUIRED");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::VARY], "Authorization");

        let req = Request::builder()
            .uri("/api/commands")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/commands")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .expect("request");
        let (status, _, payload) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["executorMode"], "local");
        assert_eq!(payload["tasks"].as_array().map(Vec::len), Some(5));
        assert_eq!(payload["runningCount"], 0);
    }

    #[tokio::test]
    async fn production_without_token_is_misconfigured() {
        let dir = test_workspace();
        let app = app_router(test_state(&dir, ApiAuth::resolve(None, true)));

        let req = Request::builder()
            .uri("/api/commands")
            .header(header::AUTHORIZATION, "Bearer ghostai-dev-token")
            .body(Body::empty())
            .expect("request");
        let (status, _, payload) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(payload["code"], "SERVER_MISCONFIGURED");

        let req = Request::builder()
            .uri("/global/health")
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn development_accepts_fallback_token() {
        let dir = test_workspace();
        let app = app_router(test_state(&dir, ApiAuth::resolve(None, false)));
        let req = Request::builder()
            .uri("/api/commands")
            .header(header::AUTHORIZATION, "bearer ghostai-dev-token")
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn post_rejects_non_json_and_blank_task_ids() {
        let dir = test_workspace();
        let app = app_router(test_state(&dir, token_auth()));

        let req = Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("taskId=engage-x"))
            .expect("request");
        let (status, _, _) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let (status, _, payload) = send(app.clone(), post_json(json!({ "taskId": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["error"], "taskId is required");

        let req = Request::builder()
            .method("POST")
            .uri("/api/commands")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, _, payload) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_JSON");
    }

    #[tokio::test]
    async fn post_maps_orchestrator_errors_to_status_codes() {
        let dir = test_workspace();
        let app = app_router(test_state(&dir, token_auth()));

        let (status, _, payload) =
            send(app.clone(), post_json(json!({ "taskId": "unknown-id" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "UNKNOWN_TASK");

        let (status, _, payload) = send(
            app.clone(),
            post_json(json!({ "taskId": "post-all-video", "params": { "xCaption": "hi" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_PARAMS");
        assert_eq!(payload["error"], "videoFile is required");

        let (status, _, payload) = send(
            app.clone(),
            post_json(json!({ "commandId": "engage-x", "params": { "limit": 999 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["success"], true);
        assert_eq!(payload["run"]["status"], "running");
        assert_eq!(
            payload["run"]["commandLine"],
            "sh scripts/engage-x.js --limit=25"
        );

        let (status, _, payload) = send(
            app,
            post_json(json!({ "taskId": "engage-x", "params": "ignored" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["code"], "BUSY");
        assert_eq!(payload["error"], "Engage X is already running");
    }

    #[tokio::test]
    async fn missing_workspace_is_a_server_error() {
        let dir = test_workspace();
        let mut config = OrchestratorConfig::for_workspace(dir.path().join("gone"));
        config.task_env.node_bin = "sh".to_string();
        let state = AppState::new(Orchestrator::new(config, ProcessKind::Server), token_auth());
        let (status, _, payload) =
            send(app_router(state), post_json(json!({ "taskId": "engage-x" }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(payload["code"], "WORKSPACE_MISSING");
    }
}
