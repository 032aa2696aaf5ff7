//! The worker's HTTP surface: `executeCommand`, `ready`, and
//! `getPublicMethods` under the configured url prefix, wrapped in a
//! permissive CORS layer and a gate that answers 503 once shutdown begins.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use crate::plugin::dispatch::Command;
use crate::plugin::loader::PluginLoader;

const ALLOWED_METHODS: &str = "GET, PUT, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Content-Length, X-Content-Length, \
     Access-Control-Allow-Origin, User-Agent, Authorization";

#[derive(Clone)]
pub struct WorkerState {
    pub loader: PluginLoader,
    pub shutting_down: watch::Receiver<bool>,
}

/// Collapse a configured prefix to `""` or `"/segment[/…]"`.
pub fn normalize_prefix(url_prefix: &str) -> String {
    let trimmed = url_prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

pub fn router(state: Arc<WorkerState>, url_prefix: &str) -> Router {
    let prefix = normalize_prefix(url_prefix);
    Router::new()
        .route(&format!("{prefix}/executeCommand"), put(execute_command))
        .route(&format!("{prefix}/ready"), get(ready))
        .route(&format!("{prefix}/getPublicMethods"), get(missing_plugin_name))
        .route(
            &format!("{prefix}/getPublicMethods/:plugin_name"),
            get(public_methods),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            shutdown_gate,
        ))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Reject everything with 503 once the worker is draining.
async fn shutdown_gate(
    State(state): State<Arc<WorkerState>>,
    req: Request,
    next: Next,
) -> Response {
    if *state.shutting_down.borrow() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"statusCode": 503, "result": "shutting down"})),
        )
            .into_response();
    }
    next.run(req).await
}

/// Mirror the request Origin (or Host, or `*`) and advertise the fixed
/// method/header lists. Preflights short-circuit with 204.
async fn cors(req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .or_else(|| req.headers().get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string();

    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_str(&origin).unwrap_or(HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    response
}

async fn execute_command(State(state): State<Arc<WorkerState>>, body: Bytes) -> Response {
    let cmd: Command = match serde_json::from_slice(&body) {
        Ok(cmd) => cmd,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"statusCode": 400, "result": "Invalid body"})),
            )
                .into_response();
        }
    };

    match state.loader.execute_command(cmd).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "statusCode": 200,
                "operationType": outcome.operation_type,
                "result": outcome.result,
            })),
        )
            .into_response(),
        Err(err) => {
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({
                    "statusCode": err.status_code(),
                    "result": {
                        "message": err.to_string(),
                        "stack": format!("{err:?}"),
                    },
                })),
            )
                .into_response()
        }
    }
}

async fn ready(State(state): State<Arc<WorkerState>>) -> Response {
    if state.loader.is_initialized() && !state.loader.is_restarting() {
        Json(json!({
            "status": "ready",
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response()
    } else {
        Json(json!("not-ready")).into_response()
    }
}

async fn missing_plugin_name() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"statusCode": 400, "result": "Missing plugin name"})),
    )
        .into_response()
}

async fn public_methods(
    State(state): State<Arc<WorkerState>>,
    Path(plugin_name): Path<String>,
) -> Response {
    if plugin_name.trim().is_empty() {
        return missing_plugin_name().await;
    }
    match state.loader.get_public_methods(&plugin_name).await {
        Some(methods) => Json(json!(methods)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"statusCode": 404, "result": format!("Unknown plugin `{plugin_name}`")})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupRegistry;
    use crate::config::Settings;
    use crate::plugin::testing::TestPlugin;
    use crate::response::ResponseEngine;
    use serde_json::Value;
    use std::time::Duration;

    async fn spawn_worker_http(
        plugins: Vec<TestPlugin>,
        initialized: bool,
    ) -> (String, watch::Sender<bool>, PluginLoader) {
        let settings = Settings {
            internal_webhook_url: Some("http://127.0.0.1:9/hooks".into()),
            webhook_expiry: Duration::from_secs(30),
            ..Default::default()
        };
        let engine = ResponseEngine::new(settings, CleanupRegistry::new());
        let loader = PluginLoader::new(std::env::temp_dir(), engine);
        for plugin in plugins {
            loader.register_instance(Arc::new(plugin)).unwrap();
        }
        if initialized {
            // no modules on disk; marks the loader initialized
            loader.init_with(Vec::new()).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(WorkerState {
            loader: loader.clone(),
            shutting_down: shutdown_rx,
        });
        let app = router(state, "api");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/api"), shutdown_tx, loader)
    }

    #[tokio::test]
    async fn execute_command_sync_roundtrip() {
        let (base, _guard, _) = spawn_worker_http(vec![TestPlugin::new("A")], true).await;
        let client = reqwest::Client::new();
        let resp = client
            .put(format!("{base}/executeCommand"))
            .json(&json!({
                "forWhom": "t",
                "pluginName": "A",
                "name": "testMethod",
                "args": [],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["statusCode"], json!(200));
        assert_eq!(body["operationType"], json!("sync"));
        assert_eq!(body["result"], json!("Hello from A"));
    }

    #[tokio::test]
    async fn invalid_body_is_a_400() {
        let (base, _guard, _) = spawn_worker_http(vec![], true).await;
        let client = reqwest::Client::new();
        let resp = client
            .put(format!("{base}/executeCommand"))
            .header(header::CONTENT_TYPE, "application/json")
            .body("this is not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"], json!("Invalid body"));
    }

    #[tokio::test]
    async fn dispatch_errors_use_the_500_envelope() {
        let (base, _guard, _) = spawn_worker_http(vec![TestPlugin::new("A")], true).await;
        let client = reqwest::Client::new();
        let resp = client
            .put(format!("{base}/executeCommand"))
            .json(&json!({
                "forWhom": "t",
                "pluginName": "ghost",
                "name": "testMethod",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["statusCode"], json!(500));
        assert!(body["result"]["message"].as_str().unwrap().contains("ghost"));
        assert!(body["result"]["stack"].is_string());
    }

    #[tokio::test]
    async fn ready_reflects_loader_initialization() {
        let (base, _guard, loader) = spawn_worker_http(vec![], false).await;
        let client = reqwest::Client::new();

        let body: Value = client
            .get(format!("{base}/ready"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!("not-ready"));

        loader.init_with(Vec::new()).await.unwrap();
        let body: Value = client
            .get(format!("{base}/ready"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], json!("ready"));
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn get_public_methods_endpoint() {
        let (base, _guard, _) = spawn_worker_http(vec![TestPlugin::new("A")], true).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/getPublicMethods/A"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!(["testMethod", "echo"]));

        let resp = client
            .get(format!("{base}/getPublicMethods/nope"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .get(format!("{base}/getPublicMethods"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn cors_headers_mirror_the_origin() {
        let (base, _guard, _) = spawn_worker_http(vec![], true).await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/ready"))
            .header(header::ORIGIN, "http://example.com")
            .send()
            .await
            .unwrap();
        let headers = resp.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://example.com"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            ALLOWED_METHODS
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn shutdown_gate_returns_503() {
        let (base, shutdown_tx, _) = spawn_worker_http(vec![], true).await;
        shutdown_tx.send(true).unwrap();
        let client = reqwest::Client::new();
        let resp = client.get(format!("{base}/ready")).send().await.unwrap();
        assert_eq!(resp.status(), 503);
    }
}
