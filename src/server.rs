//! HTTP front door: `/{identity}/...` is proxied into that identity's
//! worker process, `/containers/{identity}/...` exposes status and control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::container::models::{ScheduleWhen, Signal};
use crate::container::{ActorRegistry, TaskHandlers};
use crate::container::registry::validate_identity;
use crate::errors::SupervisorError;

/// How often dormant actors are dropped from the registry.
const DORMANT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration for the front-door listener.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

pub type SharedRegistry = Arc<ActorRegistry>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/containers/{identity}/status", get(container_status))
        .route("/containers/{identity}/stop", post(stop_container))
        .route("/containers/{identity}/destroy", post(destroy_container))
        .route("/containers/{identity}/schedule", post(schedule_task))
        .route(
            "/containers/{identity}/schedule/{task_id}",
            axum::routing::delete(cancel_task),
        )
        .route("/{identity}", any(proxy))
        .route("/{identity}/{*rest}", any(proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn lookup(
    registry: &ActorRegistry,
    identity: &str,
) -> Result<Arc<crate::container::ContainerActor>, ApiError> {
    validate_identity(identity).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    registry
        .get(identity)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Container {} not found", identity)))
}

async fn container_status(
    State(registry): State<SharedRegistry>,
    Path(identity): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = lookup(&registry, &identity).await?;
    let status = actor.status().await?;
    let tasks = actor.list_scheduled_tasks().await?;
    Ok(Json(serde_json::json!({
        "identity": identity,
        "state": status,
        "running": actor.is_running(),
        "open_streams": actor.open_streams(),
        "scheduled_tasks": tasks,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    pub signal: Option<String>,
}

async fn stop_container(
    State(registry): State<SharedRegistry>,
    Path(identity): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = lookup(&registry, &identity).await?;
    let signal = body
        .and_then(|Json(req)| req.signal)
        .map(|s| s.parse::<Signal>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    actor.stop(signal).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn destroy_container(
    State(registry): State<SharedRegistry>,
    Path(identity): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = lookup(&registry, &identity).await?;
    actor.destroy().await?;
    Ok(StatusCode::ACCEPTED)
}

/// Callbacks available to tasks scheduled over HTTP.
pub fn builtin_handlers() -> TaskHandlers {
    TaskHandlers::new()
        .register_fn("stop", |actor, payload, _task| async move {
            let signal = payload
                .get("signal")
                .and_then(|v| v.as_str())
                .map(|s| s.parse::<Signal>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            actor.stop(signal).await?;
            anyhow::Ok(())
        })
        .register_fn("destroy", |actor, _payload, _task| async move {
            actor.destroy().await?;
            anyhow::Ok(())
        })
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub callback: String,
    pub at: Option<DateTime<Utc>>,
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

async fn schedule_task(
    State(registry): State<SharedRegistry>,
    Path(identity): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = lookup(&registry, &identity).await?;
    let when = match (req.at, req.delay_secs) {
        (Some(at), None) => ScheduleWhen::At(at),
        (None, Some(secs)) => ScheduleWhen::Delay(Duration::from_secs(secs)),
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of 'at' or 'delay_secs' is required".to_string(),
            ));
        }
    };
    let task = actor
        .schedule(when, &req.callback, req.payload)
        .await
        .map_err(|e| match e {
            SupervisorError::UnknownCallback { .. } | SupervisorError::ScheduleOutOfRange(_) => {
                ApiError::BadRequest(e.to_string())
            }
            other => other.into(),
        })?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn cancel_task(
    State(registry): State<SharedRegistry>,
    Path((identity, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = lookup(&registry, &identity).await?;
    if actor.cancel_scheduled_task(&task_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Task {} not found", task_id)))
    }
}

/// Forward the request to the identity's process with the identity prefix
/// stripped from the path.
async fn proxy(
    State(registry): State<SharedRegistry>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request<Body>,
) -> Result<Response, ApiError> {
    let identity = params
        .get("identity")
        .ok_or_else(|| ApiError::BadRequest("missing identity".to_string()))?;
    validate_identity(identity).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let rest = params.get("rest").map(String::as_str).unwrap_or("");
    let path_and_query = match req.uri().query() {
        Some(query) => format!("/{}?{}", rest, query),
        None => format!("/{}", rest),
    };
    *req.uri_mut() = path_and_query
        .parse::<Uri>()
        .map_err(|e| ApiError::BadRequest(format!("Invalid request path: {}", e)))?;

    let actor = registry
        .get_or_create(identity)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(actor.fetch(req, None).await)
}

// ── Server ────────────────────────────────────────────────────────────

/// Serve until Ctrl-C, then stop every actor's alarm driver.
pub async fn start_server(config: ServerConfig, registry: SharedRegistry) -> Result<()> {
    let app = build_router(Arc::clone(&registry));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "sandbox supervisor listening");
    registry.spawn_reaper(DORMANT_SWEEP_INTERVAL);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C, shutting down");
        return;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerSettings;
    use crate::container::control::ProcessControl;
    use crate::container::testing::FakeControl;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> (Router, SharedRegistry, Arc<FakeControl>) {
        let control = Arc::new(FakeControl::new());
        let shared = Arc::clone(&control);
        let settings = ContainerSettings {
            default_port: Some(8080),
            wait_interval: std::time::Duration::from_millis(5),
            ..ContainerSettings::default()
        };
        let registry = Arc::new(
            ActorRegistry::new(
                settings,
                None,
                Arc::new(move |_: &str| -> Result<Arc<dyn ProcessControl>> {
                    Ok(Arc::clone(&shared) as Arc<dyn ProcessControl>)
                }),
            )
            .with_handlers(builtin_handlers()),
        );
        (build_router(Arc::clone(&registry)), registry, control)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _, _) = test_router();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_proxy_strips_identity_prefix() {
        let (app, registry, control) = test_router();
        let response = app
            .oneshot(
                Request::post("/tenant-a/api/run?verbose=1")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(control.forwarded(), vec!["/api/run?verbose=1"]);
        assert_eq!(registry.identities().await, vec!["tenant-a"]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_proxy_rejects_invalid_identity() {
        let (app, _, _) = test_router();
        let response = app
            .oneshot(Request::get("/bad.identity/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_of_unknown_container_is_404() {
        let (app, _, _) = test_router();
        let response = app
            .oneshot(
                Request::get("/containers/nobody/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_status_and_stop_after_proxying() {
        let (app, registry, control) = test_router();
        app.clone()
            .oneshot(Request::get("/tenant-b/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get("/containers/tenant-b/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"]["status"], "healthy");
        assert_eq!(json["running"], true);

        let response = app
            .oneshot(
                Request::post("/containers/tenant-b/stop")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"signal": "SIGINT"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(control.signals(), vec![Signal::Interrupt]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_and_cancel_task() {
        let (app, registry, _) = test_router();
        registry.get_or_create("tenant-c").await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::post("/containers/tenant-c/schedule")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"callback": "stop", "delay_secs": 600, "payload": {"signal": "TERM"}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task = body_json(response).await;
        assert_eq!(task["callback"], "stop");
        let id = task["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/containers/tenant-c/schedule/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::post("/containers/tenant-c/schedule")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"callback": "reboot", "delay_secs": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_with_huge_delay_is_rejected() {
        let (app, registry, _) = test_router();
        registry.get_or_create("tenant-d").await.unwrap();

        let response = app
            .oneshot(
                Request::post("/containers/tenant-d/schedule")
                    .header("content-type", "application/json")
                    .body(Body::from(format!(
                        r#"{{"callback": "stop", "delay_secs": {}}}"#,
                        u64::MAX
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("out of range"));
        let actor = registry.get("tenant-d").await.unwrap();
        assert!(actor.list_scheduled_tasks().await.unwrap().is_empty());
        registry.shutdown().await;
    }
}
