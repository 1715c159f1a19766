//! Fetch proxy: forwards inbound HTTP exchanges to the worker process.
//!
//! The caller always gets a well-formed response. Start failures and
//! transport errors are turned into JSON error bodies (503 for capacity,
//! 500 for everything else).

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;

use super::activity::TrackedStream;
use super::actor::{ContainerActor, WaitOptions};
use super::models::ProcessState;
use crate::errors::SupervisorError;

/// Error shape returned to proxy callers.
pub enum ProxyError {
    Unavailable(String),
    Internal(String),
}

impl From<SupervisorError> for ProxyError {
    fn from(err: SupervisorError) -> Self {
        if err.is_no_instance() {
            ProxyError::Unavailable(err.to_string())
        } else {
            ProxyError::Internal(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ProxyError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ProxyError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl ContainerActor {
    /// Forward `request` to `port` (or the configured default), starting the
    /// process first when it is not running and healthy.
    pub async fn fetch(self: &Arc<Self>, request: Request<Body>, port: Option<u16>) -> Response<Body> {
        match self.try_fetch(request, port).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn try_fetch(
        self: &Arc<Self>,
        request: Request<Body>,
        port: Option<u16>,
    ) -> Result<Response<Body>, ProxyError> {
        let port = port
            .or(self.settings.default_port)
            .or_else(|| self.settings.required_ports.first().copied())
            .ok_or_else(|| {
                ProxyError::Internal("no port configured for this container".to_string())
            })?;

        let healthy = self.status().await?.state == ProcessState::Healthy;
        if !self.control.is_running() || !healthy {
            if let Err(err) = self
                .start_and_wait_for_ports(Some(vec![port]), WaitOptions::default())
                .await
            {
                tracing::warn!(identity = %self.identity, port, error = %err, "container failed to start for request");
                return Err(err.into());
            }
        }

        self.activity.renew();

        let (parts, body) = request.into_parts();
        let body = Body::from_stream(TrackedStream::new(
            body.into_data_stream(),
            self.activity.open_stream(),
        ));
        let request = Request::from_parts(parts, body);

        let response = self.control.forward(port, request).await.map_err(|e| {
            tracing::error!(identity = %self.identity, port, error = %e, "failed to forward request");
            ProxyError::Internal(format!("Failed to proxy request to container: {}", e))
        })?;

        let (parts, body) = response.into_parts();
        let body = Body::from_stream(TrackedStream::new(
            body.into_data_stream(),
            self.activity.open_stream(),
        ));
        Ok(Response::from_parts(parts, body))
    }
}
