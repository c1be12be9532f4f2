//! HTTP surface: `/`, `/health` and `/tuya/command`.

use crate::device::{Action, DeviceControl};
use crate::dispatcher::{CommandRequest, Dispatcher};
use crate::error::DispatchError;
use crate::scanner::Discovery;
use axum::{Json, Router};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use log::{error, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const BANNER: &str = "tuya-relay is running";
const INVALID_ACTION: &str = "action must be 'on' or 'off'";

/// Shared state handed to every handler.
pub struct AppState<D, C> {
    dispatcher: Arc<Dispatcher<D, C>>,
    limiter: Arc<Semaphore>,
    request_timeout: Duration,
}

impl<D, C> Clone for AppState<D, C> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            limiter: self.limiter.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<D: Discovery, C: DeviceControl> AppState<D, C> {
    pub fn new(
        dispatcher: Dispatcher<D, C>,
        max_concurrent_commands: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            limiter: Arc::new(Semaphore::new(max_concurrent_commands.max(1))),
            request_timeout,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<D, C> {
        &self.dispatcher
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    site: String,
}

#[derive(Debug, Serialize)]
struct CommandReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// A failed command request, rendered as `{"ok":false,"error":...}`.
pub struct ServiceError(StatusCode, String);

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        ServiceError(StatusCode::BAD_REQUEST, message.into())
    }

    fn internal(message: impl Into<String>) -> Self {
        ServiceError(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        error!("[ERROR] /tuya/command ({}): {}", self.0.as_u16(), self.1);

        let body = CommandReply {
            ok: false,
            error: Some(self.1),
        };
        (self.0, Json(body)).into_response()
    }
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::InvalidAction(_) => ServiceError::bad_request(INVALID_ACTION),
            other => ServiceError::internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(value: JsonRejection) -> Self {
        ServiceError::internal(value.body_text())
    }
}

pub fn router<D: Discovery, C: DeviceControl>(state: AppState<D, C>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health::<D, C>))
        .route("/tuya/command", post(command::<D, C>))
        .fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    let (method, uri) = (request.method().clone(), request.uri().clone());
    let response = next.run(request).await;
    info!("[HTTP] {} {} -> {}", method, uri, response.status().as_u16());
    response
}

async fn banner() -> impl IntoResponse {
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], BANNER)
}

async fn health<D: Discovery, C: DeviceControl>(
    State(state): State<AppState<D, C>>,
) -> impl IntoResponse {
    let body = Health {
        status: "ok",
        site: state.dispatcher.site_name().to_string(),
    };
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(body))
}

async fn command<D: Discovery, C: DeviceControl>(
    State(state): State<AppState<D, C>>,
    body: Bytes,
) -> Result<Json<CommandReply>, ServiceError> {
    // Decoded by hand so the Content-Type header is not required.
    let Json(request) = Json::<CommandRequest>::from_bytes(&body)?;
    if request.action().parse::<Action>().is_err() {
        return Err(ServiceError::bad_request(INVALID_ACTION));
    }

    let work = async {
        let _permit = state
            .limiter
            .acquire()
            .await
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        state.dispatcher.dispatch(&request).await?;
        Ok::<(), ServiceError>(())
    };
    tokio::time::timeout(state.request_timeout, work)
        .await
        .map_err(|_| DispatchError::TimedOut(state.request_timeout))??;

    Ok(Json(CommandReply {
        ok: true,
        error: None,
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
