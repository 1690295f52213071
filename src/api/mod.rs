//! HTTP surface of the service.
//!
//! A thin adapter: every handler maps one route onto one registry or
//! filesystem operation. The interesting behavior all lives in
//! [`crate::download`].

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::download::Registry;

pub mod queue;

/// Shared state handed to every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub auth: Authenticator,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid field: {0}")]
    BadRequest(String),
    #[error("unknown book id: {0}")]
    NotFound(String),
    #[error("book {0} is not available yet")]
    NotAvailable(String),
    #[error("file for {0} is no longer on disk")]
    FileMissing(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotAvailable(_) => StatusCode::CONFLICT,
            ApiError::FileMissing(_) => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiMessage::error(self.to_string()));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Uniform `{status, message}` envelope for simple responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiMessage {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiMessage {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }
}

/// Create the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/download", post(queue::enqueue))
        .route("/download/{id}/cancel", delete(queue::cancel))
        .route("/status", get(queue::status))
        .route("/queue/order", get(queue::queue_order))
        .route("/queue/reorder", post(queue::reorder))
        .route("/queue/{id}/priority", put(queue::set_priority))
        .route("/queue/clear", delete(queue::clear_completed))
        .route("/downloads/active", get(queue::active_downloads))
        .route("/localdownload", get(queue::local_download))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::basic_auth,
        ))
        // liveness probe stays outside authentication
        .route("/health", get(health));

    Router::new()
        .nest("/api", api)
        .with_state(state)
        .layer(middleware::from_fn(log_request))
}

async fn health() -> &'static str {
    "OK"
}

// Middleware function to log requests
async fn log_request(req: Request, next: Next) -> impl IntoResponse {
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    let start = Instant::now();
    let response = next.run(req).await;

    tracing::debug!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status(),
        start.elapsed()
    );
    response
}
