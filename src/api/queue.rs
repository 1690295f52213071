//! Queue and download HTTP handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path as HttpPath, Query, State};
use axum::response::Response;
use http::header;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::{ApiError, ApiMessage, ApiResult, AppState};
use crate::download::{BookInfo, QueueOrderItem, QueueStatus};

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub status: String,
    pub id: String,
    pub priority: i32,
}

/// Queues a download. The caller supplies the full descriptor; a duplicate
/// enqueue of a live id is a silent no-op.
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(book): Json<BookInfo>,
) -> ApiResult<Json<EnqueueResponse>> {
    if book.id.trim().is_empty() {
        return Err(ApiError::BadRequest("id".to_string()));
    }
    if book.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title".to_string()));
    }

    let id = book.id.clone();
    let priority = book.priority;
    tracing::info!("queueing book {} with priority {}", id, priority);
    state.registry.add(book, priority);

    Ok(Json(EnqueueResponse {
        status: "success".to_string(),
        id,
        priority,
    }))
}

/// All records grouped by status.
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<QueueStatus, HashMap<String, BookInfo>>> {
    Json(state.registry.status())
}

#[derive(Debug, Serialize)]
pub struct QueueOrderResponse {
    pub status: String,
    pub queue: Vec<QueueOrderItem>,
}

pub async fn queue_order(State(state): State<Arc<AppState>>) -> Json<QueueOrderResponse> {
    Json(QueueOrderResponse {
        status: "success".to_string(),
        queue: state.registry.queue_order(),
    })
}

#[derive(Debug, Serialize)]
pub struct ActiveDownloadsResponse {
    pub status: String,
    pub active_downloads: Vec<String>,
}

pub async fn active_downloads(
    State(state): State<Arc<AppState>>,
) -> Json<ActiveDownloadsResponse> {
    Json(ActiveDownloadsResponse {
        status: "success".to_string(),
        active_downloads: state.registry.active_downloads(),
    })
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    HttpPath(id): HttpPath<String>,
) -> ApiResult<Json<ApiMessage>> {
    if state.registry.cancel(&id) {
        tracing::info!("download {} cancelled", id);
        Ok(Json(ApiMessage::success("download cancelled")))
    } else {
        Err(ApiError::NotFound(id))
    }
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: i32,
}

pub async fn set_priority(
    State(state): State<Arc<AppState>>,
    HttpPath(id): HttpPath<String>,
    Json(req): Json<PriorityRequest>,
) -> ApiResult<Json<ApiMessage>> {
    if state.registry.set_priority(&id, req.priority) {
        Ok(Json(ApiMessage::success("priority updated")))
    } else {
        Err(ApiError::NotFound(id))
    }
}

pub async fn reorder(
    State(state): State<Arc<AppState>>,
    Json(priorities): Json<HashMap<String, i32>>,
) -> Json<ApiMessage> {
    tracing::info!("reordering {} queue entries", priorities.len());
    state.registry.reorder(&priorities);
    Json(ApiMessage::success("queue reordered"))
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub status: String,
    pub cleared: usize,
}

pub async fn clear_completed(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let cleared = state.registry.clear_completed();
    tracing::info!("cleared {} completed records", cleared);
    Json(ClearResponse {
        status: "success".to_string(),
        cleared,
    })
}

#[derive(Debug, Deserialize)]
pub struct LocalDownloadQuery {
    pub id: String,
}

/// Streams an ingested book back to the client.
pub async fn local_download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocalDownloadQuery>,
) -> ApiResult<Response> {
    let (book, status) = state
        .registry
        .book_with_status(&query.id)
        .ok_or_else(|| ApiError::NotFound(query.id.clone()))?;

    if status != QueueStatus::Available {
        return Err(ApiError::NotAvailable(query.id));
    }
    let Some(path) = book.download_path else {
        return Err(ApiError::NotAvailable(query.id));
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("file for {} missing at {}: {}", query.id, path, e);
            state.registry.mark_file_missing(&query.id);
            return Err(ApiError::FileMissing(query.id));
        }
    };

    let filename = std::path::Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.epub", query.id));
    // keep header-hostile characters out of Content-Disposition
    let safe_filename = filename.replace(['"', '\\', '\n', '\r', '\t'], "_");

    let stream = ReaderStream::new(file);
    let body = axum::body::Body::from_stream(stream);

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{safe_filename}\""),
        )
        .body(body)
        .map_err(|e| ApiError::Internal(format!("failed to build response: {e}")))
}
