//! HTTP entry points
//!
//! All routes live under `/api/v1`:
//!
//! * `POST /upload` multipart upload (`file`, optional `userId` and `tableName`)
//! * `GET /jobs/:jobId` and `DELETE /jobs/:jobId`
//! * `GET /queue/stats` and `GET /queue/dead-letters?limit=`
//! * `GET /health`

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blob::stream_from_bytes;
use crate::config::ApiConfig;
use crate::queue::{DeadLetter, JobQueue};
use crate::stats::{QueueStatsReport, QueueStatsReporter};
use crate::status::JobStatusStore;
use crate::submit::{Accepted, JobSubmissionService, Upload};
use crate::{Error, Result};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub submissions: JobSubmissionService,
    pub statuses: JobStatusStore,
    pub reporter: QueueStatsReporter,
    pub queue: Arc<dyn JobQueue>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .nest("/api/v1", api_routes(max_upload_bytes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn api_routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/dead-letters", get(dead_letters))
        .route("/health", get(health))
}

/// Serves until `cancel_token` fires, then lets in-flight requests finish.
pub async fn serve(cancel_token: CancellationToken, config: ApiConfig, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind {}: {e}", config.listen)))?;
    info!("Listening on http://{}", config.listen);

    axum::serve(listener, router(state, config.max_upload_bytes))
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await?;

    info!("HTTP server stopped.");
    Ok(())
}

/// POST /api/v1/upload
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Accepted>)> {
    let mut file = None;
    let mut user_id = None;
    let mut table_name = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(format!("Failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("Failed to read file: {e}")))?;
                file = Some((file_name, content_type, data));
            }
            "userId" => user_id = Some(read_text(field).await?),
            "tableName" => table_name = Some(read_text(field).await?),
            other => debug!(field = other, "Ignoring multipart field"),
        }
    }

    let Some((file_name, content_type, data)) = file else {
        return Err(Error::InvalidInput("No file uploaded".into()));
    };
    info!("Received upload: {} ({} bytes)", file_name, data.len());

    let accepted = state
        .submissions
        .submit(Upload {
            file_size: data.len() as u64,
            body: stream_from_bytes(data),
            file_name,
            content_type,
            user_id,
            table_name,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| Error::InvalidInput(format!("Failed to read form field: {e}")))
}

fn job_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "job not found" })),
    )
        .into_response()
}

/// GET /api/v1/jobs/:job_id
async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let Ok(job_id) = job_id.parse::<Uuid>() else {
        return job_not_found();
    };
    match state.statuses.get(job_id).await {
        Some(record) => Json(record).into_response(),
        None => job_not_found(),
    }
}

/// DELETE /api/v1/jobs/:job_id
async fn delete_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let Ok(job_id) = job_id.parse::<Uuid>() else {
        return job_not_found();
    };
    if state.statuses.delete(job_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        job_not_found()
    }
}

/// GET /api/v1/queue/stats
async fn queue_stats(State(state): State<AppState>) -> Json<QueueStatsReport> {
    Json(state.reporter.report().await)
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    limit: Option<usize>,
}

/// GET /api/v1/queue/dead-letters
async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    Ok(Json(state.queue.dead_letters(limit).await?))
}

/// GET /api/v1/health
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
