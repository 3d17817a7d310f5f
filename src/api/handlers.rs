use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::error::{ApiError, ApiResult};
use super::preview::{preview_messages, preview_result};
use super::ApiState;
use crate::scheduler::{ChatMessage, JobRecord, JobStatus, WorkerRecord};

const WORKER_HEADER: &str = "X-Worker-ID";
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Condensed job listing for `/recent_jobs`.
#[derive(Serialize)]
struct JobSummary {
    job_id: String,
    status: JobStatus,
    preview: Option<String>,
    result_preview: Option<String>,
    error: Option<String>,
    created_at: f64,
    updated_at: f64,
    completed_at: Option<f64>,
    metadata: Option<Value>,
    messages: Vec<ChatMessage>,
    result: Option<Value>,
}

impl From<JobRecord> for JobSummary {
    fn from(job: JobRecord) -> Self {
        Self {
            preview: preview_messages(&job.messages),
            result_preview: preview_result(job.result.as_ref()),
            job_id: job.job_id,
            status: job.status,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            metadata: job.metadata,
            messages: job.messages,
            result: job.result,
        }
    }
}

fn require_json(body: &[u8]) -> ApiResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ApiError::BadRequest(
            "Invalid or missing JSON payload.".to_string(),
        )),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn non_empty_str(payload: &Map<String, Value>, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn present(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

pub(super) async fn submit_job(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut payload = require_json(&body)?;

    let raw_messages = match payload.remove("messages") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => {
            return Err(ApiError::BadRequest(
                "`messages` must be a non-empty list.".to_string(),
            ))
        }
    };
    let messages = raw_messages
        .into_iter()
        .map(serde_json::from_value::<ChatMessage>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(format!("Invalid message entry: {}", e)))?;
    let metadata = present(payload.remove("metadata"));

    let preview = preview_messages(&messages);
    let count = messages.len();
    let logged_payload = state
        .debug_payloads
        .then(|| serde_json::to_string(&messages).unwrap_or_default());

    let job_id = state.queue.submit(messages, metadata.clone()).await?;

    match logged_payload {
        Some(full) => tracing::info!(
            job_id = %job_id,
            payload = %full,
            metadata = ?metadata,
            "Accepted job"
        ),
        None => tracing::info!(job_id = %job_id, messages = count, preview = ?preview, "Accepted job"),
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": job_id, "status": JobStatus::Queued })),
    ))
}

pub(super) async fn get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let worker_id = header_str(&headers, WORKER_HEADER).unwrap_or("unknown");
    tracing::debug!(worker_id, "Worker requested next job");

    let Some(job) = state.queue.dequeue().await? else {
        match state.queue.stats().await {
            Ok(stats) => tracing::debug!(
                worker_id,
                queued = stats.queued_count,
                processing = stats.processing_count,
                "No jobs available"
            ),
            Err(e) => tracing::warn!(worker_id, error = %e, "No jobs available; stats unreadable"),
        }
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    if state.debug_payloads {
        tracing::info!(
            job_id = %job.job_id,
            worker_id,
            payload = ?job.messages,
            metadata = ?job.metadata,
            "Assigned job"
        );
    } else {
        tracing::info!(
            job_id = %job.job_id,
            worker_id,
            preview = ?preview_messages(&job.messages),
            "Assigned job"
        );
    }

    Ok(Json(job).into_response())
}

pub(super) async fn complete_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<JobRecord>> {
    let mut payload = require_json(&body)?;

    let (Some(job_id), Some(status)) = (
        non_empty_str(&payload, "job_id"),
        non_empty_str(&payload, "status"),
    ) else {
        return Err(ApiError::BadRequest(
            "`job_id` and `status` are required.".to_string(),
        ));
    };

    let status = status
        .parse::<JobStatus>()
        .ok()
        .filter(|s| s.is_terminal())
        .ok_or_else(|| {
            ApiError::BadRequest("`status` must be 'completed' or 'failed'.".to_string())
        })?;

    let result = present(payload.remove("result"));
    let error = present(payload.remove("error")).map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    });
    let worker_id = header_str(&headers, WORKER_HEADER).unwrap_or("unknown");

    let record = state
        .queue
        .complete(&job_id, status, result, error)
        .await?;

    if state.debug_payloads {
        tracing::info!(
            job_id = %job_id,
            worker_id,
            status = %status,
            result = ?record.result,
            error = ?record.error,
            "Worker reported job"
        );
    } else {
        tracing::info!(
            job_id = %job_id,
            worker_id,
            status = %status,
            result = ?preview_result(record.result.as_ref()),
            error = ?record.error,
            "Worker reported job"
        );
    }

    Ok(Json(record))
}

pub(super) async fn get_result(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.queue.inspect(&job_id).await?))
}

pub(super) async fn stats(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let stats = state.queue.stats().await?;
    Ok(Json(json!(stats)))
}

pub(super) async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    if state.queue.health().await {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error" })),
        )
    }
}

pub(super) async fn recent_jobs(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let limit = params
        .get("limit")
        .map(String::as_str)
        .unwrap_or("10")
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("`limit` must be an integer.".to_string()))?;

    let jobs = state.queue.recent_jobs(limit.clamp(1, 100) as usize).await?;
    let summaries: Vec<JobSummary> = jobs.into_iter().map(JobSummary::from).collect();
    Ok(Json(json!(summaries)))
}

pub(super) async fn register_worker(
    State(state): State<ApiState>,
    request: Request,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let headers = request.headers().clone();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::BadRequest("Invalid or missing JSON payload.".to_string()))?;
    let payload = require_json(&body)?;

    let worker_id = non_empty_str(&payload, "worker_id")
        .or_else(|| header_str(&headers, WORKER_HEADER).map(str::to_string))
        .ok_or_else(|| ApiError::BadRequest("`worker_id` is required.".to_string()))?;

    let mut metadata = match payload.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let hostname = non_empty_str(&payload, "hostname")
        .or_else(|| non_empty_str(&metadata, "hostname"))
        .or(peer);
    let model = non_empty_str(&payload, "model").or_else(|| non_empty_str(&metadata, "model"));
    let user_agent = header_str(&headers, header::USER_AGENT.as_str()).map(str::to_string);

    metadata.insert("hostname".to_string(), json!(hostname));
    metadata.insert("user_agent".to_string(), json!(user_agent));
    metadata.insert("model".to_string(), json!(model));

    state.queue.register_worker(&worker_id, metadata).await?;
    tracing::debug!(worker_id = %worker_id, hostname = ?hostname, model = ?model, "Worker registration details");

    Ok((StatusCode::CREATED, Json(json!({ "status": "registered" }))))
}

pub(super) async fn deregister_worker(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let payload = require_json(&body)?;
    let worker_id = non_empty_str(&payload, "worker_id")
        .or_else(|| header_str(&headers, WORKER_HEADER).map(str::to_string))
        .ok_or_else(|| ApiError::BadRequest("`worker_id` is required.".to_string()))?;

    state.queue.deregister_worker(&worker_id).await?;
    Ok(Json(json!({ "status": "deregistered" })))
}

pub(super) async fn list_workers(
    State(state): State<ApiState>,
) -> ApiResult<Json<Vec<WorkerRecord>>> {
    Ok(Json(state.queue.list_workers().await?))
}
