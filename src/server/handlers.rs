//! HTTP route handlers
//!
//! Ingestion never blocks, so it runs directly on the runtime. Queries and
//! listings read the remote store through the blocking [`RemoteStore`] seam
//! and run under `spawn_blocking`.
//!
//! [`RemoteStore`]: crate::remote::RemoteStore

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio::task::JoinError;

use crate::error::Error;
use crate::memory::LogRecord;
use crate::Pipeline;

/// Header set on query responses that skipped unreadable segments
pub const PARTIAL_RESULTS_HEADER: &str = "x-partial-results";

/// An error answered with a status code and a plain-text message
#[derive(Debug)]
pub struct ApiError {
    /// Response status
    pub status: StatusCode,
    /// Response body
    pub message: String,
}

impl ApiError {
    /// `400 Bad Request` with `message`
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::MalformedInput(_) | Error::InvalidRange { .. } | Error::RangeTooLarge { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Backpressure { .. } | Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
            Error::LocalIo(_) | Error::Remote(_) | Error::Json(_) | Error::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        tracing::error!(error = %err, "blocking task failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Query string of `GET /query`
///
/// Values are taken as strings so a bad timestamp gets a precise message.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    /// First second of the range, inclusive
    pub start: Option<String>,
    /// Last second of the range, inclusive
    pub end: Option<String>,
    /// Optional case-sensitive substring filter
    pub text: Option<String>,
}

impl QueryParams {
    fn timestamp(value: Option<&str>, name: &str) -> Result<i64, ApiError> {
        value
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ApiError::bad_request(format!("Invalid {} timestamp", name)))
    }

    /// Parsed `(start, end)`
    pub fn range(&self) -> Result<(i64, i64), ApiError> {
        let start = Self::timestamp(self.start.as_deref(), "start")?;
        let end = Self::timestamp(self.end.as_deref(), "end")?;
        Ok((start, end))
    }
}

/// Handle POST /ingest
///
/// Answers `201 Created` once every record is enqueued. A full buffer part
/// way through answers `503`; the records before it stay accepted.
pub async fn handle_ingest(
    State(pipeline): State<Arc<Pipeline>>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), ApiError> {
    let records: Vec<LogRecord> = serde_json::from_slice(&body).map_err(|e| {
        ApiError::from(Error::MalformedInput(format!("Failed to parse log entries: {}", e)))
    })?;

    let total = records.len();
    match pipeline.submit_batch(records) {
        Ok(_) => {
            tracing::debug!(records = total, "ingested batch");
            Ok((StatusCode::CREATED, "Log entry stored successfully"))
        }
        Err(rejected) => {
            tracing::warn!(
                accepted = rejected.accepted,
                total = rejected.total,
                error = %rejected.source,
                "ingest batch rejected"
            );
            let mut err = ApiError::from(rejected.source);
            err.message = format!(
                "{} (accepted {} of {} records)",
                err.message, rejected.accepted, rejected.total
            );
            Err(err)
        }
    }
}

/// Handle GET /query
pub async fn handle_query(
    State(pipeline): State<Arc<Pipeline>>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let (start, end) = params.range()?;
    let text = params.text;

    let result =
        tokio::task::spawn_blocking(move || pipeline.query(start, end, text.as_deref())).await??;

    let mut response = Json(result.records).into_response();
    if result.partial {
        response.headers_mut().insert(
            HeaderName::from_static(PARTIAL_RESULTS_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    Ok(response)
}

/// Handle GET /list
pub async fn handle_list(
    State(pipeline): State<Arc<Pipeline>>,
) -> Result<Json<Vec<String>>, ApiError> {
    let keys = tokio::task::spawn_blocking(move || pipeline.list_segment_keys()).await??;
    Ok(Json(keys))
}
