//! Route handlers: health and token-addressed artifact delivery
//!
//! Delivery is deliberately anonymous: possession of the token is the only
//! authorization. Responses carry `Accept-Ranges` and honor single
//! `bytes=start-end` ranges so interrupted downloads can resume; a malformed
//! `Range` header degrades to a full response rather than an error.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::json;
use std::convert::Infallible;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

use crate::api::AppState;
use crate::error::{Error, RegistryError};
use crate::registry::Artifact;
use crate::types::ArtifactToken;

/// GET /health - Health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is healthy")
    )
)]
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /openapi.json - OpenAPI specification
#[utoipa::path(
    get,
    path = "/openapi.json",
    tag = "system",
    responses(
        (status = 200, description = "OpenAPI 3.1 specification in JSON format")
    )
)]
pub async fn openapi_spec() -> impl IntoResponse {
    use crate::api::openapi::ApiDoc;
    use utoipa::OpenApi;

    Json(ApiDoc::openapi())
}

/// GET /events - Server-sent events stream
///
/// Relays the gateway's broadcast events as SSE, one event type per
/// lifecycle transition. Slow consumers that lag the channel simply miss
/// the dropped events.
#[utoipa::path(
    get,
    path = "/events",
    tag = "system",
    responses(
        (status = 200, description = "Server-sent events stream (text/event-stream)", content_type = "text/event-stream")
    )
)]
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.event_tx.subscribe();
    let stream = BroadcastStream::new(receiver);

    let sse_stream = stream.filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json_data) => {
                let event_type = match &event {
                    crate::types::Event::JobQueued { .. } => "job_queued",
                    crate::types::Event::JobProgress { .. } => "job_progress",
                    crate::types::Event::JobReady { .. } => "job_ready",
                    crate::types::Event::JobFailed { .. } => "job_failed",
                    crate::types::Event::ArtifactExpired { .. } => "artifact_expired",
                };
                Some(Ok(SseEvent::default().event(event_type).data(json_data)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event for SSE");
                None
            }
        },
        // Lagged receiver: skip and keep streaming
        Err(_) => None,
    });

    Sse::new(sse_stream).keep_alive(KeepAlive::default())
}

/// GET or HEAD /download/:token - Fetch a registered artifact
///
/// Unknown and expired tokens are indistinguishable: both answer 404. HEAD
/// returns the same headers as GET with no body, so download clients can
/// size up the transfer first.
#[utoipa::path(
    get,
    path = "/download/{token}",
    tag = "delivery",
    params(
        ("token" = String, Path, description = "Artifact token from a finished conversion")
    ),
    responses(
        (status = 200, description = "Full artifact content"),
        (status = 206, description = "Requested byte range of the artifact"),
        (status = 404, description = "Token unknown or artifact expired", body = crate::error::ApiError),
        (status = 416, description = "Requested range not satisfiable")
    )
)]
pub async fn download_artifact(
    State(state): State<AppState>,
    method: Method,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let token = ArtifactToken::from(token);
    let Some(artifact) = state.registry.resolve(&token).await else {
        return Error::Registry(RegistryError::NotFound { token }).into_response();
    };

    let size = match tokio::fs::metadata(&artifact.storage_path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::error!(token = %token, error = %e, "artifact bytes missing from storage");
            return Error::Io(e).into_response();
        }
    };

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    match parse_range(range_header, size) {
        RangeOutcome::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        }
        RangeOutcome::Full => serve(&artifact, size, None, method != Method::HEAD).await,
        RangeOutcome::Partial { start, end } => {
            serve(&artifact, size, Some((start, end)), method != Method::HEAD).await
        }
    }
}

/// How a request's `Range` header maps onto an artifact of known size
#[derive(Debug, PartialEq, Eq)]
enum RangeOutcome {
    /// No range requested, or the header was malformed
    Full,
    /// Serve `start..=end` (already clamped to the artifact)
    Partial { start: u64, end: u64 },
    /// Range lies wholly outside the artifact
    Unsatisfiable,
}

/// Interpret a `Range` header against `size` bytes of content
///
/// Only the single-range `bytes=start-end` and open-ended `bytes=start-`
/// forms are understood. An `end` past the last byte is clamped rather than
/// rejected; only a `start` at or past the end of the content (or an
/// inverted range) is unsatisfiable. Anything unparseable degrades to a
/// full response.
fn parse_range(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    // multi-range and suffix forms are not supported
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start_s, end_s)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };
    let Ok(start) = start_s.trim().parse::<u64>() else {
        return RangeOutcome::Full;
    };

    let end = if end_s.trim().is_empty() {
        size.saturating_sub(1)
    } else {
        match end_s.trim().parse::<u64>() {
            Ok(end) => end,
            Err(_) => return RangeOutcome::Full,
        }
    };

    if start >= size || start > end {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial {
        start,
        end: end.min(size.saturating_sub(1)),
    }
}

/// Build the delivery response, streaming the requested window from disk
async fn serve(
    artifact: &Artifact,
    size: u64,
    range: Option<(u64, u64)>,
    include_body: bool,
) -> Response {
    let (status, start, length) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        None => (StatusCode::OK, 0, size),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_for(&artifact.file_name))
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&artifact.file_name),
        );
    if let Some((start, end)) = range {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
    }

    let body = if include_body && length > 0 {
        let mut file = match tokio::fs::File::open(&artifact.storage_path).await {
            Ok(file) => file,
            Err(e) => return Error::Io(e).into_response(),
        };
        if start > 0 {
            if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
                return Error::Io(e).into_response();
            }
        }
        Body::from_stream(ReaderStream::new(file.take(length)))
    } else {
        Body::empty()
    };

    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "failed to build delivery response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Content type inferred from the stored file's extension
fn content_type_for(file_name: &str) -> &'static str {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

fn content_disposition(file_name: &str) -> HeaderValue {
    // Keep only characters that survive a quoted-string header value
    let safe: String = file_name
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"' && *c != '\\')
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
