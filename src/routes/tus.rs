//! tus Routes
//!
//! HTTP binding of the tus 1.0.0 resumable upload protocol.
//!
//! Endpoints (relative to the configured base path):
//! - OPTIONS /    - Advertise protocol capabilities
//! - POST /       - Create an upload
//! - HEAD /:id    - Current offset, length and metadata
//! - PATCH /:id   - Append a chunk at Upload-Offset
//! - DELETE /:id  - Terminate an upload

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::state::AppState;
use crate::upload::{
    Checksum, ChunkWrite, UploadError, UploadLength, UploadMetadata, UploadRecord,
    OFFSET_OCTET_STREAM, TUS_SUPPORTED_VERSIONS, TUS_VERSION,
};

// ============================================================================
// Headers
// ============================================================================

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("tus-checksum-algorithm");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");

/// Headers browsers may read from tus responses
pub const EXPOSED_HEADERS: [HeaderName; 10] = [
    TUS_RESUMABLE,
    TUS_VERSION_HEADER,
    TUS_EXTENSION,
    TUS_MAX_SIZE,
    TUS_CHECKSUM_ALGORITHM,
    UPLOAD_OFFSET,
    UPLOAD_LENGTH,
    UPLOAD_DEFER_LENGTH,
    UPLOAD_METADATA,
    UPLOAD_EXPIRES,
];

/// RFC 7231 HTTP-date
fn http_date(ts: &DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_value(value: &str) -> Result<HeaderValue, UploadError> {
    HeaderValue::from_str(value)
        .map_err(|_| UploadError::Internal(format!("invalid header value {:?}", value)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>, UploadError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| UploadError::BadRequest(format!("{} is not valid ASCII", name)))
        })
        .transpose()
}

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, UploadError> {
    header_str(headers, name)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| UploadError::BadRequest(format!("{} must be a non-negative integer", name)))
        })
        .transpose()
}

/// Protocol headers attached to every tus response
fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers
}

fn record_headers(headers: &mut HeaderMap, record: &UploadRecord) -> Result<(), UploadError> {
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(record.offset));

    if let Some(expires_at) = &record.expires_at {
        headers.insert(UPLOAD_EXPIRES, header_value(&http_date(expires_at))?);
    }

    Ok(())
}

/// Reject requests speaking an unsupported protocol version
fn check_tus_resumable(headers: &HeaderMap) -> Result<(), UploadError> {
    match header_str(headers, &TUS_RESUMABLE)? {
        None => Err(UploadError::BadRequest("Missing \"Tus-Resumable\" header".to_string())),
        Some(version) if TUS_SUPPORTED_VERSIONS.contains(&version) => Ok(()),
        Some(version) => Err(UploadError::UnsupportedVersion(version.to_string())),
    }
}

fn parse_id(id: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(id).map_err(|_| UploadError::BadRequest(format!("Invalid upload id: {}", id)))
}

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
    /// Whether repeating the same request may succeed
    retryable: bool,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut headers = base_headers();
        if matches!(self, UploadError::UnsupportedVersion(_)) {
            if let Ok(value) = header_value(&TUS_SUPPORTED_VERSIONS.join(",")) {
                headers.insert(TUS_VERSION_HEADER, value);
            }
        }

        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Upload request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Upload request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            retryable: self.is_retryable(),
        });

        (status, headers, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create tus router, mounted at the configured base path
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_upload).options(options))
        .route(
            "/:id",
            axum::routing::head(head_upload)
                .patch(patch_upload)
                .delete(terminate_upload)
                .options(options),
        )
}

// ============================================================================
// Handlers
// ============================================================================

/// Capability discovery; needs no Tus-Resumable header
async fn options(State(state): State<AppState>) -> Result<Response, UploadError> {
    let caps = state.engine().capabilities();

    let mut headers = base_headers();
    headers.insert(TUS_VERSION_HEADER, header_value(&caps.supported_versions.join(","))?);
    headers.insert(TUS_EXTENSION, header_value(&caps.extensions.join(","))?);
    headers.insert(TUS_MAX_SIZE, HeaderValue::from(caps.max_size));
    headers.insert(TUS_CHECKSUM_ALGORITHM, header_value(&caps.checksum_algorithms.join(","))?);

    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

/// Read `Upload-Length` / `Upload-Defer-Length` of a creation request
fn creation_length(headers: &HeaderMap) -> Result<UploadLength, UploadError> {
    let length = header_str(headers, &UPLOAD_LENGTH)?;
    let defer = header_str(headers, &UPLOAD_DEFER_LENGTH)?;

    match (length, defer) {
        (Some(_), Some(_)) => Err(UploadError::BadLength(
            "Upload-Length and Upload-Defer-Length are mutually exclusive".to_string(),
        )),
        (Some(value), None) => value
            .parse::<u64>()
            .map(UploadLength::Known)
            .map_err(|_| UploadError::BadLength(format!("Invalid Upload-Length {:?}", value))),
        (None, Some("1")) => Ok(UploadLength::Deferred),
        (None, Some(value)) => Err(UploadError::BadLength(format!(
            "Upload-Defer-Length must be 1, got {:?}",
            value
        ))),
        (None, None) => Err(UploadError::BadLength(
            "Missing \"Upload-Length\" or \"Upload-Defer-Length: 1\" header".to_string(),
        )),
    }
}

/// POST / - Create a new upload
async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    check_tus_resumable(&headers)?;

    let length = creation_length(&headers)?;
    let metadata = match header_str(&headers, &UPLOAD_METADATA)? {
        Some(value) => UploadMetadata::parse(value)?,
        None => UploadMetadata::new(),
    };

    let record = state.engine().create(length, metadata).await?;

    let mut response_headers = base_headers();
    let location = format!("{}/{}", state.config().tus.base_path, record.id);
    response_headers.insert(header::LOCATION, header_value(&location)?);
    if let Some(expires_at) = &record.expires_at {
        response_headers.insert(UPLOAD_EXPIRES, header_value(&http_date(expires_at))?);
    }

    if state.config().tus.response_body_enabled {
        return Ok((StatusCode::CREATED, response_headers, Json(record)).into_response());
    }

    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// HEAD /:id - Report upload progress
async fn head_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    check_tus_resumable(&headers)?;
    let id = parse_id(&id)?;

    let record = state.engine().head(id).await?;

    let mut response_headers = base_headers();
    record_headers(&mut response_headers, &record)?;

    match record.length {
        UploadLength::Known(length) => {
            response_headers.insert(UPLOAD_LENGTH, HeaderValue::from(length));
        }
        UploadLength::Deferred => {
            response_headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }

    if !record.metadata.is_empty() {
        response_headers.insert(UPLOAD_METADATA, header_value(&record.metadata.encode())?);
    }

    Ok((StatusCode::OK, response_headers).into_response())
}

/// Collect a chunk body, refusing more than `limit` bytes
async fn read_chunk(body: Body, limit: u64) -> Result<Bytes, UploadError> {
    let mut stream = body.into_data_stream();
    let mut chunk = BytesMut::new();

    while let Some(frame) = stream.next().await {
        let data = frame.map_err(|e| {
            UploadError::BadRequest(format!("Request body interrupted: {}", e))
        })?;

        let total = (chunk.len() + data.len()) as u64;
        if total > limit {
            return Err(UploadError::LengthExceeded {
                length: total,
                max: limit,
            });
        }
        chunk.extend_from_slice(&data);
    }

    Ok(chunk.freeze())
}

/// PATCH /:id - Append a chunk
async fn patch_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, UploadError> {
    check_tus_resumable(&headers)?;
    let id = parse_id(&id)?;

    let content_type = header_str(&headers, &header::CONTENT_TYPE)?;
    if content_type != Some(OFFSET_OCTET_STREAM) {
        return Err(UploadError::BadRequest(format!(
            "Invalid value for \"Content-Type\" header: {:?}. Expected \"{}\".",
            content_type.unwrap_or(""),
            OFFSET_OCTET_STREAM
        )));
    }

    let offset = header_u64(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| UploadError::BadRequest("Missing \"Upload-Offset\" header".to_string()))?;
    let declared_length = header_u64(&headers, &header::CONTENT_LENGTH)?;
    let checksum = header_str(&headers, &UPLOAD_CHECKSUM)?
        .map(Checksum::parse_header)
        .transpose()?;
    let upload_length = header_str(&headers, &UPLOAD_LENGTH)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| UploadError::BadLength(format!("Invalid Upload-Length {:?}", value)))
        })
        .transpose()?;

    // Stale offsets and oversized chunks are refused before the body is read
    let engine = state.engine();
    let allowance = engine.chunk_allowance(id, offset, upload_length).await?;
    if let Some(length) = declared_length.filter(|&length| length > allowance) {
        return Err(UploadError::LengthExceeded {
            length,
            max: allowance,
        });
    }
    let data = read_chunk(body, allowance).await?;

    // A bodiless PATCH carrying only Upload-Length just fixes the length
    let mut write = ChunkWrite::new(id, offset, data);
    write.declared_length = declared_length;
    write.checksum = checksum;
    write.upload_length = upload_length;
    let record = engine.patch_chunk(write).await?;

    let mut response_headers = base_headers();
    record_headers(&mut response_headers, &record)?;

    if state.config().tus.response_body_enabled {
        return Ok((StatusCode::OK, response_headers, Json(record)).into_response());
    }

    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// DELETE /:id - Terminate an upload
async fn terminate_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    check_tus_resumable(&headers)?;
    let id = parse_id(&id)?;

    state.engine().terminate(id).await?;

    Ok((StatusCode::NO_CONTENT, base_headers()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_http_date() {
        let ts = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(&ts), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_creation_length() {
        let mut headers = HeaderMap::new();
        assert!(matches!(creation_length(&headers), Err(UploadError::BadLength(_))));

        headers.insert(UPLOAD_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(creation_length(&headers).unwrap(), UploadLength::Known(42));

        headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        assert!(matches!(creation_length(&headers), Err(UploadError::BadLength(_))));

        headers.remove(UPLOAD_LENGTH);
        assert_eq!(creation_length(&headers).unwrap(), UploadLength::Deferred);

        headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("0"));
        assert!(matches!(creation_length(&headers), Err(UploadError::BadLength(_))));

        let mut negative = HeaderMap::new();
        negative.insert(UPLOAD_LENGTH, HeaderValue::from_static("-1"));
        assert!(matches!(creation_length(&negative), Err(UploadError::BadLength(_))));
    }

    #[test]
    fn test_check_tus_resumable() {
        let mut headers = HeaderMap::new();
        assert!(matches!(check_tus_resumable(&headers), Err(UploadError::BadRequest(_))));

        headers.insert(TUS_RESUMABLE, HeaderValue::from_static("0.2.2"));
        assert!(matches!(
            check_tus_resumable(&headers),
            Err(UploadError::UnsupportedVersion(_))
        ));

        headers.insert(TUS_RESUMABLE, HeaderValue::from_static("1.0.0"));
        assert!(check_tus_resumable(&headers).is_ok());
    }

    #[tokio::test]
    async fn test_read_chunk_enforces_limit() {
        let data = read_chunk(Body::from("hello"), 5).await.unwrap();
        assert_eq!(&data[..], b"hello");

        assert!(matches!(
            read_chunk(Body::from("hello!"), 5).await,
            Err(UploadError::LengthExceeded { length: 6, max: 5 })
        ));
    }

    #[tokio::test]
    async fn test_read_chunk_stops_early_on_endless_body() {
        let endless = futures::stream::repeat_with(|| Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789")));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            read_chunk(Body::from_stream(endless), 64),
        )
        .await
        .expect("read_chunk kept reading past the limit");
        assert!(matches!(result, Err(UploadError::LengthExceeded { length: 70, max: 64 })));
    }
}
