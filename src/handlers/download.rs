//! Object download: access gating, conditional GET, single-range
//! requests, and chunked streaming of the blob file.
//!
//! The response body is the blob seeked to the range start and limited
//! to the range length, streamed in `download_chunk_bytes` chunks. Once
//! the response head is on the wire no error can be reported; a
//! mid-stream read failure ends the body early, which the transport
//! surfaces as an aborted connection.

use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::auth::{self, OperationFlags};
use crate::bucket::AccessAction;
use crate::errors::VaultError;
use crate::metadata::objects;
use crate::metrics::{BYTES_SENT_TOTAL, OBJECT_OPERATIONS_TOTAL};
use crate::AppState;

/// `GET <path>` — download an object, optionally a single byte range.
pub async fn get_object(state: Arc<AppState>, req: Request) -> Response {
    match handle_get(&state, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_get(state: &AppState, req: Request) -> Result<Response, VaultError> {
    let (parts, _body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let ctx = auth::authorize(state, &parts.headers, &path, parts.uri.query())?;

    // Per-key access gate.
    let access = ctx.bucket.access_for_key(&path);
    match access {
        AccessAction::DenyAll => {
            if !ctx.caps.contains(OperationFlags::API_KEY_ACCESS) {
                return Err(VaultError::Restricted);
            }
        }
        AccessAction::AllowSigned => {
            if !ctx.caps.contains(OperationFlags::READ) {
                return Err(VaultError::InsufficientAccess);
            }
        }
        AccessAction::AllowPublic => {}
    }

    let object = objects::get_object_by_key(&state.store, ctx.bucket.id, path.as_bytes())?
        .ok_or(VaultError::ObjectNotFound)?;
    counter!(OBJECT_OPERATIONS_TOTAL, "operation" => "get").increment(1);

    let cache_control = if access == AccessAction::AllowPublic {
        "max-age=360, public"
    } else {
        "max-age=360, private"
    };

    // Conditional GET: nothing to send when the validator still holds.
    if let Some(if_none_match) = parts.headers.get(header::IF_NONE_MATCH) {
        if if_none_match.as_bytes() == object.etag.as_bytes() {
            return Ok((
                StatusCode::NOT_MODIFIED,
                [
                    (header::ETAG, object.etag.as_str()),
                    (header::CACHE_CONTROL, cache_control),
                ],
            )
                .into_response());
        }
    }

    // Default to the whole blob; a Range header can narrow it.
    let mut status = StatusCode::OK;
    let mut start: u64 = 0;
    let mut length: u64 = object.size;
    let mut content_range: Option<String> = None;

    if let Some(range_header) = parts.headers.get(header::RANGE) {
        // Honor the range only when If-Range is absent or matches.
        let if_range_ok = parts
            .headers
            .get(header::IF_RANGE)
            .map(|v| v.as_bytes() == object.etag.as_bytes())
            .unwrap_or(true);
        if if_range_ok {
            let raw = String::from_utf8_lossy(range_header.as_bytes());
            match parse_range(&raw, object.size) {
                RangeOutcome::Satisfiable {
                    start: s,
                    length: l,
                    content_range: cr,
                } => {
                    status = StatusCode::PARTIAL_CONTENT;
                    start = s;
                    length = l;
                    content_range = Some(cr);
                }
                RangeOutcome::Unsatisfiable { content_range: cr } => {
                    // Never cache a failed range resolution.
                    return Ok((
                        StatusCode::RANGE_NOT_SATISFIABLE,
                        [
                            (header::ETAG, object.etag.as_str()),
                            (header::CACHE_CONTROL, "no-store"),
                            (header::CONTENT_RANGE, cr.as_str()),
                        ],
                    )
                        .into_response());
                }
                // Malformed ranges are ignored, not rejected.
                RangeOutcome::Malformed => {}
            }
        }
    }

    let mut file = state
        .blobs
        .open_blob(ctx.bucket.id, &object.uid)
        .await
        .map_err(|err| VaultError::Internal(err.into()))?;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|err| VaultError::Internal(err.into()))?;

    let reader = file.take(length);
    let stream =
        ReaderStream::with_capacity(reader, state.config.storage.download_chunk_bytes as usize);
    counter!(BYTES_SENT_TOTAL).increment(length);

    let mut builder = axum::http::Response::builder()
        .status(status)
        .header(header::ETAG, object.etag.as_str())
        .header(header::CACHE_CONTROL, cache_control)
        .header(header::CONTENT_LENGTH, length);
    if let Some(mime) = object.content_type_mime.as_deref() {
        builder = builder.header(header::CONTENT_TYPE, mime);
    }
    if let Some(cr) = content_range {
        builder = builder.header(header::CONTENT_RANGE, cr);
    }
    builder
        .body(Body::from_stream(stream))
        .map_err(|err| VaultError::Internal(err.into()))
}

// ── Range parsing ───────────────────────────────────────────────────

/// Result of resolving a `Range` header against the blob size.
#[derive(Debug, PartialEq, Eq)]
enum RangeOutcome {
    /// Serve `[start, start+length)` as a 206.
    Satisfiable {
        start: u64,
        length: u64,
        content_range: String,
    },
    /// The range can never be fulfilled: 416 with `bytes */<size>`.
    Unsatisfiable { content_range: String },
    /// Not a parseable single bytes-range; ignore the header.
    Malformed,
}

/// Strict ASCII-digit u64 parse; anything else is a parse failure.
fn ascii_u64(value: &str) -> Option<u64> {
    if value.is_empty() {
        return None;
    }
    let mut out: u64 = 0;
    for b in value.bytes() {
        if !b.is_ascii_digit() {
            return None;
        }
        out = out.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(out)
}

/// Parse a `Range` header (`bytes=a-b`, `bytes=a-`, `bytes=-b`) against
/// a blob of `size` bytes. Multipart ranges are unsupported and fall out
/// as malformed.
fn parse_range(header: &str, size: u64) -> RangeOutcome {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Malformed;
    };

    let pieces: Vec<&str> = spec.split('-').collect();
    if pieces.len() != 2 {
        return RangeOutcome::Malformed;
    }
    let (start_raw, end_raw) = (pieces[0], pieces[1]);

    let unsatisfiable = || RangeOutcome::Unsatisfiable {
        content_range: format!("bytes */{size}"),
    };
    let satisfiable = |start: u64, length: u64| RangeOutcome::Satisfiable {
        start,
        length,
        content_range: format!("bytes {}-{}/{}", start, start + length - 1, size),
    };

    match (start_raw.is_empty(), end_raw.is_empty()) {
        // bytes=a-b: inclusive range.
        (false, false) => {
            let (Some(start), Some(end)) = (ascii_u64(start_raw), ascii_u64(end_raw)) else {
                return RangeOutcome::Malformed;
            };
            if start > end || start >= size || end >= size {
                return unsatisfiable();
            }
            satisfiable(start, 1 + end - start)
        }
        // bytes=a-: from a to the end.
        (false, true) => {
            let Some(start) = ascii_u64(start_raw) else {
                return RangeOutcome::Malformed;
            };
            if start >= size {
                return unsatisfiable();
            }
            satisfiable(start, size - start)
        }
        // bytes=-b: the last b bytes.
        (true, false) => {
            let Some(suffix) = ascii_u64(end_raw) else {
                return RangeOutcome::Malformed;
            };
            if suffix == 0 || suffix > size {
                return unsatisfiable();
            }
            satisfiable(size - suffix, suffix)
        }
        (true, true) => RangeOutcome::Malformed,
    }
}
