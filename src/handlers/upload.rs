//! Object upload: stream the request body to disk, digest it inline,
//! then dispatch create-or-replace according to the context's
//! capabilities.
//!
//! The blob is written under a fresh uid before any metadata exists for
//! it; every error path removes the partial file.  Blobs made redundant
//! by deduplication or orphaned by a replace are unlinked only after the
//! metadata transaction has committed.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use metrics::counter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::auth::{self, OperationFlags};
use crate::bucket::AccessAction;
use crate::errors::VaultError;
use crate::metadata::objects::{self, etag_for_digest, ObjectOpError, PostCommitCleanup};
use crate::metrics::{BYTES_RECEIVED_TOTAL, OBJECT_OPERATIONS_TOTAL};
use crate::storage::BlobStore;
use crate::AppState;

/// `PUT <path>` — upload a single-part object.
pub async fn put_object(state: Arc<AppState>, req: Request) -> Response {
    match handle_put(&state, req).await {
        Ok(response) => response,
        // Every upload error path terminates the connection.
        Err(err) => {
            let mut response = err.into_response();
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}

async fn handle_put(state: &AppState, req: Request) -> Result<Response, VaultError> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let ctx = auth::authorize(state, &parts.headers, &path, parts.uri.query())?;
    if !ctx
        .caps
        .intersects(OperationFlags::CREATE | OperationFlags::UPDATE)
    {
        return Err(VaultError::InsufficientAccess);
    }

    if ctx.bucket.access_for_key(&path) == AccessAction::DenyAll
        && !ctx.caps.contains(OperationFlags::API_KEY_ACCESS)
    {
        return Err(VaultError::Restricted);
    }

    let bucket_id = ctx.bucket.id;
    let uid = BlobStore::new_uid();
    let mut file = state
        .blobs
        .create_blob(bucket_id, &uid)
        .await
        .map_err(|err| VaultError::Internal(err.into()))?;

    // Receive the body in bounded chunks, writing and digesting as we go.
    let mut hasher = blake3::Hasher::new();
    let stream = body
        .into_data_stream()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err));
    let mut reader = StreamReader::new(stream);
    let mut buffer = vec![0u8; state.config.storage.upload_chunk_bytes as usize];
    let mut received: u64 = 0;

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                drop(file);
                state.blobs.remove_blob(bucket_id, &uid);
                return Err(VaultError::Internal(err.into()));
            }
        };

        received += n as u64;
        if received > state.config.storage.max_single_part_bytes {
            drop(file);
            state.blobs.remove_blob(bucket_id, &uid);
            return Err(VaultError::PayloadTooLarge(
                state.config.storage.max_single_part_bytes,
            ));
        }

        if let Err(err) = file.write_all(&buffer[..n]).await {
            drop(file);
            state.blobs.remove_blob(bucket_id, &uid);
            return Err(VaultError::Internal(err.into()));
        }
        hasher.update(&buffer[..n]);
    }

    if let Err(err) = file.flush().await {
        drop(file);
        state.blobs.remove_blob(bucket_id, &uid);
        return Err(VaultError::Internal(err.into()));
    }
    drop(file);

    let digest = *hasher.finalize().as_bytes();
    counter!(BYTES_RECEIVED_TOTAL).increment(received);
    tracing::debug!(
        "received {received} bytes into blob {uid} (digest {})",
        hex::encode(digest)
    );

    let mime = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let etag = etag_for_digest(&digest);

    // Create first when permitted; fall through to replace on conflict.
    let mut create_conflicted = false;
    if ctx.caps.contains(OperationFlags::CREATE) {
        match objects::create_object(
            &state.store,
            bucket_id,
            &uid,
            mime,
            &digest,
            received,
            path.as_bytes(),
        ) {
            Ok(cleanup) => {
                apply_cleanup(state, bucket_id, cleanup);
                counter!(OBJECT_OPERATIONS_TOTAL, "operation" => "create").increment(1);
                return put_response(StatusCode::CREATED, &etag);
            }
            Err(ObjectOpError::Conflict) => create_conflicted = true,
            Err(ObjectOpError::Store(err)) => {
                state.blobs.remove_blob(bucket_id, &uid);
                return Err(VaultError::Internal(err.into()));
            }
        }
    }

    if ctx.caps.contains(OperationFlags::UPDATE) {
        match objects::replace_object(
            &state.store,
            bucket_id,
            &uid,
            mime,
            &digest,
            received,
            path.as_bytes(),
        ) {
            Ok(cleanup) => {
                apply_cleanup(state, bucket_id, cleanup);
                counter!(OBJECT_OPERATIONS_TOTAL, "operation" => "replace").increment(1);
                return put_response(StatusCode::OK, &etag);
            }
            Err(ObjectOpError::Conflict) => {
                state.blobs.remove_blob(bucket_id, &uid);
                // Created then deleted between our attempts (or vice
                // versa): retryable only when both ops were allowed.
                if create_conflicted {
                    return Err(VaultError::OperationConflict);
                }
                return Err(VaultError::InsufficientAccess);
            }
            Err(ObjectOpError::Store(err)) => {
                state.blobs.remove_blob(bucket_id, &uid);
                return Err(VaultError::Internal(err.into()));
            }
        }
    }

    // Create-only context against an existing key.
    state.blobs.remove_blob(bucket_id, &uid);
    Err(VaultError::InsufficientAccess)
}

/// Unlink blobs made garbage by a committed metadata operation.
fn apply_cleanup(state: &AppState, bucket_id: i64, cleanup: PostCommitCleanup) {
    if let Some(uid) = cleanup.duplicate_uid {
        state.blobs.remove_blob(bucket_id, &uid);
    }
    if let Some(uid) = cleanup.orphaned_uid {
        state.blobs.remove_blob(bucket_id, &uid);
    }
}

fn put_response(status: StatusCode, etag: &str) -> Result<Response, VaultError> {
    let response = axum::http::Response::builder()
        .status(status)
        .header(header::ETAG, etag)
        .body(Body::empty())
        .map_err(|err| VaultError::Internal(err.into()))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketCache;
    use crate::config::Config;
    use crate::metadata::store::{MetadataStore, DEBUG_API_SECRET, DEBUG_BUCKET_NAME};
    use crate::storage::BlobStore;
    use axum::http::Method;
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine as _;

    fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetadataStore::open_in_memory().expect("store");
        store.init_schema().expect("schema");
        store.seed_debug_fixture().expect("seed");
        let blobs = BlobStore::new(dir.path()).expect("blobs");
        let state = Arc::new(AppState {
            config: Config::default(),
            store,
            blobs,
            buckets: BucketCache::new(),
        });
        (state, dir)
    }

    fn api_secret() -> String {
        STANDARD_NO_PAD.encode(DEBUG_API_SECRET)
    }

    fn put_request(path: &str, body: &'static [u8]) -> Request {
        Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(auth::ROUTING_HEADER, DEBUG_BUCKET_NAME)
            .header(auth::AUTH_KEY_HEADER, api_secret())
            .body(Body::from(body))
            .expect("request")
    }

    fn blob_count(state: &AppState, bucket_id: i64) -> usize {
        let dir = state
            .blobs
            .object_path(bucket_id, "x")
            .parent()
            .expect("objects dir")
            .to_path_buf();
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn test_create_returns_201_with_etag() {
        let (state, _dir) = test_state();
        let resp = put_object(state.clone(), put_request("/foo", b"hello")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().contains_key(header::ETAG));
        assert_eq!(blob_count(&state, 1), 1);
    }

    #[tokio::test]
    async fn test_replace_returns_200_and_reclaims() {
        let (state, _dir) = test_state();
        let first = put_object(state.clone(), put_request("/foo", b"hello")).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = put_object(state.clone(), put_request("/foo", b"world")).await;
        assert_eq!(second.status(), StatusCode::OK);

        // The old content had a single referrer: one blob on disk.
        assert_eq!(blob_count(&state, 1), 1);

        let files: i64 = state
            .store
            .lock()
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_dedup_shares_one_blob() {
        let (state, _dir) = test_state();
        assert_eq!(
            put_object(state.clone(), put_request("/foo", b"hello"))
                .await
                .status(),
            StatusCode::CREATED
        );
        assert_eq!(
            put_object(state.clone(), put_request("/bar", b"hello"))
                .await
                .status(),
            StatusCode::CREATED
        );

        assert_eq!(blob_count(&state, 1), 1);

        let conn = state.store.lock();
        let (files, refs): (i64, i64) = conn
            .query_row("SELECT COUNT(*), SUM(ref_count) FROM files", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(files, 1);
        assert_eq!(refs, 2);
        let object_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0))
            .unwrap();
        assert_eq!(object_rows, 2);
    }

    #[tokio::test]
    async fn test_payload_cap_is_exact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetadataStore::open_in_memory().expect("store");
        store.init_schema().expect("schema");
        store.seed_debug_fixture().expect("seed");
        let mut config = Config::default();
        config.storage.max_single_part_bytes = 5;
        let state = Arc::new(AppState {
            config,
            store,
            blobs: BlobStore::new(dir.path()).expect("blobs"),
            buckets: BucketCache::new(),
        });

        // Exactly at the cap succeeds.
        let resp = put_object(state.clone(), put_request("/exact", b"12345")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        // One byte over is rejected and the partial blob removed.
        let resp = put_object(state.clone(), put_request("/over", b"123456")).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(resp.headers().get(header::CONNECTION).unwrap(), "close");
        assert_eq!(blob_count(&state, 1), 1);
    }

    #[tokio::test]
    async fn test_anonymous_upload_is_rejected() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/foo")
            .header(auth::ROUTING_HEADER, DEBUG_BUCKET_NAME)
            .body(Body::from(&b"hello"[..]))
            .expect("request");
        let resp = put_object(state.clone(), req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(blob_count(&state, 1), 0);
    }

    #[tokio::test]
    async fn test_unknown_bucket_is_404() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/foo")
            .header(auth::ROUTING_HEADER, "no-such-bucket")
            .header(auth::AUTH_KEY_HEADER, api_secret())
            .body(Body::from(&b"hello"[..]))
            .expect("request");
        let resp = put_object(state, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_routing_header_is_500() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/foo")
            .body(Body::from(&b"hello"[..]))
            .expect("request");
        let resp = put_object(state, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_create_only_signed_context_conflicts_as_denied() {
        let (state, _dir) = test_state();

        // Seed /race with the API key.
        assert_eq!(
            put_object(state.clone(), put_request("/race", b"v1"))
                .await
                .status(),
            StatusCode::CREATED
        );

        // A signed URL granting Create only cannot touch the existing key.
        let exp = (crate::metadata::store::now_ms() + 60_000).to_string();
        let acc = "1".to_string();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"/race");
        hasher.update(exp.as_bytes());
        hasher.update(acc.as_bytes());
        hasher.update(crate::metadata::store::DEBUG_MAC_SECRET);
        let sig = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(hasher.finalize().as_bytes());

        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!(
                "/race?alg=MAC-BLAKE3256&sel=1&exp={exp}&acc={acc}&sig={sig}"
            ))
            .header(auth::ROUTING_HEADER, DEBUG_BUCKET_NAME)
            .body(Body::from(&b"v2"[..]))
            .expect("request");
        let resp = put_object(state.clone(), req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // The rejected upload's blob is cleaned up; the original remains.
        assert_eq!(blob_count(&state, 1), 1);
    }

    #[tokio::test]
    async fn test_content_type_is_persisted() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/typed")
            .header(auth::ROUTING_HEADER, DEBUG_BUCKET_NAME)
            .header(auth::AUTH_KEY_HEADER, api_secret())
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(&b"hi"[..]))
            .expect("request");
        assert_eq!(put_object(state.clone(), req).await.status(), StatusCode::CREATED);

        let object = objects::get_object_by_key(&state.store, 1, b"/typed")
            .unwrap()
            .expect("object");
        assert_eq!(object.content_type_mime.as_deref(), Some("text/plain"));
    }
}
