//! Router construction and method dispatch.
//!
//! The data plane has no enumerable routes: every path is an object key,
//! addressed by method. `/ping` and `/metrics` are reserved ahead of
//! object routing; the reverse proxy owns keeping probe paths out of the
//! object namespace.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;

use crate::handlers;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router: Router<Arc<AppState>> = Router::new().route("/ping", any(ping));

    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .fallback(dispatch)
        .layer(axum::middleware::from_fn(metrics_middleware))
        .with_state(state)
}

/// Liveness probe: 204, always.
async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Dispatch an object-keyed request by method.
async fn dispatch(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    if req.method() == Method::PUT {
        handlers::upload::put_object(state, req).await
    } else if req.method() == Method::GET {
        // A GET that announces a body is a client error, not a read.
        if req.headers().contains_key(header::CONTENT_LENGTH) {
            return (StatusCode::BAD_REQUEST, "body not allowed in GET requests").into_response();
        }
        handlers::download::get_object(state, req).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketCache;
    use crate::config::Config;
    use crate::metadata::store::MetadataStore;
    use crate::storage::BlobStore;

    fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetadataStore::open_in_memory().expect("store");
        store.init_schema().expect("schema");
        store.seed_debug_fixture().expect("seed");
        let state = Arc::new(AppState {
            config: Config::default(),
            store,
            blobs: BlobStore::new(dir.path()).expect("blobs"),
            buckets: BucketCache::new(),
        });
        (state, dir)
    }

    #[tokio::test]
    async fn test_ping_is_204() {
        assert_eq!(ping().await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unsupported_method_is_405() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/foo")
            .body(Body::empty())
            .expect("request");
        let resp = dispatch(State(state), req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_get_with_content_length_is_400() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method(Method::GET)
            .uri("/foo")
            .header(header::CONTENT_LENGTH, "5")
            .body(Body::empty())
            .expect("request");
        let resp = dispatch(State(state), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"body not allowed in GET requests");
    }
}
