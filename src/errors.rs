//! Request error taxonomy.
//!
//! Every variant maps to a fixed HTTP status.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(VaultError::Restricted)`.  Storage and I/O failures flatten into
//! the `Internal` arm via `anyhow` and are logged here, at the boundary;
//! the client only ever sees a bare 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Challenge sent alongside API-key 401 responses.
pub const WWW_AUTHENTICATE_VALUE: &str =
    r#"APIKey realm="bucket", instructions="authorize via header 'X-SV-Auth-Key'", charset="UTF-8""#;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed request component (signed-URL params, method misuse).
    #[error("{0}")]
    BadRequest(String),

    /// API-key credential missing or unknown. Carries the
    /// `WWW-Authenticate` challenge.
    #[error("permission denied (invalid API key)")]
    ApiKeyRejected,

    /// Signed-URL verification failure (expired, bad signature, unknown
    /// selector).
    #[error("{0}")]
    Unauthenticated(String),

    /// The request context lacks the capabilities for the operation.
    #[error("permission denied (insufficient access)")]
    InsufficientAccess,

    /// A DenyAll access rule matched and the context has no API-key
    /// privilege.
    #[error("permission denied (resource is restricted)")]
    Restricted,

    /// The reverse proxy failed to set the bucket routing header.
    #[error("bucket routing header missing")]
    MissingRoutingHeader,

    /// No bucket of the routed name exists.
    #[error("bucket not found")]
    BucketNotFound,

    /// No object under the requested key.
    #[error("object not found")]
    ObjectNotFound,

    /// Upload exceeded the single-part byte cap.
    #[error("single part cannot exceed {0} bytes")]
    PayloadTooLarge(u64),

    /// Create and replace both raced to a conflict; the client should
    /// retry.
    #[error("operation conflict detected")]
    OperationConflict,

    /// Catch-all for storage, I/O, and unexpected failures.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl VaultError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            VaultError::BadRequest(_) => StatusCode::BAD_REQUEST,
            VaultError::ApiKeyRejected => StatusCode::UNAUTHORIZED,
            VaultError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            VaultError::InsufficientAccess => StatusCode::UNAUTHORIZED,
            VaultError::Restricted => StatusCode::FORBIDDEN,
            VaultError::MissingRoutingHeader => StatusCode::INTERNAL_SERVER_ERROR,
            VaultError::BucketNotFound => StatusCode::NOT_FOUND,
            VaultError::ObjectNotFound => StatusCode::NOT_FOUND,
            VaultError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            VaultError::OperationConflict => StatusCode::SERVICE_UNAVAILABLE,
            VaultError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self {
            // Internal failures are logged here and flattened to a bare 500.
            VaultError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                status.into_response()
            }
            VaultError::MissingRoutingHeader => status.into_response(),
            VaultError::ApiKeyRejected => (
                status,
                [("www-authenticate", WWW_AUTHENTICATE_VALUE)],
                self.to_string(),
            )
                .into_response(),
            VaultError::OperationConflict => {
                (status, [("retry-after", "0")], self.to_string()).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
