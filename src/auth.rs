//! Request authorization.
//!
//! Two credential modes share one resolver:
//!
//! - `X-SV-Auth-Key`: a bearer API secret, base64-decoded and SHA-512
//!   hashed for lookup in the bucket snapshot. A hit grants every
//!   capability plus the privileged API-key marker.
//! - Signed URLs (`alg`/`sel`/`exp`/`acc`/`sig` query parameters): a MAC
//!   over `path ‖ expRaw ‖ accRaw ‖ secret` proves the grant; the server
//!   trusts the `acc` capability bits after verifying the signature.
//!
//! With neither credential the request is still resolved to its bucket
//! but carries no capabilities; downstream decides whether that suffices
//! (public-read paths).

use std::ops::BitOr;
use std::sync::Arc;

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::bucket::{Bucket, MacKey};
use crate::errors::VaultError;
use crate::metadata::store::now_ms;
use crate::AppState;

/// Routing header set by the reverse proxy; names the target bucket.
pub const ROUTING_HEADER: &str = "x-sv-rp-bucket";

/// Bearer API-secret header.
pub const AUTH_KEY_HEADER: &str = "x-sv-auth-key";

// ── Capability flags ────────────────────────────────────────────────

/// Bitset of operations a request context may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationFlags(u64);

impl OperationFlags {
    /// Create a complete object under a fresh key.
    pub const CREATE: Self = Self(1 << 0);
    /// Replace the content of an existing object.
    pub const UPDATE: Self = Self(1 << 1);
    /// Delete an existing object.
    pub const DELETE: Self = Self(1 << 2);
    /// Read an object.
    pub const READ: Self = Self(1 << 3);

    /// The capabilities a signed URL may grant.
    const SIGNED_FLAGS: [Self; 4] = [Self::CREATE, Self::UPDATE, Self::DELETE, Self::READ];

    /// Exclusive upper bound for signed-URL `acc` values: one bit above
    /// the highest grantable flag. Computed from the flag list so adding
    /// a capability stays safe.
    pub const SIGNED_BOUNDARY: u64 = {
        let mut highest = 0u64;
        let mut i = 0;
        while i < Self::SIGNED_FLAGS.len() {
            if Self::SIGNED_FLAGS[i].0 > highest {
                highest = Self::SIGNED_FLAGS[i].0;
            }
            i += 1;
        }
        highest << 1
    };

    /// Union of all signed-URL-grantable capabilities.
    pub const ALL: Self = Self(Self::SIGNED_BOUNDARY - 1);

    /// Privileged marker carried only by API-key contexts; bypasses
    /// DenyAll access rules.
    pub const API_KEY_ACCESS: Self = Self(Self::SIGNED_BOUNDARY);

    pub const fn empty() -> Self {
        Self(0)
    }

    /// All of `other`'s bits are present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any of `other`'s bits are present.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Validate a signed-URL `acc` value: nonzero, and no bits at or
    /// above the boundary.
    pub fn from_signed_bits(bits: u64) -> Option<Self> {
        (bits != 0 && bits < Self::SIGNED_BOUNDARY).then_some(Self(bits))
    }
}

impl BitOr for OperationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A resolved request: the target bucket and what the bearer may do.
pub struct AuthContext {
    pub bucket: Arc<Bucket>,
    pub caps: OperationFlags,
}

// ── Signed URLs ─────────────────────────────────────────────────────

/// Supported MAC algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    MacSha256,
    MacBlake3256,
}

impl SignatureAlgorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "MAC-SHA256" => Some(Self::MacSha256),
            "MAC-BLAKE3256" => Some(Self::MacBlake3256),
            _ => None,
        }
    }
}

/// Parsed signed-URL parameters. `exp_raw`/`acc_raw` keep the exact
/// ASCII bytes from the query string — they are MAC inputs, never
/// re-stringified numbers.
#[derive(Debug)]
pub struct SignedUrlParams<'a> {
    pub algorithm: SignatureAlgorithm,
    pub selector: u64,
    pub expires_ms: u64,
    pub exp_raw: &'a str,
    pub acc_bits: u64,
    pub acc_raw: &'a str,
    pub signature: [u8; 32],
}

/// Extract the raw value of a query parameter without decoding.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == name).then_some(v)
    })
}

/// Strict ASCII-digit u64 parse; rejects signs, whitespace, and empty
/// input.
fn ascii_u64(value: &str) -> Option<u64> {
    if value.is_empty() {
        return None;
    }
    let mut out: u64 = 0;
    for b in value.bytes() {
        if !b.is_ascii_digit() {
            return None;
        }
        out = out
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
    }
    Some(out)
}

/// Parse the signed-URL query parameters. Each missing or malformed
/// component is a distinct 400.
pub fn parse_signed_params(query: &str) -> Result<SignedUrlParams<'_>, VaultError> {
    let alg_name = query_param(query, "alg")
        .ok_or_else(|| VaultError::BadRequest("missing signed URL parameter 'alg'".into()))?;
    let algorithm = SignatureAlgorithm::from_name(alg_name).ok_or_else(|| {
        VaultError::BadRequest(format!("unsupported signature algorithm '{alg_name}'"))
    })?;

    let sel_raw = query_param(query, "sel")
        .ok_or_else(|| VaultError::BadRequest("missing signed URL parameter 'sel'".into()))?;
    let selector = ascii_u64(sel_raw)
        .ok_or_else(|| VaultError::BadRequest("invalid signed URL parameter 'sel'".into()))?;

    let exp_raw = query_param(query, "exp")
        .ok_or_else(|| VaultError::BadRequest("missing signed URL parameter 'exp'".into()))?;
    let expires_ms = ascii_u64(exp_raw)
        .ok_or_else(|| VaultError::BadRequest("invalid signed URL parameter 'exp'".into()))?;

    let acc_raw = query_param(query, "acc")
        .ok_or_else(|| VaultError::BadRequest("missing signed URL parameter 'acc'".into()))?;
    let acc_bits = ascii_u64(acc_raw)
        .ok_or_else(|| VaultError::BadRequest("invalid signed URL parameter 'acc'".into()))?;
    if OperationFlags::from_signed_bits(acc_bits).is_none() {
        return Err(VaultError::BadRequest(
            "signed URL parameter 'acc' carries no known capability bits".into(),
        ));
    }

    let sig_raw = query_param(query, "sig")
        .ok_or_else(|| VaultError::BadRequest("missing signed URL parameter 'sig'".into()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(sig_raw)
        .map_err(|_| VaultError::BadRequest("invalid signed URL parameter 'sig'".into()))?;
    let signature: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
        VaultError::BadRequest("signature must be a 32 byte digest".into())
    })?;

    Ok(SignedUrlParams {
        algorithm,
        selector,
        expires_ms,
        exp_raw,
        acc_bits,
        acc_raw,
        signature,
    })
}

/// Compute the expected MAC: `H(path ‖ expRaw ‖ accRaw ‖ secret)`.
fn compute_mac(
    algorithm: SignatureAlgorithm,
    path: &str,
    exp_raw: &str,
    acc_raw: &str,
    secret: &[u8; 32],
) -> [u8; 32] {
    match algorithm {
        SignatureAlgorithm::MacSha256 => {
            let mut hasher = Sha256::new();
            hasher.update(path.as_bytes());
            hasher.update(exp_raw.as_bytes());
            hasher.update(acc_raw.as_bytes());
            hasher.update(secret);
            hasher.finalize().into()
        }
        SignatureAlgorithm::MacBlake3256 => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(path.as_bytes());
            hasher.update(exp_raw.as_bytes());
            hasher.update(acc_raw.as_bytes());
            hasher.update(secret);
            *hasher.finalize().as_bytes()
        }
    }
}

/// Verify a parsed signed URL against a bucket's MAC keys. Returns the
/// granted capability set.
pub fn verify_signed_url(
    bucket: &Bucket,
    path: &str,
    params: &SignedUrlParams<'_>,
    now_ms: i64,
    clock_skew_ms: i64,
) -> Result<OperationFlags, VaultError> {
    // Expiry first; a stale URL fails the same way regardless of key.
    let deadline = params.expires_ms as i128 + clock_skew_ms as i128;
    if i128::from(now_ms) > deadline {
        return Err(VaultError::Unauthenticated("signature expired".into()));
    }

    let mac_key: &MacKey = bucket
        .mac_key(params.selector as u32)
        .ok_or_else(|| VaultError::Unauthenticated("unknown signature selector".into()))?;

    let expected = compute_mac(
        params.algorithm,
        path,
        params.exp_raw,
        params.acc_raw,
        &mac_key.secret,
    );
    if !bool::from(expected.ct_eq(&params.signature)) {
        return Err(VaultError::Unauthenticated("signature mismatch".into()));
    }

    // acc was range-checked at parse time; the MAC proves the grant.
    OperationFlags::from_signed_bits(params.acc_bits)
        .ok_or_else(|| VaultError::Unauthenticated("signature grants no capabilities".into()))
}

// ── Resolver ────────────────────────────────────────────────────────

/// Resolve a request into its target bucket and capability set.
pub fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    query: Option<&str>,
) -> Result<AuthContext, VaultError> {
    let Some(raw_name) = headers.get(ROUTING_HEADER) else {
        tracing::warn!(
            "request without '{ROUTING_HEADER}' header; the reverse proxy must set it to the \
             bucket this request belongs to"
        );
        return Err(VaultError::MissingRoutingHeader);
    };
    // Bucket names are stored as text; a non-UTF-8 header can never match.
    let Ok(name) = raw_name.to_str() else {
        return Err(VaultError::BucketNotFound);
    };

    let bucket = state
        .buckets
        .get_or_load(&state.store, name)?
        .ok_or(VaultError::BucketNotFound)?;

    // Bearer API key: full capabilities plus the privileged marker.
    if let Some(presented) = headers.get(AUTH_KEY_HEADER) {
        if bucket.api_key(presented.as_bytes()).is_none() {
            return Err(VaultError::ApiKeyRejected);
        }
        return Ok(AuthContext {
            bucket,
            caps: OperationFlags::ALL | OperationFlags::API_KEY_ACCESS,
        });
    }

    // Signed URL: the MAC proves the acc grant.
    if let Some(query) = query {
        if query_param(query, "alg").is_some() {
            let params = parse_signed_params(query)?;
            let caps = verify_signed_url(
                &bucket,
                path,
                &params,
                now_ms(),
                state.config.auth.signature_clock_skew_ms,
            )?;
            return Ok(AuthContext { bucket, caps });
        }
    }

    // Anonymous: the bucket is located but nothing is granted.
    Ok(AuthContext {
        bucket,
        caps: OperationFlags::empty(),
    })
}
