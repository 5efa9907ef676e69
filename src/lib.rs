//! Silovault library — reverse-proxy-fronted object store engine.
//!
//! This crate provides the core components for running the store: the
//! authorization pipeline (API keys and signed URLs over per-bucket
//! access rules), the refcount-deduplicated object/file metadata engine,
//! and the streaming upload/download paths.

pub mod auth;
pub mod bucket;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod storage;

use crate::bucket::BucketCache;
use crate::config::Config;
use crate::metadata::store::MetadataStore;
use crate::storage::BlobStore;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata store.
    pub store: MetadataStore,
    /// On-disk blob store.
    pub blobs: BlobStore,
    /// Name-keyed bucket snapshot cache.
    pub buckets: BucketCache,
}
