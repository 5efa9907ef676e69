//! On-disk blob storage.
//!
//! Blobs live at `<data_dir>/<bucket_id>/objects/<uid>` where `uid` is the
//! URL-safe base64 of 16 random bytes.  A blob is created before its
//! `files` row and unlinked strictly after the row is removed or detached,
//! so a crash can leak a blob but never lose referenced data.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::path::PathBuf;

/// Length of an encoded blob uid (16 bytes, base64url, no padding).
pub const UID_LEN: usize = 22;

/// Blob store rooted at the configured data directory.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a blob store rooted at `root`, creating the directory if
    /// needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Generate a fresh blob uid from 16 CSPRNG bytes.
    pub fn new_uid() -> String {
        let raw: [u8; 16] = rand::random();
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Absolute path of the blob `uid` within bucket `bucket_id`.
    pub fn object_path(&self, bucket_id: i64, uid: &str) -> PathBuf {
        self.root
            .join(bucket_id.to_string())
            .join("objects")
            .join(uid)
    }

    /// Create the blob file for writing, creating the bucket's objects
    /// directory on first use.
    pub async fn create_blob(&self, bucket_id: i64, uid: &str) -> std::io::Result<tokio::fs::File> {
        let path = self.object_path(bucket_id, uid);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(path).await
    }

    /// Open an existing blob for reading.
    pub async fn open_blob(&self, bucket_id: i64, uid: &str) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.object_path(bucket_id, uid)).await
    }

    /// Unlink a blob, logging on failure. Unlink failures never poison
    /// request outcomes.
    pub fn remove_blob(&self, bucket_id: i64, uid: &str) {
        let path = self.object_path(bucket_id, uid);
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!("failed to remove blob {}: {err}", path.display());
        }
    }
}
