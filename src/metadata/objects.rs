//! Object metadata engine: create, replace, and lookup over the
//! object↔file join.
//!
//! Every write runs as one IMMEDIATE transaction on the store connection
//! and terminates it on every exit path.  `ObjectOpError::Conflict` is a
//! control-flow signal meaning "this operation type does not apply to the
//! present object state" — it is never surfaced raw to a client.
//!
//! Physical blob deletion is deferred to the caller: operations report
//! which uids became garbage (the deduplicated candidate and/or an
//! orphaned previous file), and the caller unlinks them only after the
//! commit has succeeded.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use super::files::deduplicate_or_create_file;
use super::store::{now_ms, MetadataStore};

#[derive(Debug, Error)]
pub enum ObjectOpError {
    /// Create against an existing key, or replace against a missing one.
    #[error("object operation does not apply to the current object state")]
    Conflict,

    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

/// Blob uids that became garbage once the transaction committed. The
/// caller unlinks them best-effort, strictly after commit.
#[derive(Debug, Default)]
pub struct PostCommitCleanup {
    /// The uploaded candidate blob, superseded by an existing file row.
    pub duplicate_uid: Option<String>,
    /// The previous file's blob, dropped to refcount 0 by a replace.
    pub orphaned_uid: Option<String>,
}

/// An object joined with its backing file.
#[derive(Debug)]
pub struct ObjectRecord {
    pub id: i64,
    pub created_ms: i64,
    pub content_type_mime: Option<String>,
    pub digest: Vec<u8>,
    pub size: u64,
    pub uid: String,
    /// Strong validator derived from the digest, quotes included.
    pub etag: String,
}

/// Render the strong ETag for a content digest.
pub fn etag_for_digest(digest: &[u8]) -> String {
    format!("\"{}\"", URL_SAFE_NO_PAD.encode(digest))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Create a new object under `key`. Conflict if the key is already
/// taken.
pub fn create_object(
    store: &MetadataStore,
    bucket_id: i64,
    candidate_uid: &str,
    content_type_mime: Option<&str>,
    digest: &[u8; 32],
    size: u64,
    key: &[u8],
) -> Result<PostCommitCleanup, ObjectOpError> {
    let conn = store.lock();
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let (file_id, is_new) =
        match deduplicate_or_create_file(&conn, bucket_id, candidate_uid, digest, size) {
            Ok(v) => v,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err.into());
            }
        };

    if let Err(err) = conn.execute(
        "INSERT INTO objects (bucket_id, file_id, created_ms, key, content_type_mime)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![bucket_id, file_id, now_ms(), key, content_type_mime],
    ) {
        let _ = conn.execute_batch("ROLLBACK");
        if is_constraint_violation(&err) {
            return Err(ObjectOpError::Conflict);
        }
        return Err(err.into());
    }

    if let Err(err) = conn.execute_batch("COMMIT") {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(err.into());
    }

    Ok(PostCommitCleanup {
        duplicate_uid: (!is_new).then(|| candidate_uid.to_string()),
        orphaned_uid: None,
    })
}

/// Replace the file behind an existing object under `key`. Conflict if
/// no object with this key exists. The previous file's refcount is
/// decremented; at zero, its row is deleted in the same transaction and
/// its uid reported for post-commit unlinking.
pub fn replace_object(
    store: &MetadataStore,
    bucket_id: i64,
    candidate_uid: &str,
    content_type_mime: Option<&str>,
    digest: &[u8; 32],
    size: u64,
    key: &[u8],
) -> Result<PostCommitCleanup, ObjectOpError> {
    let conn = store.lock();
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let existing = match conn
        .query_row(
            "SELECT id, file_id FROM objects WHERE bucket_id = ?1 AND key = ?2",
            params![bucket_id, key],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(err.into());
        }
    };
    let Some((object_id, prev_file_id)) = existing else {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(ObjectOpError::Conflict);
    };

    let (new_file_id, is_new) =
        match deduplicate_or_create_file(&conn, bucket_id, candidate_uid, digest, size) {
            Ok(v) => v,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err.into());
            }
        };

    if let Err(err) = conn.execute(
        "UPDATE objects SET file_id = ?1, content_type_mime = ?2 WHERE id = ?3",
        params![new_file_id, content_type_mime, object_id],
    ) {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(err.into());
    }

    let remaining = match conn.query_row(
        "UPDATE files SET ref_count = ref_count - 1 WHERE id = ?1 RETURNING ref_count",
        params![prev_file_id],
        |row| row.get::<_, i64>(0),
    ) {
        Ok(v) => v,
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(err.into());
        }
    };

    let orphaned_uid = if remaining == 0 {
        match conn.query_row(
            "DELETE FROM files WHERE id = ?1 RETURNING uid",
            params![prev_file_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(uid) => Some(uid),
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err.into());
            }
        }
    } else {
        None
    };

    if let Err(err) = conn.execute_batch("COMMIT") {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(err.into());
    }

    Ok(PostCommitCleanup {
        duplicate_uid: (!is_new).then(|| candidate_uid.to_string()),
        orphaned_uid,
    })
}

/// Look up an object by key, joined with its file row. `None` when no
/// object exists under the key.
pub fn get_object_by_key(
    store: &MetadataStore,
    bucket_id: i64,
    key: &[u8],
) -> anyhow::Result<Option<ObjectRecord>> {
    let conn = store.lock();
    let record = conn
        .query_row(
            "SELECT o.id, o.created_ms, o.content_type_mime, f.digest, f.size, f.uid
             FROM objects o
             INNER JOIN files f ON f.id = o.file_id
             WHERE o.bucket_id = ?1 AND o.key = ?2",
            params![bucket_id, key],
            |row| {
                let digest: Vec<u8> = row.get(3)?;
                let size: i64 = row.get(4)?;
                Ok(ObjectRecord {
                    id: row.get(0)?,
                    created_ms: row.get(1)?,
                    content_type_mime: row.get(2)?,
                    etag: etag_for_digest(&digest),
                    digest,
                    size: size as u64,
                    uid: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}
