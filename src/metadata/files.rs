//! Content-addressed file rows with reference counting.
//!
//! `(digest, size)` identifies content across the whole store; the row's
//! refcount is the number of objects pointing at it.  Uniqueness of
//! `(digest, size)` is not enforced by an index — correctness depends on
//! every caller running inside an IMMEDIATE (write-reserving)
//! transaction, which serializes the probe-then-insert against all other
//! writers.

use rusqlite::{params, Connection, OptionalExtension};

use super::store::now_ms;

/// Bump the refcount of an existing file row matching `(digest, size)`,
/// or insert a new row with refcount 1 under `candidate_uid`.
///
/// Returns the file id and whether a new row was created. When the
/// result is `(_, false)` the caller owns deleting the physical blob at
/// `candidate_uid` after its transaction commits.
///
/// Must be called on a connection with an open IMMEDIATE or EXCLUSIVE
/// transaction; never commits or rolls back itself.
pub fn deduplicate_or_create_file(
    conn: &Connection,
    bucket_id: i64,
    candidate_uid: &str,
    digest: &[u8; 32],
    size: u64,
) -> rusqlite::Result<(i64, bool)> {
    let existing = conn
        .query_row(
            "UPDATE files SET ref_count = ref_count + 1
             WHERE id = (SELECT id FROM files WHERE digest = ?1 AND size = ?2 LIMIT 1)
             RETURNING id",
            params![&digest[..], size as i64],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    if let Some(file_id) = existing {
        return Ok((file_id, false));
    }

    let file_id = conn.query_row(
        "INSERT INTO files (bucket_id, created_ms, digest, size, ref_count, uid)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         RETURNING id",
        params![bucket_id, now_ms(), &digest[..], size as i64, candidate_uid],
        |row| row.get(0),
    )?;

    Ok((file_id, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::MetadataStore;

    fn test_store() -> MetadataStore {
        let store = MetadataStore::open_in_memory().expect("store");
        store.init_schema().expect("schema");
        store
            .lock()
            .execute("INSERT INTO buckets (name, created_ms) VALUES ('b', 0)", [])
            .expect("bucket");
        store
    }

    fn refcount(conn: &Connection, file_id: i64) -> i64 {
        conn.query_row(
            "SELECT ref_count FROM files WHERE id = ?1",
            params![file_id],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_first_sight_inserts() {
        let store = test_store();
        let conn = store.lock();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let (id, is_new) =
            deduplicate_or_create_file(&conn, 1, "uid-a", &[7u8; 32], 5).unwrap();
        conn.execute_batch("COMMIT").unwrap();

        assert!(is_new);
        assert_eq!(refcount(&conn, id), 1);
        let uid: String = conn
            .query_row("SELECT uid FROM files WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(uid, "uid-a");
    }

    #[test]
    fn test_second_sight_bumps_refcount() {
        let store = test_store();
        let conn = store.lock();

        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let (first_id, _) =
            deduplicate_or_create_file(&conn, 1, "uid-a", &[7u8; 32], 5).unwrap();
        conn.execute_batch("COMMIT").unwrap();

        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let (second_id, is_new) =
            deduplicate_or_create_file(&conn, 1, "uid-b", &[7u8; 32], 5).unwrap();
        conn.execute_batch("COMMIT").unwrap();

        assert!(!is_new);
        assert_eq!(first_id, second_id);
        assert_eq!(refcount(&conn, first_id), 2);

        // Only one row exists for the content; uid-b was never persisted.
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_same_digest_different_size_is_distinct() {
        let store = test_store();
        let conn = store.lock();

        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let (a, _) = deduplicate_or_create_file(&conn, 1, "uid-a", &[7u8; 32], 5).unwrap();
        let (b, is_new) =
            deduplicate_or_create_file(&conn, 1, "uid-b", &[7u8; 32], 6).unwrap();
        conn.execute_batch("COMMIT").unwrap();

        assert!(is_new);
        assert_ne!(a, b);
    }

    #[test]
    fn test_dedup_is_store_wide() {
        let store = test_store();
        let conn = store.lock();
        conn.execute(
            "INSERT INTO buckets (name, created_ms) VALUES ('other', 0)",
            [],
        )
        .unwrap();

        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let (a, _) = deduplicate_or_create_file(&conn, 1, "uid-a", &[9u8; 32], 3).unwrap();
        let (b, is_new) =
            deduplicate_or_create_file(&conn, 2, "uid-b", &[9u8; 32], 3).unwrap();
        conn.execute_batch("COMMIT").unwrap();

        assert!(!is_new);
        assert_eq!(a, b);
    }
}
