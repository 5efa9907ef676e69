//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  A single connection lives behind a `Mutex`; write
//! operations hold the guard for their full transaction, which also gives
//! the in-memory debug store its required capacity of one.

use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use sha2::{Digest, Sha512};

/// Fixture bucket name seeded in debug mode.
pub const DEBUG_BUCKET_NAME: &str = "test-bucket";

/// Fixture API-key secret (64 raw bytes) seeded in debug mode.
pub const DEBUG_API_SECRET: &[u8; 64] =
    b"0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

/// Fixture MAC-key secret (32 raw bytes) seeded in debug mode under
/// selector 1.
pub const DEBUG_MAC_SECRET: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Metadata store backed by a single SQLite connection.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

/// Raw bucket row plus subresource rows, as loaded for the cache.
pub struct BucketRows {
    pub id: i64,
    pub created_ms: i64,
    pub access_rules: Vec<AccessRuleRow>,
    pub api_keys: Vec<ApiKeyRow>,
    pub mac_keys: Vec<MacKeyRow>,
}

pub struct AccessRuleRow {
    pub id: i64,
    pub regex: String,
    pub action: u8,
}

pub struct ApiKeyRow {
    pub id: i64,
    pub created_ms: i64,
    pub key_hashed: Vec<u8>,
}

pub struct MacKeyRow {
    pub id: i64,
    pub selector: u32,
    pub secret: Vec<u8>,
    pub created_ms: i64,
}

impl MetadataStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database. There is exactly one connection, so
    /// the instance never silently spawns a second empty memory store.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the store connection. Write operations keep the guard for
    /// their entire transaction.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("metadata store mutex poisoned")
    }

    /// Create all tables and indexes if they do not already exist.
    /// Idempotent; failures here are fatal at process start.
    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS buckets (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT UNIQUE NOT NULL,
                created_ms  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bucket_auth_api_keys (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id   INTEGER NOT NULL,
                name        TEXT UNIQUE NOT NULL,
                created_ms  INTEGER NOT NULL,
                key_hashed  BLOB NOT NULL,

                FOREIGN KEY (bucket_id) REFERENCES buckets (id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_bucket_auth_api_keys_bucket_id
                ON bucket_auth_api_keys (bucket_id);

            CREATE TABLE IF NOT EXISTS bucket_access_rules (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id   INTEGER NOT NULL,
                priority    INTEGER NOT NULL,
                regex       TEXT NOT NULL,
                action      INTEGER NOT NULL,

                FOREIGN KEY (bucket_id) REFERENCES buckets (id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_bucket_access_rules_bucket_id
                ON bucket_access_rules (bucket_id);

            CREATE TABLE IF NOT EXISTS bucket_object_auth_mac (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id   INTEGER NOT NULL,
                selector    INTEGER NOT NULL,
                secret      BLOB NOT NULL,
                created_ms  INTEGER NOT NULL,

                FOREIGN KEY (bucket_id) REFERENCES buckets (id) ON DELETE CASCADE,
                UNIQUE (bucket_id, selector)
            );

            CREATE TABLE IF NOT EXISTS files (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id   INTEGER NOT NULL,
                created_ms  INTEGER NOT NULL,
                digest      BLOB NOT NULL,
                size        INTEGER NOT NULL,
                ref_count   INTEGER NOT NULL,
                uid         TEXT UNIQUE NOT NULL,

                FOREIGN KEY (bucket_id) REFERENCES buckets (id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_files_digest
                ON files (digest, size);

            CREATE TABLE IF NOT EXISTS objects (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id         INTEGER NOT NULL,
                file_id           INTEGER NOT NULL,
                created_ms        INTEGER NOT NULL,
                -- Raw request-path bytes; compared byte-for-byte, never
                -- decoded or normalized.
                key               BLOB NOT NULL,
                content_type_mime TEXT,

                FOREIGN KEY (bucket_id) REFERENCES buckets (id) ON DELETE CASCADE,
                FOREIGN KEY (file_id) REFERENCES files (id),
                UNIQUE (bucket_id, key)
            );
            ",
        )?;
        Ok(())
    }

    /// Insert the debug fixture: bucket, one API key, one MAC key under
    /// selector 1. Debug mode only.
    pub fn seed_debug_fixture(&self) -> anyhow::Result<()> {
        let conn = self.lock();
        let now = now_ms();

        conn.execute(
            "INSERT INTO buckets (name, created_ms) VALUES (?1, ?2)",
            params![DEBUG_BUCKET_NAME, now],
        )?;
        let bucket_id = conn.last_insert_rowid();

        let key_hashed = Sha512::digest(DEBUG_API_SECRET);
        conn.execute(
            "INSERT INTO bucket_auth_api_keys (bucket_id, name, created_ms, key_hashed)
             VALUES (?1, ?2, ?3, ?4)",
            params![bucket_id, "Debug Key", now, key_hashed.as_slice()],
        )?;

        conn.execute(
            "INSERT INTO bucket_object_auth_mac (bucket_id, selector, secret, created_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![bucket_id, 1u32, &DEBUG_MAC_SECRET[..], now],
        )?;

        Ok(())
    }

    /// Load a bucket and all its subresources by name. Four queries; the
    /// access rules come back ordered by ascending priority. Returns
    /// `None` when no bucket of this name exists.
    pub fn load_bucket_rows(&self, name: &str) -> anyhow::Result<Option<BucketRows>> {
        use rusqlite::OptionalExtension;

        let conn = self.lock();

        let head = conn
            .query_row(
                "SELECT id, created_ms FROM buckets WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((id, created_ms)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, selector, secret, created_ms
             FROM bucket_object_auth_mac WHERE bucket_id = ?1",
        )?;
        let mac_keys = stmt
            .query_map(params![id], |row| {
                Ok(MacKeyRow {
                    id: row.get(0)?,
                    selector: row.get::<_, i64>(1)? as u32,
                    secret: row.get(2)?,
                    created_ms: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, regex, action FROM bucket_access_rules
             WHERE bucket_id = ?1 ORDER BY priority ASC",
        )?;
        let access_rules = stmt
            .query_map(params![id], |row| {
                Ok(AccessRuleRow {
                    id: row.get(0)?,
                    regex: row.get(1)?,
                    action: row.get::<_, i64>(2)? as u8,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, created_ms, key_hashed
             FROM bucket_auth_api_keys WHERE bucket_id = ?1",
        )?;
        let api_keys = stmt
            .query_map(params![id], |row| {
                Ok(ApiKeyRow {
                    id: row.get(0)?,
                    created_ms: row.get(1)?,
                    key_hashed: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(BucketRows {
            id,
            created_ms,
            access_rules,
            api_keys,
            mac_keys,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> MetadataStore {
        let store = MetadataStore::open_in_memory().expect("in-memory store");
        store.init_schema().expect("schema");
        store
    }

    #[test]
    fn test_schema_idempotent() {
        let store = test_store();
        store.init_schema().expect("second init_schema failed");
        store.init_schema().expect("third init_schema failed");
    }

    #[test]
    fn test_load_missing_bucket_is_none() {
        let store = test_store();
        assert!(store.load_bucket_rows("nope").unwrap().is_none());
    }

    #[test]
    fn test_debug_fixture_loads() {
        let store = test_store();
        store.seed_debug_fixture().expect("seed");

        let rows = store
            .load_bucket_rows(DEBUG_BUCKET_NAME)
            .unwrap()
            .expect("fixture bucket");
        assert_eq!(rows.api_keys.len(), 1);
        assert_eq!(rows.api_keys[0].key_hashed.len(), 64);
        assert_eq!(rows.mac_keys.len(), 1);
        assert_eq!(rows.mac_keys[0].selector, 1);
        assert_eq!(rows.mac_keys[0].secret, DEBUG_MAC_SECRET.to_vec());
        assert!(rows.access_rules.is_empty());
    }

    #[test]
    fn test_access_rules_ordered_by_priority() {
        let store = test_store();
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO buckets (name, created_ms) VALUES ('b', 0)",
                [],
            )
            .unwrap();
            // Insert out of priority order on purpose.
            conn.execute(
                "INSERT INTO bucket_access_rules (bucket_id, priority, regex, action)
                 VALUES (1, 20, 'second', 0), (1, 10, 'first', 2)",
                [],
            )
            .unwrap();
        }
        let rows = store.load_bucket_rows("b").unwrap().unwrap();
        assert_eq!(rows.access_rules[0].regex, "first");
        assert_eq!(rows.access_rules[1].regex, "second");
    }

    #[test]
    fn test_object_key_unique_per_bucket() {
        let store = test_store();
        let conn = store.lock();
        conn.execute_batch(
            "INSERT INTO buckets (name, created_ms) VALUES ('a', 0), ('b', 0);
             INSERT INTO files (bucket_id, created_ms, digest, size, ref_count, uid)
                 VALUES (1, 0, x'00', 0, 2, 'uid-1');",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO objects (bucket_id, file_id, created_ms, key) VALUES (1, 1, 0, x'2f6b')",
            [],
        )
        .unwrap();
        // Same key in a different bucket is fine.
        conn.execute(
            "INSERT INTO objects (bucket_id, file_id, created_ms, key) VALUES (2, 1, 0, x'2f6b')",
            [],
        )
        .unwrap();
        // Duplicate in the same bucket violates the unique constraint.
        let err = conn
            .execute(
                "INSERT INTO objects (bucket_id, file_id, created_ms, key) VALUES (1, 1, 0, x'2f6b')",
                [],
            )
            .unwrap_err();
        match err {
            rusqlite::Error::SqliteFailure(e, _) => {
                assert_eq!(e.code, rusqlite::ErrorCode::ConstraintViolation)
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
