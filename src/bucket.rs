//! Bucket snapshots and the in-memory bucket cache.
//!
//! A snapshot is a consistent point-in-time read of a bucket and all its
//! subresources (access rules, API keys, MAC keys), loaded lazily on
//! first use and immutable after publication.  Concurrent loaders may
//! race to insert; last writer wins — every produced snapshot is
//! equivalent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use regex::Regex;
use sha2::{Digest, Sha512};

use crate::metadata::store::{BucketRows, MetadataStore};

/// Outcome of access-rule evaluation for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    /// Everyone may read, signed or not.
    AllowPublic,
    /// Only requests with a valid signature (or an API key) may read.
    /// Also the default when no rule matches.
    AllowSigned,
    /// Nobody may access, API keys excepted.
    DenyAll,
}

impl AccessAction {
    fn from_stored(value: u8) -> anyhow::Result<Self> {
        match value {
            0 => Ok(AccessAction::AllowPublic),
            1 => Ok(AccessAction::AllowSigned),
            2 => Ok(AccessAction::DenyAll),
            other => anyhow::bail!("unknown access rule action {other}"),
        }
    }
}

/// One compiled per-path access rule.
pub struct AccessRule {
    pub id: i64,
    regex: Regex,
    action: AccessAction,
}

/// Cached API key entry, keyed in the snapshot by `SHA-512(secret)`.
pub struct ApiKey {
    pub id: i64,
    pub created_ms: i64,
}

/// MAC signing key addressed by its selector.
pub struct MacKey {
    pub id: i64,
    pub selector: u32,
    pub secret: [u8; 32],
    pub created_ms: i64,
}

/// Immutable bucket snapshot.
pub struct Bucket {
    pub id: i64,
    pub name: String,
    pub created_ms: i64,
    access_rules: Vec<AccessRule>,
    api_keys: HashMap<[u8; 64], ApiKey>,
    mac_keys: HashMap<u32, MacKey>,
}

impl Bucket {
    /// Build a snapshot from raw store rows, compiling the access-rule
    /// regexes. A regex or key blob that fails to validate is a
    /// provisioning error and fails the load.
    pub fn from_rows(name: &str, rows: BucketRows) -> anyhow::Result<Self> {
        let mut access_rules = Vec::with_capacity(rows.access_rules.len());
        for rule in rows.access_rules {
            let regex = Regex::new(&rule.regex).map_err(|e| {
                anyhow::anyhow!("invalid access rule regex (rule {}): {e}", rule.id)
            })?;
            access_rules.push(AccessRule {
                id: rule.id,
                regex,
                action: AccessAction::from_stored(rule.action)?,
            });
        }

        let mut api_keys = HashMap::with_capacity(rows.api_keys.len());
        for key in rows.api_keys {
            let hashed: [u8; 64] = key.key_hashed.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("API key {} hash is not 64 bytes", key.id)
            })?;
            api_keys.insert(
                hashed,
                ApiKey {
                    id: key.id,
                    created_ms: key.created_ms,
                },
            );
        }

        let mut mac_keys = HashMap::with_capacity(rows.mac_keys.len());
        for key in rows.mac_keys {
            let secret: [u8; 32] = key.secret.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("MAC key {} secret is not 32 bytes", key.id)
            })?;
            mac_keys.insert(
                key.selector,
                MacKey {
                    id: key.id,
                    selector: key.selector,
                    secret,
                    created_ms: key.created_ms,
                },
            );
        }

        Ok(Self {
            id: rows.id,
            name: name.to_string(),
            created_ms: rows.created_ms,
            access_rules,
            api_keys,
            mac_keys,
        })
    }

    /// First rule whose regex matches the key wins; default AllowSigned.
    pub fn access_for_key(&self, key: &str) -> AccessAction {
        for rule in &self.access_rules {
            if rule.regex.is_match(key) {
                return rule.action;
            }
        }
        AccessAction::AllowSigned
    }

    /// Look up an API key by the presented secret: base64 (standard, no
    /// padding) decoding to exactly 64 bytes, then `SHA-512(decoded)` as
    /// the map key. The raw secret is never stored or compared.
    pub fn api_key(&self, presented: &[u8]) -> Option<&ApiKey> {
        let decoded = STANDARD_NO_PAD.decode(presented).ok()?;
        if decoded.len() != 64 {
            return None;
        }
        let mut hashed = [0u8; 64];
        hashed.copy_from_slice(&Sha512::digest(&decoded));
        self.api_keys.get(&hashed)
    }

    /// Look up a MAC key by selector.
    pub fn mac_key(&self, selector: u32) -> Option<&MacKey> {
        self.mac_keys.get(&selector)
    }
}

/// Name-keyed cache of bucket snapshots.
pub struct BucketCache {
    inner: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl Default for BucketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a bucket snapshot, loading it from the store on a miss.
    /// Returns `None` when no bucket of this name exists (the caller
    /// renders 404); store errors propagate.
    pub fn get_or_load(
        &self,
        store: &MetadataStore,
        name: &str,
    ) -> anyhow::Result<Option<Arc<Bucket>>> {
        {
            let cache = self.inner.read().expect("bucket cache lock poisoned");
            if let Some(bucket) = cache.get(name) {
                return Ok(Some(bucket.clone()));
            }
        }

        let Some(rows) = store.load_bucket_rows(name)? else {
            return Ok(None);
        };
        let bucket = Arc::new(Bucket::from_rows(name, rows)?);

        let mut cache = self.inner.write().expect("bucket cache lock poisoned");
        cache.insert(name.to_string(), bucket.clone());
        Ok(Some(bucket))
    }
}
