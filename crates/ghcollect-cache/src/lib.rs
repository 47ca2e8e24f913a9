//! Content-addressed, on-disk cache of prior API responses.
//!
//! Two schemas coexist, each owned by a different writer:
//!
//! - *bare*: the decoded JSON body only, used for data the caller treats as
//!   immutable (a blob at a given content hash never changes). A 404 can
//!   also be recorded so a missing blob is not re-requested every run.
//! - *wrapped*: `{status, body, etag, link}` plus a write timestamp, used by
//!   the general API client and subject to a TTL.
//!
//! A reader must know which schema a key was written under; each call site
//! fixes its schema and never mixes the two.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default TTL for wrapped (general) cache entries: 30 days.
pub const DEFAULT_WRAPPED_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a bare-schema lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BareHit {
    /// The cached body.
    Found(Value),
    /// The upstream previously reported the resource does not exist.
    NotFound,
}

/// A wrapped (general) cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedEntry {
    pub status: u16,
    pub body: Value,
    pub etag: Option<String>,
    pub link: Option<String>,
    stored_at_unix: u64,
}

impl WrappedEntry {
    #[must_use]
    pub fn new(status: u16, body: Value, etag: Option<String>, link: Option<String>) -> Self {
        Self {
            status,
            body,
            etag,
            link,
            stored_at_unix: now_unix(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let age = now_unix().saturating_sub(self.stored_at_unix);
        age >= ttl.as_secs()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A marker stored under the bare schema to represent a cached "not found"
/// outcome without changing the on-disk shape of a real body (a normal API
/// body is extremely unlikely to be an object with exactly this one key).
const NOT_FOUND_MARKER: &str = "__ghcollect_bare_not_found__";

fn is_not_found_marker(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key(NOT_FOUND_MARKER))
}

/// Derive the canonical cache key for a request.
///
/// The key is the hex encoding of the first 8 bytes of a SHA-256 hash of
/// `endpoint|k1=v1&k2=v2&...`, with parameters sorted by key and the method
/// and body appended when non-default. Stable across process restarts, OS,
/// and architecture.
#[must_use]
pub fn cache_key(
    endpoint: &str,
    params: &[(String, String)],
    method: Option<&str>,
    body: Option<&str>,
) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut canonical = String::with_capacity(endpoint.len() + 32);
    canonical.push_str(endpoint);
    canonical.push('|');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            canonical.push('&');
        }
        canonical.push_str(k);
        canonical.push('=');
        canonical.push_str(v);
    }
    if let Some(method) = method {
        if !method.eq_ignore_ascii_case("GET") {
            canonical.push('|');
            canonical.push_str(method);
        }
    }
    if let Some(body) = body {
        canonical.push('|');
        canonical.push_str(body);
    }

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// A keyed, durable store mapping request fingerprints to prior responses.
///
/// Shared across all runs and all commands on a machine; safe for
/// concurrent readers and writers of distinct keys. Concurrent writers of
/// the *same* key produce one surviving file, which is acceptable because
/// both would have written equivalent content.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
}

impl ResponseCache {
    /// Open (creating if necessary) a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&root).map_err(|source| CacheError::CreateDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Open the default cache root: `~/.cache/ghcollect`, falling back to a
    /// temp directory when the preferred location is unwritable.
    ///
    /// # Errors
    ///
    /// Returns an error if even the temp-directory fallback cannot be
    /// created.
    pub fn open_default() -> Result<Self, CacheError> {
        Self::open(default_cache_dir())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Look up a bare-schema entry. Degrades silently to a miss on any read
    /// or parse error (corrupt file, concurrent-write race).
    pub async fn get_bare(&self, key: &str) -> Option<BareHit> {
        let path = self.path_for(key);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let value: Value = serde_json::from_str(&content).ok()?;
        if is_not_found_marker(&value) {
            Some(BareHit::NotFound)
        } else {
            Some(BareHit::Found(value))
        }
    }

    /// Write a bare-schema body. Write errors are logged and swallowed — a
    /// run must never fail because caching failed.
    pub async fn put_bare_found(&self, key: &str, value: &Value) {
        self.write_atomic(key, value).await;
    }

    /// Record that the upstream reported the resource as not found.
    pub async fn put_bare_not_found(&self, key: &str) {
        let marker = serde_json::json!({ NOT_FOUND_MARKER: true });
        self.write_atomic(key, &marker).await;
    }

    /// Look up a wrapped-schema entry, honoring `ttl`. An expired entry is
    /// treated as a miss (it is not evicted; §1 Non-goals excludes cache
    /// eviction).
    pub async fn get_wrapped(&self, key: &str, ttl: Duration) -> Option<WrappedEntry> {
        let path = self.path_for(key);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let entry: WrappedEntry = serde_json::from_str(&content).ok()?;
        if entry.is_expired(ttl) {
            None
        } else {
            Some(entry)
        }
    }

    /// Write a wrapped-schema entry.
    pub async fn put_wrapped(&self, key: &str, entry: &WrappedEntry) {
        self.write_atomic(key, entry).await;
    }

    async fn write_atomic(&self, key: &str, value: &impl Serialize) {
        let Ok(serialized) = serde_json::to_vec(value) else {
            tracing::warn!(key, "failed to serialize cache entry");
            return;
        };
        let final_path = self.path_for(key);
        let tmp_path = self.root.join(format!("{key}.json.tmp-{}", std::process::id()));
        if let Err(source) = tokio::fs::write(&tmp_path, &serialized).await {
            tracing::warn!(key, error = %source, "failed to write cache temp file");
            return;
        }
        if let Err(source) = tokio::fs::rename(&tmp_path, &final_path).await {
            tracing::warn!(key, error = %source, "failed to rename cache temp file into place");
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("ghcollect"))
        .unwrap_or_else(|| std::env::temp_dir().join("ghcollect"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn cache_key_is_deterministic() {
        let a = cache_key("/search/code", &params(&[("q", "foo")]), None, None);
        let b = cache_key("/search/code", &params(&[("q", "foo")]), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_ignores_param_order() {
        let a = cache_key("/search/code", &params(&[("q", "foo"), ("size", "1")]), None, None);
        let b = cache_key("/search/code", &params(&[("size", "1"), ("q", "foo")]), None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_is_16_hex_chars() {
        let key = cache_key("/search/code", &[], None, None);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_key_differs_on_method_and_body() {
        let base = cache_key("/graphql", &[], None, None);
        let with_method = cache_key("/graphql", &[], Some("POST"), None);
        let with_body = cache_key("/graphql", &[], Some("POST"), Some("{}"));
        assert_ne!(base, with_method);
        assert_ne!(with_method, with_body);
    }

    #[test]
    fn cache_key_get_method_is_default() {
        let implicit = cache_key("/repos/foo/bar", &[], None, None);
        let explicit_get = cache_key("/repos/foo/bar", &[], Some("GET"), None);
        assert_eq!(implicit, explicit_get);
    }

    #[tokio::test]
    async fn bare_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::open(dir.path().to_path_buf()).expect("open");
        let key = "deadbeefdeadbeef";
        assert!(cache.get_bare(key).await.is_none());

        let body = serde_json::json!({"sha": "abc123", "size": 42});
        cache.put_bare_found(key, &body).await;
        assert_eq!(cache.get_bare(key).await, Some(BareHit::Found(body)));
    }

    #[tokio::test]
    async fn bare_not_found_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::open(dir.path().to_path_buf()).expect("open");
        let key = "cafebabecafebabe";
        cache.put_bare_not_found(key).await;
        assert_eq!(cache.get_bare(key).await, Some(BareHit::NotFound));
    }

    #[tokio::test]
    async fn wrapped_round_trip_respects_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::open(dir.path().to_path_buf()).expect("open");
        let key = "0011223344556677";
        let entry = WrappedEntry::new(200, serde_json::json!({"ok": true}), None, None);
        cache.put_wrapped(key, &entry).await;

        let hit = cache.get_wrapped(key, Duration::from_secs(3600)).await;
        assert_eq!(hit, Some(entry));

        // A TTL of zero treats every entry (even one just written) as expired.
        let expired = cache.get_wrapped(key, Duration::from_secs(0)).await;
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::open(dir.path().to_path_buf()).expect("open");
        let key = "ffffffffffffffff";
        tokio::fs::write(dir.path().join(format!("{key}.json")), b"not json")
            .await
            .expect("write garbage");
        assert!(cache.get_bare(key).await.is_none());
    }
}
