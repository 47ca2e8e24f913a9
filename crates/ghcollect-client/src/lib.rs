//! Rate-limited, cache-backed client for the upstream REST and GraphQL APIs.
//!
//! A cache hit never touches the network and never consumes a rate-limit
//! token; a cache miss is throttled by a per-family [`TokenBucket`], sent,
//! and — on success — written back under the schema the caller asked for.
//! Rate-limit signals (429, or 403 with an exhausted quota) retry forever
//! with a backoff honoring `Retry-After`/`X-RateLimit-Reset` when present;
//! server errors and network failures retry a bounded number of times;
//! every other status is returned to the caller untouched.

mod bucket;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ghcollect_cache::{BareHit, ResponseCache, WrappedEntry};
use reqwest::Method;
use serde_json::Value;

use bucket::TokenBucket;

const MAX_TRANSIENT_ATTEMPTS: u32 = 5;
const INITIAL_TRANSIENT_BACKOFF: Duration = Duration::from_secs(2);
const INITIAL_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
const MAX_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("resource not found")]
    NotFound,
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("request failed after retries: {0}")]
    Network(#[from] reqwest::Error),
}

/// Which rate-limit bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiFamily {
    Rest,
    Graph,
}

/// How a request's result should be read from and written to the cache.
#[derive(Debug, Clone)]
pub enum CacheSchema {
    /// Treat the body as immutable; remember a 404 as a standing miss.
    Bare,
    /// TTL-bounded `{status, body, etag, link}`, only written on success.
    Wrapped { ttl: Duration },
    /// Never read or write the cache (non-idempotent requests).
    Bypass,
}

/// A REST response with the headers the caller may need for pagination or
/// conditional requests.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
    pub etag: Option<String>,
    pub link: Option<String>,
}

/// Extract the `rel="next"` URL from a `Link` header, if present.
#[must_use]
pub fn next_link(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|part| {
        let mut url = None;
        let mut is_next = false;
        for segment in part.split(';') {
            let segment = segment.trim();
            if let Some(u) = segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                url = Some(u.to_string());
            } else if segment == "rel=\"next\"" {
                is_next = true;
            }
        }
        is_next.then_some(url).flatten()
    })
}

pub struct ApiClientConfig {
    pub token: String,
    pub base_url: String,
    pub graphql_url: String,
    pub cache: Arc<ResponseCache>,
    pub rest_requests_per_sec: f64,
    pub graph_requests_per_sec: f64,
}

impl ApiClientConfig {
    #[must_use]
    pub fn new(token: String, cache: Arc<ResponseCache>) -> Self {
        Self {
            token,
            base_url: "https://api.github.com".to_string(),
            graphql_url: "https://api.github.com/graphql".to_string(),
            cache,
            rest_requests_per_sec: 1.3,
            graph_requests_per_sec: 30.0,
        }
    }
}

/// Rate-limited, cache-backed client for the upstream API.
///
/// Cheap to clone: the HTTP connection pool, rate limiters, and cache handle
/// are all shared via internal `Arc`s (directly, or indirectly through
/// `reqwest::Client`).
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    graphql_url: String,
    cache: Arc<ResponseCache>,
    rest_bucket: Arc<TokenBucket>,
    graph_bucket: Arc<TokenBucket>,
}

impl ApiClient {
    /// # Panics
    ///
    /// Panics if the underlying `reqwest::Client` cannot be built (TLS
    /// backend initialization failure); this happens at most once at
    /// startup, not per request.
    #[must_use]
    pub fn new(config: ApiClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("ghcollect")
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            token: config.token,
            base_url: config.base_url,
            graphql_url: config.graphql_url,
            cache: config.cache,
            rest_bucket: Arc::new(TokenBucket::new(config.rest_requests_per_sec)),
            graph_bucket: Arc::new(TokenBucket::new(config.graph_requests_per_sec)),
        }
    }

    /// Fetch a resource whose body never changes once it exists (e.g. a blob
    /// at a fixed content hash). A 404 is remembered so a missing object is
    /// not re-requested on a later run.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] when the resource does not exist,
    /// [`ClientError::Upstream`] for any other non-success status, and
    /// [`ClientError::Network`] if the request could not be completed after
    /// retrying transient failures.
    #[tracing::instrument(skip(self))]
    pub async fn get_immutable(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        skip_cache: bool,
    ) -> Result<Value, ClientError> {
        let key = ghcollect_cache::cache_key(endpoint, params, None, None);
        if !skip_cache {
            match self.cache.get_bare(&key).await {
                Some(BareHit::Found(body)) => return Ok(body),
                Some(BareHit::NotFound) => return Err(ClientError::NotFound),
                None => {}
            }
        }

        let url = format!("{}{endpoint}", self.base_url);
        let resp = self
            .execute(ApiFamily::Rest, Method::GET, &url, params, None)
            .await?;

        match resp.status {
            200..=299 => {
                self.cache.put_bare_found(&key, &resp.body).await;
                Ok(resp.body)
            }
            404 => {
                self.cache.put_bare_not_found(&key).await;
                Err(ClientError::NotFound)
            }
            status => Err(ClientError::Upstream {
                status,
                body: resp.body.to_string(),
            }),
        }
    }

    /// General REST call against `endpoint`, cached per `schema`.
    ///
    /// `skip_cache` only short-circuits the read; a fresh response is still
    /// written through so a later caller without `skip_cache` observes it.
    /// Non-`GET` methods always bypass the cache regardless of `schema`,
    /// since the request is not idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Upstream`] for a non-success status and
    /// [`ClientError::Network`] if the request could not be completed after
    /// retrying transient failures.
    #[tracing::instrument(skip(self))]
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        schema: CacheSchema,
        skip_cache: bool,
    ) -> Result<RestResponse, ClientError> {
        let schema = if method == Method::GET { schema } else { CacheSchema::Bypass };
        let method_label = if method == Method::GET { None } else { Some(method.as_str()) };
        let key = ghcollect_cache::cache_key(endpoint, params, method_label, None);

        if !skip_cache {
            if let CacheSchema::Wrapped { ttl } = &schema {
                if let Some(entry) = self.cache.get_wrapped(&key, *ttl).await {
                    return Ok(RestResponse {
                        status: entry.status,
                        body: entry.body,
                        etag: entry.etag,
                        link: entry.link,
                    });
                }
            }
        }

        let url = format!("{}{endpoint}", self.base_url);
        let resp = self
            .execute(ApiFamily::Rest, method, &url, params, None)
            .await?;

        if resp.status < 300 {
            if let CacheSchema::Wrapped { .. } = &schema {
                let entry = WrappedEntry::new(resp.status, resp.body.clone(), resp.etag.clone(), resp.link.clone());
                self.cache.put_wrapped(&key, &entry).await;
            }
            Ok(resp)
        } else {
            Err(ClientError::Upstream {
                status: resp.status,
                body: resp.body.to_string(),
            })
        }
    }

    /// Run a GraphQL query, cached (by default) under the wrapped schema
    /// keyed on the query text and variables together.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Upstream`] for a non-success status and
    /// [`ClientError::Network`] if the request could not be completed after
    /// retrying transient failures.
    #[tracing::instrument(skip(self, query))]
    pub async fn graphql(
        &self,
        query: &str,
        variables: Option<Value>,
        skip_cache: bool,
    ) -> Result<Value, ClientError> {
        let payload = serde_json::json!({
            "query": query,
            "variables": variables.unwrap_or(Value::Null),
        });
        let key = ghcollect_cache::cache_key("/graphql", &[], Some("POST"), Some(&payload.to_string()));

        if !skip_cache {
            if let Some(entry) = self.cache.get_wrapped(&key, ghcollect_cache::DEFAULT_WRAPPED_TTL).await {
                return Ok(entry.body);
            }
        }

        let resp = self
            .execute(ApiFamily::Graph, Method::POST, &self.graphql_url, &[], Some(&payload))
            .await?;

        if resp.status < 300 {
            let entry = WrappedEntry::new(resp.status, resp.body.clone(), resp.etag.clone(), resp.link.clone());
            self.cache.put_wrapped(&key, &entry).await;
            Ok(resp.body)
        } else {
            Err(ClientError::Upstream {
                status: resp.status,
                body: resp.body.to_string(),
            })
        }
    }

    async fn execute(
        &self,
        family: ApiFamily,
        method: Method,
        url: &str,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse, ClientError> {
        let bucket = match family {
            ApiFamily::Rest => &self.rest_bucket,
            ApiFamily::Graph => &self.graph_bucket,
        };

        let mut transient_attempt = 0u32;
        let mut transient_backoff = INITIAL_TRANSIENT_BACKOFF;
        let mut rate_limit_backoff = INITIAL_RATE_LIMIT_BACKOFF;

        loop {
            bucket.acquire().await;

            let mut req = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json");
            if !params.is_empty() {
                req = req.query(params);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = match req.send().await {
                Ok(response) => response,
                Err(source) => {
                    if transient_attempt >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(ClientError::Network(source));
                    }
                    tracing::warn!(error = %source, attempt = transient_attempt, "request failed, retrying");
                    transient_attempt += 1;
                    tokio::time::sleep(transient_backoff).await;
                    transient_backoff *= 2;
                    continue;
                }
            };

            let status = response.status();
            let etag = header_str(&response, "etag");
            let link = header_str(&response, "link");
            let ratelimit_remaining = header_str(&response, "x-ratelimit-remaining");
            let ratelimit_reset = header_str(&response, "x-ratelimit-reset").and_then(|v| v.parse::<u64>().ok());
            let retry_after = header_str(&response, "retry-after").and_then(|v| v.parse::<u64>().ok());

            let body_bytes = response.bytes().await.unwrap_or_default();

            if is_rate_limited(status.as_u16(), ratelimit_remaining.as_deref(), &body_bytes) {
                let wait = retry_after
                    .map(Duration::from_secs)
                    .or_else(|| ratelimit_reset.map(|reset| seconds_until(reset)))
                    .unwrap_or(rate_limit_backoff);
                tracing::warn!(wait_secs = wait.as_secs(), "rate limited, backing off");
                tokio::time::sleep(wait).await;
                rate_limit_backoff = (rate_limit_backoff * 2).min(MAX_RATE_LIMIT_BACKOFF);
                continue;
            }

            if status.is_server_error() {
                if transient_attempt >= MAX_TRANSIENT_ATTEMPTS {
                    return Err(ClientError::Upstream {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&body_bytes).into_owned(),
                    });
                }
                tracing::warn!(status = status.as_u16(), attempt = transient_attempt, "server error, retrying");
                transient_attempt += 1;
                tokio::time::sleep(transient_backoff).await;
                transient_backoff *= 2;
                continue;
            }

            let value: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);
            return Ok(RestResponse {
                status: status.as_u16(),
                body: value,
                etag,
                link,
            });
        }
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn is_rate_limited(status: u16, ratelimit_remaining: Option<&str>, body: &[u8]) -> bool {
    if status == 429 {
        return true;
    }
    if status != 403 {
        return false;
    }
    if ratelimit_remaining == Some("0") {
        return true;
    }
    String::from_utf8_lossy(body).to_lowercase().contains("rate limit")
}

fn seconds_until(reset_unix: u64) -> Duration {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    Duration::from_secs(reset_unix.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_against(server: &MockServer, cache_dir: &std::path::Path) -> ApiClient {
        let cache = Arc::new(ResponseCache::open(cache_dir.to_path_buf()).expect("open cache"));
        let mut config = ApiClientConfig::new("test-token".to_string(), cache);
        config.base_url = server.uri();
        config.graphql_url = format!("{}/graphql", server.uri());
        ApiClient::new(config)
    }

    #[tokio::test]
    async fn successful_get_is_cached_bare() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/repos/foo/bar"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "bar"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_against(&server, dir.path()).await;
        let first = client.get_immutable("/repos/foo/bar", &[], false).await.expect("ok");
        assert_eq!(first["name"], "bar");

        // Second call must hit the cache, not the mock (expect(1) would panic on drop otherwise).
        let second = client.get_immutable("/repos/foo/bar", &[], false).await.expect("ok");
        assert_eq!(second["name"], "bar");
    }

    #[tokio::test]
    async fn not_found_is_cached_as_miss() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/repos/foo/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Not Found"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_against(&server, dir.path()).await;
        let first = client.get_immutable("/repos/foo/missing", &[], false).await;
        assert!(matches!(first, Err(ClientError::NotFound)));

        let second = client.get_immutable("/repos/foo/missing", &[], false).await;
        assert!(matches!(second, Err(ClientError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_honor_retry_after() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");

        Mock::given(method("GET"))
            .and(path("/repos/foo/rl"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "5"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/rl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = client_against(&server, dir.path()).await;
        let start = tokio::time::Instant::now();
        let result = client.get_immutable("/repos/foo/rl", &[], false).await.expect("eventually ok");
        assert_eq!(result["ok"], true);
        assert!(tokio::time::Instant::now().duration_since(start) >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn server_error_surfaces_after_retry_budget() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/repos/foo/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_against(&server, dir.path()).await;
        let result = client.get_immutable("/repos/foo/flaky", &[], false).await;
        assert!(matches!(result, Err(ClientError::Upstream { status: 503, .. })));
    }

    #[test]
    fn next_link_extracts_rel_next() {
        let header = r#"<https://api.github.com/resource?page=2>; rel="next", <https://api.github.com/resource?page=5>; rel="last""#;
        assert_eq!(next_link(header).as_deref(), Some("https://api.github.com/resource?page=2"));
    }

    #[test]
    fn next_link_absent_on_last_page() {
        let header = r#"<https://api.github.com/resource?page=1>; rel="prev", <https://api.github.com/resource?page=1>; rel="first""#;
        assert_eq!(next_link(header), None);
    }

    #[tokio::test]
    async fn skip_cache_bypasses_stored_entry() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/repos/foo/fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"v": 1})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/foo/fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"v": 2})))
            .mount(&server)
            .await;

        let client = client_against(&server, dir.path()).await;
        let first = client.get_immutable("/repos/foo/fresh", &[], false).await.expect("ok");
        assert_eq!(first["v"], 1);
        let skipped = client.get_immutable("/repos/foo/fresh", &[], true).await.expect("ok");
        assert_eq!(skipped["v"], 2);
    }
}
