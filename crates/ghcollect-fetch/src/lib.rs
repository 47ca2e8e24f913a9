//! Batched enrichment passes over the file set recorded by the collector:
//! content download, repository metadata, and file commit history.
//!
//! Each pass offers two strategies: per-item REST calls through the client
//! (simple, always correct), or batching many items into one aliased
//! GraphQL query (fewer round trips, bounded by the host's query-complexity
//! limit — a batch that is rejected for complexity is halved and retried).
//! An item's own error never blocks the rest of its batch.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ghcollect_client::{ApiClient, CacheSchema, ClientError};
use ghcollect_client::next_link;
use ghcollect_store::{FileRecord, RepoMetadata, ResultStore, StoreError};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which strategy a pass should use.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    /// One REST request per item, through the client's cache and throttle.
    PerItem { concurrency: usize },
    /// `batch_size` items per aliased GraphQL query, halved on a
    /// query-complexity rejection.
    Batched { batch_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Done,
    Skipped,
}

/// Summary of a completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub done: usize,
    pub skipped: usize,
}

impl PassReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Done => self.done += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }

}

fn is_permanent(err: &ClientError) -> bool {
    matches!(err, ClientError::NotFound) || matches!(err, ClientError::Upstream { status, .. } if *status < 500)
}

fn content_path(content_dir: &Path, record: &FileRecord) -> PathBuf {
    content_dir.join(&record.owner).join(&record.repo).join("blob").join(&record.git_ref).join(&record.path)
}

fn history_key(record: &FileRecord) -> String {
    format!("{}/{}/{}", record.owner, record.repo, record.path)
}

/// Escape a value spliced into a GraphQL string literal built by `format!`.
/// Without this, an owner/repo/ref/path containing `"` or `\` breaks the
/// whole synthesized batch query, not just that item's sub-selection.
fn escape_graphql_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// -------------------------------------------------------------------------
// Content pass
// -------------------------------------------------------------------------

/// Download each file's raw bytes to `content_dir/owner/repo/blob/ref/path`.
/// A file already present on disk is skipped without an API call — that
/// presence is the idempotency marker on restart.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn fetch_content(
    client: &ApiClient,
    store: &ResultStore,
    content_dir: &Path,
    strategy: Strategy,
    skip_cache: bool,
) -> Result<PassReport, FetchError> {
    let files = store.list_files().await?;
    let pending: Vec<FileRecord> = files.into_iter().filter(|f| !content_path(content_dir, f).exists()).collect();

    match strategy {
        Strategy::PerItem { concurrency } => {
            let content_dir = content_dir.to_path_buf();
            run_per_item(pending, concurrency, client.clone(), move |client, record| {
                let content_dir = content_dir.clone();
                async move {
                    let body = client.get_immutable(&record.url, &[], skip_cache).await?;
                    let bytes = decode_content_body(&body);
                    let path = content_path(&content_dir, &record);
                    write_file(&path, &bytes).await.map_err(|_| ClientError::NotFound)
                }
            })
            .await
        }
        Strategy::Batched { batch_size } => {
            let (report, outputs) = run_batched(pending, batch_size, client, skip_cache, |record, alias| {
                format!(
                    "{alias}: repository(owner: \"{}\", name: \"{}\") {{ object(expression: \"{}:{}\") {{ ... on Blob {{ text }} }} }}",
                    escape_graphql_string(&record.owner),
                    escape_graphql_string(&record.repo),
                    escape_graphql_string(&record.git_ref),
                    escape_graphql_string(&record.path)
                )
            }, |record, value| {
                let text = value.get("object").and_then(|o| o.get("text")).and_then(Value::as_str).ok_or("no blob text in response")?;
                Ok((record.clone(), text.to_string()))
            }).await?;

            for (record, text) in outputs {
                let path = content_path(content_dir, &record);
                write_file(&path, text.as_bytes()).await?;
            }
            Ok(report)
        }
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|source| FetchError::Io { path: path.to_path_buf(), source })?;
    }
    tokio::fs::write(path, bytes).await.map_err(|source| FetchError::Io { path: path.to_path_buf(), source })
}

fn decode_content_body(body: &Value) -> Vec<u8> {
    use base64::Engine;
    if let Some(encoded) = body.get("content").and_then(Value::as_str) {
        let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&stripped) {
            return decoded;
        }
    }
    body.to_string().into_bytes()
}

// -------------------------------------------------------------------------
// Repo metadata pass
// -------------------------------------------------------------------------

/// Populate the store's `repos` table for every (owner, repo) pair seen in
/// `files` that has no enrichment row yet. Returns the accumulated metadata
/// for the caller to render as `repo_metadata.json`.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub async fn fetch_metadata(
    client: &ApiClient,
    store: &ResultStore,
    strategy: Strategy,
    skip_cache: bool,
) -> Result<(PassReport, Vec<RepoMetadata>), FetchError> {
    let pending = store.repos_missing_metadata().await?;

    let (report, metas): (PassReport, Vec<RepoMetadata>) = match strategy {
        Strategy::PerItem { concurrency } => {
            let results = Arc::new(tokio::sync::Mutex::new(Vec::new()));
            let collected = Arc::clone(&results);
            let report = run_per_item(pending, concurrency, client.clone(), move |client, (owner, repo)| {
                let collected = Arc::clone(&collected);
                async move {
                    let meta = fetch_one_metadata(&client, &owner, &repo, skip_cache).await?;
                    collected.lock().await.push(meta);
                    Ok(())
                }
            })
            .await?;
            (report, Arc::try_unwrap(results).map(tokio::sync::Mutex::into_inner).unwrap_or_default())
        }
        Strategy::Batched { batch_size } => {
            run_batched(pending, batch_size, client, skip_cache, |(owner, repo), alias| {
                format!(
                    "{alias}: repository(owner: \"{}\", name: \"{}\") {{ description stargazerCount forkCount licenseInfo {{ spdxId }} primaryLanguage {{ name }} repositoryTopics(first: 20) {{ nodes {{ topic {{ name }} }} }} }}",
                    escape_graphql_string(owner),
                    escape_graphql_string(repo)
                )
            }, |(owner, repo), value| Ok(parse_repo_metadata(owner.clone(), repo.clone(), value)))
            .await?
        }
    };

    for meta in &metas {
        store.upsert_repo_metadata(meta.clone()).await?;
    }

    Ok((report, store.export_repo_metadata().await?))
}

async fn fetch_one_metadata(client: &ApiClient, owner: &str, repo: &str, skip_cache: bool) -> Result<RepoMetadata, ClientError> {
    let endpoint = format!("/repos/{owner}/{repo}");
    let schema = if skip_cache { CacheSchema::Bypass } else { CacheSchema::Wrapped { ttl: ghcollect_cache::DEFAULT_WRAPPED_TTL } };
    let body = client.request(Method::GET, &endpoint, &[], schema, skip_cache).await?.body;

    Ok(RepoMetadata {
        owner: owner.to_string(),
        repo: repo.to_string(),
        description: body.get("description").and_then(Value::as_str).map(str::to_string),
        stars: body.get("stargazers_count").and_then(Value::as_i64),
        forks: body.get("forks_count").and_then(Value::as_i64),
        topics: body.get("topics").and_then(Value::as_array).map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect()).unwrap_or_default(),
        license: body.get("license").and_then(|l| l.get("spdx_id")).and_then(Value::as_str).map(str::to_string),
        primary_language: body.get("language").and_then(Value::as_str).map(str::to_string),
    })
}

fn parse_repo_metadata(owner: String, repo: String, value: &Value) -> RepoMetadata {
    RepoMetadata {
        owner,
        repo,
        description: value.get("description").and_then(Value::as_str).map(str::to_string),
        stars: value.get("stargazerCount").and_then(Value::as_i64),
        forks: value.get("forkCount").and_then(Value::as_i64),
        topics: value
            .get("repositoryTopics")
            .and_then(|t| t.get("nodes"))
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("topic").and_then(|t| t.get("name")).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        license: value.get("licenseInfo").and_then(|l| l.get("spdxId")).and_then(Value::as_str).map(str::to_string),
        primary_language: value.get("primaryLanguage").and_then(|l| l.get("name")).and_then(Value::as_str).map(str::to_string),
    }
}

// -------------------------------------------------------------------------
// File history pass
// -------------------------------------------------------------------------

/// Extracted commit-history summary for one file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FileHistory {
    pub first_commit_unix: i64,
    pub last_commit_unix: i64,
    pub authors: Vec<String>,
    pub commit_count: u64,
}

/// Fetch each file's commit history, accumulating `owner/repo/path ->
/// FileHistory` for the caller to render as `file_history.json`. Entries
/// already present in `existing` are skipped without an API call.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn fetch_history(
    client: &ApiClient,
    store: &ResultStore,
    existing: &HashMap<String, FileHistory>,
    strategy: Strategy,
    skip_cache: bool,
) -> Result<(PassReport, HashMap<String, FileHistory>), FetchError> {
    let files = store.list_files().await?;
    let pending: Vec<FileRecord> = files.into_iter().filter(|f| !existing.contains_key(&history_key(f))).collect();

    let (report, histories): (PassReport, Vec<(String, FileHistory)>) = match strategy {
        Strategy::PerItem { concurrency } => {
            let results = Arc::new(tokio::sync::Mutex::new(Vec::new()));
            let collected = Arc::clone(&results);
            let report = run_per_item(pending, concurrency, client.clone(), move |client, record| {
                let collected = Arc::clone(&collected);
                async move {
                    let history = fetch_one_history(&client, &record, skip_cache).await?;
                    collected.lock().await.push((history_key(&record), history));
                    Ok(())
                }
            })
            .await?;
            (report, Arc::try_unwrap(results).map(tokio::sync::Mutex::into_inner).unwrap_or_default())
        }
        Strategy::Batched { batch_size } => run_batched_history(pending, batch_size, client, skip_cache).await?,
    };

    let mut merged = existing.clone();
    merged.extend(histories);
    Ok((report, merged))
}

/// Page through `/repos/{owner}/{repo}/commits` via the `Link` header until
/// exhausted, so `commit_count`/`first_commit_unix`/`last_commit_unix` reflect
/// the whole history rather than just GitHub's default first page.
async fn fetch_one_history(client: &ApiClient, record: &FileRecord, skip_cache: bool) -> Result<FileHistory, ClientError> {
    let endpoint = format!("/repos/{}/{}/commits", record.owner, record.repo);
    let schema = if skip_cache { CacheSchema::Bypass } else { CacheSchema::Wrapped { ttl: ghcollect_cache::DEFAULT_WRAPPED_TTL } };

    let mut all_commits = Vec::new();
    let mut page: Option<String> = None;
    loop {
        let mut params = vec![("path".to_string(), record.path.clone()), ("per_page".to_string(), "100".to_string())];
        if let Some(p) = &page {
            params.push(("page".to_string(), p.clone()));
        }
        let resp = client.request(Method::GET, &endpoint, &params, schema.clone(), skip_cache).await?;
        let mut page_commits = resp.body.as_array().cloned().unwrap_or_default();
        let page_len = page_commits.len();
        all_commits.append(&mut page_commits);

        let next = resp.link.as_deref().and_then(next_link);
        match next.filter(|_| page_len > 0).and_then(|url| extract_page_param(&url)) {
            Some(next_page) => page = Some(next_page),
            None => break,
        }
    }

    parse_history_from_rest(&Value::Array(all_commits)).ok_or(ClientError::NotFound)
}

fn extract_page_param(next_url: &str) -> Option<String> {
    let query = next_url.split_once('?')?.1;
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == "page").then(|| v.to_string())
    })
}

fn parse_history_from_rest(commits: &Value) -> Option<FileHistory> {
    let commits = commits.as_array()?;
    if commits.is_empty() {
        return None;
    }
    let mut timestamps = Vec::new();
    let mut authors = BTreeSet::new();
    for commit in commits {
        if let Some(date) = commit.get("commit").and_then(|c| c.get("author")).and_then(|a| a.get("date")).and_then(Value::as_str) {
            if let Some(ts) = parse_rfc3339_unix(date) {
                timestamps.push(ts);
            }
        }
        if let Some(name) = commit.get("commit").and_then(|c| c.get("author")).and_then(|a| a.get("name")).and_then(Value::as_str) {
            authors.insert(name.to_string());
        }
    }
    if timestamps.is_empty() {
        return None;
    }
    Some(FileHistory {
        first_commit_unix: *timestamps.iter().min()?,
        last_commit_unix: *timestamps.iter().max()?,
        authors: authors.into_iter().collect(),
        commit_count: commits.len() as u64,
    })
}

struct HistoryPage {
    total_count: u64,
    has_next_page: bool,
    end_cursor: Option<String>,
    timestamps: Vec<i64>,
    authors: Vec<String>,
}

fn parse_history_page_from_graph(value: &Value) -> Option<HistoryPage> {
    let history = value.get("object")?.get("history")?;
    let total_count = history.get("totalCount").and_then(Value::as_u64).unwrap_or(0);
    let page_info = history.get("pageInfo");
    let has_next_page = page_info.and_then(|p| p.get("hasNextPage")).and_then(Value::as_bool).unwrap_or(false);
    let end_cursor = page_info.and_then(|p| p.get("endCursor")).and_then(Value::as_str).map(str::to_string);
    let nodes = history.get("nodes").and_then(Value::as_array)?;

    let mut timestamps = Vec::new();
    let mut authors = Vec::new();
    for node in nodes {
        if let Some(date) = node.get("committedDate").and_then(Value::as_str) {
            if let Some(ts) = parse_rfc3339_unix(date) {
                timestamps.push(ts);
            }
        }
        if let Some(name) = node.get("author").and_then(|a| a.get("name")).and_then(Value::as_str) {
            authors.push(name.to_string());
        }
    }
    Some(HistoryPage { total_count, has_next_page, end_cursor, timestamps, authors })
}

#[derive(Default)]
struct HistoryAccumulator {
    total_count: u64,
    timestamps: Vec<i64>,
    authors: BTreeSet<String>,
}

impl HistoryAccumulator {
    fn merge(&mut self, page: HistoryPage) {
        self.total_count = page.total_count;
        self.timestamps.extend(page.timestamps);
        self.authors.extend(page.authors);
    }

    fn finish(self) -> Option<FileHistory> {
        Some(FileHistory {
            first_commit_unix: *self.timestamps.iter().min()?,
            last_commit_unix: *self.timestamps.iter().max()?,
            authors: self.authors.into_iter().collect(),
            commit_count: self.total_count,
        })
    }
}

struct HistoryItem {
    record: FileRecord,
    after: Option<String>,
}

/// Batched GraphQL history driver. Unlike [`run_batched`], each item may span
/// several query rounds: an item whose page reports `hasNextPage` is
/// re-queued with its `endCursor` rather than finalized, so `commit_count`
/// reflects the whole history rather than one page of it.
async fn run_batched_history(
    pending: Vec<FileRecord>,
    batch_size: usize,
    client: &ApiClient,
    skip_cache: bool,
) -> Result<(PassReport, Vec<(String, FileHistory)>), FetchError> {
    let mut report = PassReport::default();
    let mut outputs = Vec::new();
    let counter = AtomicUsize::new(0);
    let mut acc: HashMap<String, HistoryAccumulator> = HashMap::new();
    let mut queue: Vec<HistoryItem> = pending.into_iter().map(|record| HistoryItem { record, after: None }).collect();
    let mut size = batch_size.max(MIN_BATCH_SIZE);

    while !queue.is_empty() {
        let take = size.min(queue.len());
        let batch: Vec<HistoryItem> = queue.drain(..take).collect();
        let aliases: Vec<String> = batch.iter().map(|_| format!("item{}", counter.fetch_add(1, Ordering::Relaxed))).collect();
        let fragments: Vec<String> = batch
            .iter()
            .zip(&aliases)
            .map(|(item, alias)| {
                let after_clause = item.after.as_deref().map(|c| format!(", after: \"{}\"", escape_graphql_string(c))).unwrap_or_default();
                format!(
                    "{alias}: repository(owner: \"{}\", name: \"{}\") {{ object(expression: \"{}\") {{ ... on Commit {{ history(first: 100, path: \"{}\"{after_clause}) {{ totalCount pageInfo {{ hasNextPage endCursor }} nodes {{ committedDate author {{ name }} }} }} }} }} }}",
                    escape_graphql_string(&item.record.owner),
                    escape_graphql_string(&item.record.repo),
                    escape_graphql_string(&item.record.git_ref),
                    escape_graphql_string(&item.record.path)
                )
            })
            .collect();
        let query = format!("query {{\n{}\n}}", fragments.join("\n"));

        match client.graphql(&query, None, skip_cache).await {
            Ok(value) => {
                let errors = value.get("errors").and_then(Value::as_array).cloned().unwrap_or_default();
                if errors.iter().any(is_complexity_error) && size > MIN_BATCH_SIZE {
                    tracing::debug!(old_size = size, "batch rejected for complexity, halving");
                    size = (size / 2).max(MIN_BATCH_SIZE);
                    queue.splice(0..0, batch);
                    continue;
                }
                let data = value.get("data").cloned().unwrap_or(Value::Null);
                for (item, alias) in batch.into_iter().zip(&aliases) {
                    let key = history_key(&item.record);
                    let page_value = data.get(alias).filter(|v| !v.is_null()).and_then(parse_history_page_from_graph);
                    match page_value {
                        Some(page) => {
                            let has_next_page = page.has_next_page;
                            let end_cursor = page.end_cursor.clone();
                            acc.entry(key.clone()).or_default().merge(page);
                            if has_next_page && let Some(cursor) = end_cursor {
                                queue.push(HistoryItem { record: item.record, after: Some(cursor) });
                                continue;
                            }
                            match acc.remove(&key).and_then(HistoryAccumulator::finish) {
                                Some(history) => {
                                    outputs.push((key, history));
                                    report.record(ItemOutcome::Done);
                                }
                                None => report.record(ItemOutcome::Skipped),
                            }
                        }
                        None => {
                            acc.remove(&key);
                            report.record(ItemOutcome::Skipped);
                        }
                    }
                }
            }
            Err(err) if is_permanent(&err) => {
                for _ in &batch {
                    report.record(ItemOutcome::Skipped);
                }
            }
            Err(err) => return Err(FetchError::Client(err)),
        }
    }
    Ok((report, outputs))
}

fn parse_rfc3339_unix(date: &str) -> Option<i64> {
    let parsed = humantime::parse_rfc3339(date).ok()?;
    parsed.duration_since(std::time::UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
}

// -------------------------------------------------------------------------
// Per-item strategy driver
// -------------------------------------------------------------------------

async fn run_per_item<T, F, Fut>(items: Vec<T>, concurrency: usize, client: ApiClient, f: F) -> Result<PassReport, FetchError>
where
    T: Send + 'static,
    F: Fn(ApiClient, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ClientError>> + Send,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let f = Arc::new(f);
    let mut tasks = JoinSet::new();
    for item in items {
        let permit = Arc::clone(&semaphore);
        let client = client.clone();
        let f = Arc::clone(&f);
        tasks.spawn(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore closed");
            f(client, item).await
        });
    }

    let mut report = PassReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("enrichment task panicked") {
            Ok(()) => report.record(ItemOutcome::Done),
            Err(err) => {
                if !is_permanent(&err) {
                    tracing::warn!(error = %err, "item exhausted client retry budget, marking skipped");
                }
                report.record(ItemOutcome::Skipped);
            }
        }
    }
    Ok(report)
}

// -------------------------------------------------------------------------
// Batched strategy driver
// -------------------------------------------------------------------------

const MIN_BATCH_SIZE: usize = 1;

async fn run_batched<T, R, BuildFragment, ApplyOne>(
    items: Vec<T>,
    batch_size: usize,
    client: &ApiClient,
    skip_cache: bool,
    build_fragment: BuildFragment,
    apply_one: ApplyOne,
) -> Result<(PassReport, Vec<R>), FetchError>
where
    T: Clone,
    BuildFragment: Fn(&T, &str) -> String,
    ApplyOne: Fn(&T, &Value) -> Result<R, &'static str>,
{
    let mut report = PassReport::default();
    let mut outputs = Vec::new();
    let counter = AtomicUsize::new(0);
    let mut remaining = items;
    let mut size = batch_size.max(MIN_BATCH_SIZE);

    while !remaining.is_empty() {
        let take = size.min(remaining.len());
        let batch: Vec<T> = remaining.drain(..take).collect();
        let aliases: Vec<String> = batch.iter().map(|_| format!("item{}", counter.fetch_add(1, Ordering::Relaxed))).collect();
        let fragments: Vec<String> = batch.iter().zip(&aliases).map(|(item, alias)| build_fragment(item, alias)).collect();
        let query = format!("query {{\n{}\n}}", fragments.join("\n"));

        match client.graphql(&query, None, skip_cache).await {
            Ok(value) => {
                let errors = value.get("errors").and_then(Value::as_array).cloned().unwrap_or_default();
                if errors.iter().any(is_complexity_error) && size > MIN_BATCH_SIZE {
                    tracing::debug!(old_size = size, "batch rejected for complexity, halving");
                    size = (size / 2).max(MIN_BATCH_SIZE);
                    remaining.splice(0..0, batch);
                    continue;
                }
                let data = value.get("data").cloned().unwrap_or(Value::Null);
                for (item, alias) in batch.iter().zip(&aliases) {
                    match data.get(alias) {
                        Some(item_value) if !item_value.is_null() => match apply_one(item, item_value) {
                            Ok(output) => {
                                outputs.push(output);
                                report.record(ItemOutcome::Done);
                            }
                            Err(reason) => {
                                tracing::warn!(reason, "item failed, marking skipped");
                                report.record(ItemOutcome::Skipped);
                            }
                        },
                        _ => report.record(ItemOutcome::Skipped),
                    }
                }
            }
            Err(err) if is_permanent(&err) => {
                for _ in &batch {
                    report.record(ItemOutcome::Skipped);
                }
            }
            Err(err) => return Err(FetchError::Client(err)),
        }
    }
    Ok((report, outputs))
}

fn is_complexity_error(error: &Value) -> bool {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(|m| m.to_lowercase().contains("complexity") || m.to_lowercase().contains("too expensive"))
        .unwrap_or(false)
}
