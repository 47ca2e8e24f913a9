//! Size-sharded adaptive scan over a search endpoint whose result count is
//! capped at 1,000 rows regardless of pagination.
//!
//! The upstream index also silently drops matches from a query whose size
//! range is too wide, even below the 1,000 cap, so correctness requires
//! genuinely narrow ranges rather than ranges merely narrow enough to avoid
//! truncation. [`adapt`] is the pure decision function; [`collect`] drives
//! it against a live client and store.

use ghcollect_client::{ApiClient, CacheSchema, ClientError};
use ghcollect_store::{ChunkState, FileRecord, ResultStore, ScanCursor, StoreError};
use reqwest::Method;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("irreducible saturation at size {size}: more than the saturation threshold of results share this exact byte size")]
    IrreducibleSaturation { size: i64 },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub query: String,
    pub git_ref: String,
    pub max_size: i64,
    pub initial_width: i64,
    pub min_width: i64,
    pub max_width: i64,
    pub saturation_threshold: i64,
    pub comfort_high: i64,
    pub comfort_low: i64,
    pub per_page: i64,
    pub max_pages: i64,
    pub skip_cache: bool,
}

impl CollectorConfig {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            git_ref: "HEAD".to_string(),
            max_size: 1024 * 1024,
            initial_width: 100,
            min_width: 1,
            max_width: 100_000,
            saturation_threshold: 1000,
            comfort_high: 500,
            comfort_low: 50,
            per_page: 100,
            max_pages: 10,
            skip_cache: false,
        }
    }
}

/// What the collector should do after seeing a chunk's reported count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk was oversubscribed; `w` was halved and the same `lo` must
    /// be retried without being marked processed.
    Saturated,
    /// The chunk is exhausted; advance `lo` by the (unchanged) width.
    Advance,
    /// The chunk is exhausted and sparse; advance `lo` and widen.
    AdvanceAndWiden,
    /// `w` is already at its floor and the chunk is still saturated — the
    /// design cannot narrow further.
    Irreducible,
}

/// The mutable position of an in-progress scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanState {
    pub lo: i64,
    pub w: i64,
}

/// Pure adaptation step: given the reported count for the chunk currently
/// at `state`, decide the outcome and mutate `state` accordingly. Does not
/// touch `lo` on a [`ChunkOutcome::Saturated`] or
/// [`ChunkOutcome::Irreducible`] result — the caller must not mark that
/// chunk processed.
#[must_use]
pub fn adapt(state: &mut ScanState, reported_count: i64, config: &CollectorConfig) -> ChunkOutcome {
    if reported_count >= config.saturation_threshold {
        if state.w <= config.min_width {
            return ChunkOutcome::Irreducible;
        }
        state.w = (state.w / 2).max(config.min_width);
        return ChunkOutcome::Saturated;
    }

    let chunk_width = state.w;
    let outcome = if reported_count <= config.comfort_low {
        state.w = (state.w * 2).min(config.max_width);
        ChunkOutcome::AdvanceAndWiden
    } else {
        ChunkOutcome::Advance
    };
    state.lo = (state.lo + chunk_width).min(config.max_size);
    outcome
}

/// Drive the scan to completion, persisting discovered files and cursor
/// progress as it goes.
///
/// # Errors
///
/// Returns [`CollectError::IrreducibleSaturation`] if a single byte size
/// has more matches than the saturation threshold, or propagates a client
/// or store failure.
#[tracing::instrument(skip(client, store, config), fields(query = %config.query))]
pub async fn collect(client: &ApiClient, store: &ResultStore, config: &CollectorConfig) -> Result<(), CollectError> {
    let mut state = match store.load_scan_cursor(&config.query).await? {
        Some(ScanCursor { lo, w }) => ScanState { lo, w },
        None => ScanState { lo: 0, w: config.initial_width },
    };

    while state.lo < config.max_size {
        let chunk_lo = state.lo;
        let chunk_hi = (state.lo + state.w).min(config.max_size);
        let reported_count = fetch_chunk(client, store, config, chunk_lo, chunk_hi).await?;

        let outcome = adapt(&mut state, reported_count, config);
        match outcome {
            ChunkOutcome::Irreducible => {
                return Err(CollectError::IrreducibleSaturation { size: chunk_lo });
            }
            ChunkOutcome::Saturated => {
                tracing::debug!(chunk_lo, chunk_hi, reported_count, new_width = state.w, "chunk saturated, splitting");
            }
            ChunkOutcome::Advance | ChunkOutcome::AdvanceAndWiden => {
                store.record_progress(chunk_lo, chunk_hi, ChunkState::Done, reported_count).await?;
                store.save_scan_cursor(&config.query, ScanCursor { lo: state.lo, w: state.w }).await?;
            }
        }
    }
    Ok(())
}

/// Fetch and persist every row for the chunk `[chunk_lo, chunk_hi)`,
/// returning the host-reported total count.
async fn fetch_chunk(
    client: &ApiClient,
    store: &ResultStore,
    config: &CollectorConfig,
    chunk_lo: i64,
    chunk_hi: i64,
) -> Result<i64, CollectError> {
    let size_range = format!("{chunk_lo}..{}", (chunk_hi - 1).max(chunk_lo));
    let q = format!("{} size:{size_range}", config.query);

    let mut reported_count = 0i64;
    let mut page = 1i64;
    loop {
        let params = vec![
            ("q".to_string(), q.clone()),
            ("per_page".to_string(), config.per_page.to_string()),
            ("page".to_string(), page.to_string()),
        ];
        let schema = if config.skip_cache {
            CacheSchema::Bypass
        } else {
            CacheSchema::Wrapped { ttl: std::time::Duration::from_secs(0) }
        };
        let resp = client.request(Method::GET, "/search/code", &params, schema, config.skip_cache).await?;

        reported_count = resp.body.get("total_count").and_then(Value::as_i64).unwrap_or(reported_count);
        let items = resp.body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
        let page_len = items.len();

        for item in &items {
            if let Some(record) = parse_item(item, &config.git_ref) {
                store.insert_file(record).await?;
            }
        }

        if page_len == 0 || (page_len as i64) < config.per_page || page >= config.max_pages {
            break;
        }
        page += 1;
    }
    Ok(reported_count)
}

fn parse_item(item: &Value, git_ref: &str) -> Option<FileRecord> {
    let path = item.get("path")?.as_str()?.to_string();
    let sha = item.get("sha").and_then(Value::as_str).unwrap_or_default().to_string();
    let size = item.get("size").and_then(Value::as_i64).unwrap_or(0);
    let url = item.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
    let full_name = item.get("repository").and_then(|r| r.get("full_name")).and_then(Value::as_str)?;
    let (owner, repo) = full_name.split_once('/')?;

    Some(FileRecord {
        owner: owner.to_string(),
        repo: repo.to_string(),
        git_ref: git_ref.to_string(),
        path,
        sha,
        size,
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> CollectorConfig {
        let mut c = CollectorConfig::new("filename:test");
        c.max_size = 1000;
        c.initial_width = 100;
        c.min_width = 1;
        c.max_width = 1000;
        c
    }

    /// Driving the pure state machine with an oracle that always reports a
    /// moderate count must cover [0, max_size) with no gaps or overlaps.
    #[test]
    fn covers_range_with_no_gaps_or_overlaps() {
        let config = config();
        let mut state = ScanState { lo: 0, w: config.initial_width };
        let mut chunks = Vec::new();
        loop {
            let chunk_lo = state.lo;
            let chunk_hi = (state.lo + state.w).min(config.max_size);
            let outcome = adapt(&mut state, 200, &config);
            assert_ne!(outcome, ChunkOutcome::Saturated);
            assert_ne!(outcome, ChunkOutcome::Irreducible);
            chunks.push((chunk_lo, chunk_hi));
            if state.lo >= config.max_size {
                break;
            }
        }
        assert_eq!(chunks.first().expect("at least one chunk").0, 0);
        assert_eq!(chunks.last().expect("at least one chunk").1, config.max_size);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "gap or overlap between {:?} and {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn saturation_halves_width_without_advancing() {
        let config = config();
        let mut state = ScanState { lo: 0, w: 100 };
        let outcome = adapt(&mut state, 1000, &config);
        assert_eq!(outcome, ChunkOutcome::Saturated);
        assert_eq!(state.lo, 0);
        assert_eq!(state.w, 50);
    }

    #[test]
    fn saturation_at_floor_width_is_irreducible() {
        let config = config();
        let mut state = ScanState { lo: 5, w: 1 };
        let outcome = adapt(&mut state, 1000, &config);
        assert_eq!(outcome, ChunkOutcome::Irreducible);
        assert_eq!(state.lo, 5);
        assert_eq!(state.w, 1);
    }

    #[test]
    fn sparse_chunk_advances_and_widens() {
        let config = config();
        let mut state = ScanState { lo: 0, w: 100 };
        let outcome = adapt(&mut state, 10, &config);
        assert_eq!(outcome, ChunkOutcome::AdvanceAndWiden);
        assert_eq!(state.lo, 100);
        assert_eq!(state.w, 200);
    }

    #[test]
    fn dense_chunk_advances_without_widening() {
        let config = config();
        let mut state = ScanState { lo: 0, w: 100 };
        let outcome = adapt(&mut state, 900, &config);
        assert_eq!(outcome, ChunkOutcome::Advance);
        assert_eq!(state.lo, 100);
        assert_eq!(state.w, 100);
    }

    proptest! {
        /// For any sequence of chunk counts, the scan either terminates
        /// having covered [0, max_size) with no gaps/overlaps, or reports
        /// irreducible saturation — it never silently stops short or
        /// double-counts a range.
        #[test]
        fn never_gaps_overlaps_or_silently_stops(counts in prop::collection::vec(0i64..2000, 1..200)) {
            let config = config();
            let mut state = ScanState { lo: 0, w: config.initial_width };
            let mut chunks: Vec<(i64, i64)> = Vec::new();
            let mut idx = 0usize;
            let mut steps = 0;
            loop {
                steps += 1;
                if steps > 10_000 {
                    break;
                }
                let count = counts[idx % counts.len()];
                idx += 1;
                let chunk_lo = state.lo;
                let chunk_hi = (state.lo + state.w).min(config.max_size);
                let outcome = adapt(&mut state, count, &config);
                match outcome {
                    ChunkOutcome::Irreducible => return Ok(()),
                    ChunkOutcome::Saturated => {
                        prop_assert_eq!(state.lo, chunk_lo);
                    }
                    ChunkOutcome::Advance | ChunkOutcome::AdvanceAndWiden => {
                        chunks.push((chunk_lo, chunk_hi));
                    }
                }
                if state.lo >= config.max_size {
                    break;
                }
            }
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].1, pair[1].0);
            }
            if let Some(first) = chunks.first() {
                prop_assert_eq!(first.0, 0);
            }
            if let Some(last) = chunks.last() {
                prop_assert_eq!(last.1, config.max_size);
            }
        }
    }
}
