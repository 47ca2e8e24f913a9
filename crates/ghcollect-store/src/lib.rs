//! Durable, queryable record of collection progress and discovered files.
//!
//! Backed by SQLite opened with WAL journaling. Every write that matters
//! for resumability commits before the call returns, so the store is safe
//! to terminate against at any point: whatever is visible on the next open
//! is authoritative.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("background task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A discovered file, unique on (owner, repo, git_ref, path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    pub path: String,
    pub sha: String,
    pub size: i64,
    pub url: String,
}

/// Enrichment fields for a repository, populated by the metadata pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub owner: String,
    pub repo: String,
    pub description: Option<String>,
    pub stars: Option<i64>,
    pub forks: Option<i64>,
    pub topics: Vec<String>,
    pub license: Option<String>,
    pub primary_language: Option<String>,
}

/// Whether a size-interval chunk was exhausted cleanly or required a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Done,
    Saturated,
}

impl ChunkState {
    fn as_str(self) -> &'static str {
        match self {
            ChunkState::Done => "done",
            ChunkState::Saturated => "saturated",
        }
    }
}

/// The collector's resumable cursor position for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub lo: i64,
    pub w: i64,
}

/// Handle to the result store. Cheap to clone; the underlying connection is
/// shared and every operation runs on a blocking pool thread since the
/// driver is synchronous.
#[derive(Clone)]
pub struct ResultStore {
    conn: Arc<Mutex<Connection>>,
}

impl ResultStore {
    /// Open (creating the schema if absent) a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                owner TEXT NOT NULL,
                repo TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                path TEXT NOT NULL,
                sha TEXT NOT NULL,
                size INTEGER NOT NULL,
                url TEXT NOT NULL,
                PRIMARY KEY (owner, repo, git_ref, path)
            );
            CREATE TABLE IF NOT EXISTS repos (
                owner TEXT NOT NULL,
                repo TEXT NOT NULL,
                description TEXT,
                stars INTEGER,
                forks INTEGER,
                topics TEXT,
                license TEXT,
                primary_language TEXT,
                PRIMARY KEY (owner, repo)
            );
            CREATE TABLE IF NOT EXISTS progress (
                chunk_lo INTEGER NOT NULL,
                chunk_hi INTEGER NOT NULL,
                state TEXT NOT NULL,
                result_count INTEGER NOT NULL,
                PRIMARY KEY (chunk_lo, chunk_hi)
            );
            CREATE TABLE IF NOT EXISTS scan_cursor (
                query TEXT PRIMARY KEY,
                lo INTEGER NOT NULL,
                w INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Insert a file record, silently absorbing a duplicate (same owner,
    /// repo, ref, path).
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or if the blocking task
    /// running the insert panics.
    pub async fn insert_file(&self, record: FileRecord) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO files (owner, repo, git_ref, path, sha, size, url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![record.owner, record.repo, record.git_ref, record.path, record.sha, record.size, record.url],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }

    /// All recorded files, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn list_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let mut stmt = conn.prepare("SELECT owner, repo, git_ref, path, sha, size, url FROM files")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(FileRecord {
                        owner: row.get(0)?,
                        repo: row.get(1)?,
                        git_ref: row.get(2)?,
                        path: row.get(3)?,
                        sha: row.get(4)?,
                        size: row.get(5)?,
                        url: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;
        Ok(rows)
    }

    /// Distinct (owner, repo) pairs seen in `files` that have no row yet in
    /// `repos` — the work list for the metadata pass.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn repos_missing_metadata(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT DISTINCT f.owner, f.repo FROM files f
                 LEFT JOIN repos r ON r.owner = f.owner AND r.repo = f.repo
                 WHERE r.owner IS NULL",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;
        Ok(rows)
    }

    /// Record enrichment fields for a repository.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn upsert_repo_metadata(&self, meta: RepoMetadata) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let topics = serde_json::to_string(&meta.topics).unwrap_or_else(|_| "[]".to_string());
            conn.execute(
                "INSERT INTO repos (owner, repo, description, stars, forks, topics, license, primary_language)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(owner, repo) DO UPDATE SET
                    description = excluded.description,
                    stars = excluded.stars,
                    forks = excluded.forks,
                    topics = excluded.topics,
                    license = excluded.license,
                    primary_language = excluded.primary_language",
                params![meta.owner, meta.repo, meta.description, meta.stars, meta.forks, topics, meta.license, meta.primary_language],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }

    /// All repos with recorded metadata, for rendering the final JSON dump.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn export_repo_metadata(&self) -> Result<Vec<RepoMetadata>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT owner, repo, description, stars, forks, topics, license, primary_language FROM repos",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let topics_json: String = row.get(5)?;
                    let topics = serde_json::from_str(&topics_json).unwrap_or_default();
                    Ok(RepoMetadata {
                        owner: row.get(0)?,
                        repo: row.get(1)?,
                        description: row.get(2)?,
                        stars: row.get(3)?,
                        forks: row.get(4)?,
                        topics,
                        license: row.get(6)?,
                        primary_language: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await??;
        Ok(rows)
    }

    /// Record that a size-interval chunk has been exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn record_progress(&self, chunk_lo: i64, chunk_hi: i64, state: ChunkState, result_count: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let state = state.as_str();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.execute(
                "INSERT OR REPLACE INTO progress (chunk_lo, chunk_hi, state, result_count) VALUES (?1, ?2, ?3, ?4)",
                params![chunk_lo, chunk_hi, state, result_count],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Load the resumable cursor for `query`, if a prior run persisted one.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn load_scan_cursor(&self, query: &str) -> Result<Option<ScanCursor>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let query = query.to_string();
        let cursor = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.query_row(
                "SELECT lo, w FROM scan_cursor WHERE query = ?1",
                params![query],
                |row| Ok(ScanCursor { lo: row.get(0)?, w: row.get(1)? }),
            )
            .optional()
        })
        .await??;
        Ok(cursor)
    }

    /// Persist the cursor for `query`, overwriting any prior value.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or task panic.
    pub async fn save_scan_cursor(&self, query: &str, cursor: ScanCursor) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let query = query.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.execute(
                "INSERT INTO scan_cursor (query, lo, w) VALUES (?1, ?2, ?3)
                 ON CONFLICT(query) DO UPDATE SET lo = excluded.lo, w = excluded.w",
                params![query, cursor.lo, cursor.w],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(path: &str) -> FileRecord {
        FileRecord {
            owner: "foo".to_string(),
            repo: "bar".to_string(),
            git_ref: "main".to_string(),
            path: path.to_string(),
            sha: "deadbeef".to_string(),
            size: 123,
            url: format!("https://example.test/{path}"),
        }
    }

    #[tokio::test]
    async fn duplicate_file_insert_is_absorbed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("files.db")).expect("open");
        store.insert_file(sample_file("a.txt")).await.expect("insert");
        store.insert_file(sample_file("a.txt")).await.expect("insert dup");
        let files = store.list_files().await.expect("list");
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn repos_missing_metadata_tracks_files_without_enrichment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("files.db")).expect("open");
        store.insert_file(sample_file("a.txt")).await.expect("insert");

        let missing = store.repos_missing_metadata().await.expect("query");
        assert_eq!(missing, vec![("foo".to_string(), "bar".to_string())]);

        let meta = RepoMetadata {
            owner: "foo".to_string(),
            repo: "bar".to_string(),
            stars: Some(10),
            ..Default::default()
        };
        store.upsert_repo_metadata(meta).await.expect("upsert");
        let missing_after = store.repos_missing_metadata().await.expect("query");
        assert!(missing_after.is_empty());

        let exported = store.export_repo_metadata().await.expect("export");
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].stars, Some(10));
    }

    #[tokio::test]
    async fn scan_cursor_round_trips_per_query() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("files.db")).expect("open");
        assert_eq!(store.load_scan_cursor("filename:foo").await.expect("load"), None);

        store.save_scan_cursor("filename:foo", ScanCursor { lo: 100, w: 200 }).await.expect("save");
        assert_eq!(
            store.load_scan_cursor("filename:foo").await.expect("load"),
            Some(ScanCursor { lo: 100, w: 200 })
        );

        store.save_scan_cursor("filename:foo", ScanCursor { lo: 300, w: 400 }).await.expect("save again");
        assert_eq!(
            store.load_scan_cursor("filename:foo").await.expect("load"),
            Some(ScanCursor { lo: 300, w: 400 })
        );
    }

    #[tokio::test]
    async fn progress_records_do_not_error_on_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("files.db")).expect("open");
        store.record_progress(0, 100, ChunkState::Done, 42).await.expect("record");
        store.record_progress(0, 100, ChunkState::Saturated, 1000).await.expect("replace");
    }
}
