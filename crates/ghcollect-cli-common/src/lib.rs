//! Shared CLI plumbing: global flags, logging setup, and the bundled
//! [`RunContext`] command handlers take instead of threading a client, a
//! cache, a store, and configuration through separately.

use std::path::PathBuf;
use std::sync::Arc;

use bpaf::Bpaf;
use ghcollect_cache::ResponseCache;
use ghcollect_client::{ApiClient, ApiClientConfig};
use ghcollect_store::{ResultStore, StoreError};
use tracing_subscriber::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{GHCOLLECT_TOKEN_VAR} is not set; export it with a personal access token for the host")]
    MissingToken,
    #[error("failed to open the response cache: {0}")]
    Cache(#[from] ghcollect_cache::CacheError),
    #[error("failed to open the result store at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
}

/// Environment variable carrying the host API token.
pub const GHCOLLECT_TOKEN_VAR: &str = "GHCOLLECT_TOKEN";
/// Environment variable used as a fallback log filter when `--log-level` is unset.
pub const GHCOLLECT_LOG_VAR: &str = "GHCOLLECT_LOG";

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Bpaf)]
#[bpaf(generate(cli_global_options))]
pub struct CliGlobalOptions {
    /// Path to the result store (created if absent)
    #[bpaf(long("db"), argument("PATH"), fallback(PathBuf::from("files.db")))]
    pub db: PathBuf,

    /// Bypass cache reads for this run; the response still populates the cache for later callers
    #[bpaf(long("skip-cache"), switch)]
    pub skip_cache: bool,

    /// Prefer the batched GraphQL strategy over per-item REST where a pass supports both
    #[bpaf(long("graphql"), switch)]
    pub graphql: bool,

    /// Batch size for the GraphQL strategy (halved automatically on a complexity rejection).
    /// Defaults to 50 for content/metadata passes and 20 for the history pass.
    #[bpaf(long("batch-size"), argument("N"), optional)]
    pub batch_size: Option<usize>,

    /// Logging verbosity: none, debug, info, warn, error
    #[bpaf(long("log-level"), argument("LEVEL"), fallback(LogLevel::None), display_fallback)]
    pub log_level: LogLevel,

    /// Shorthand for --log-level info
    #[bpaf(short('v'), long("verbose"), switch, fallback(false))]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    None,
    Debug,
    Info,
    Warn,
    Error,
}

impl core::str::FromStr for LogLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("expected none, debug, info, warn, or error, got '{s}'")),
        }
    }
}

impl core::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Install a `tracing-tree` subscriber from `--log-level`/`--verbose`,
/// falling back to `GHCOLLECT_LOG` when neither flag was given.
pub fn setup_tracing(global: &CliGlobalOptions) {
    let level = if global.verbose && global.log_level == LogLevel::None { LogLevel::Info } else { global.log_level };

    let filter = match level {
        LogLevel::None => match tracing_subscriber::EnvFilter::try_from_env(GHCOLLECT_LOG_VAR) {
            Ok(f) => f,
            Err(_) => return,
        },
        LogLevel::Debug => tracing_subscriber::EnvFilter::new("debug"),
        LogLevel::Info => tracing_subscriber::EnvFilter::new("info"),
        LogLevel::Warn => tracing_subscriber::EnvFilter::new("warn"),
        LogLevel::Error => tracing_subscriber::EnvFilter::new("error"),
    };

    tracing_subscriber::registry()
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true)
                .with_indent_lines(true)
                .with_timer(tracing_tree::time::Uptime::default())
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// The client, cache, store, and global flags a command handler needs.
/// Replaces the module-level singletons of the source with an explicit
/// value passed to each handler.
#[derive(Clone)]
pub struct RunContext {
    pub client: ApiClient,
    pub store: ResultStore,
    pub global: CliGlobalOptions,
}

impl RunContext {
    /// Build a run context from global flags: reads the API token from
    /// [`GHCOLLECT_TOKEN_VAR`], opens the default response cache, and opens
    /// (creating if absent) the result store at `global.db`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] if the token variable is unset,
    /// or propagates a cache/store open failure.
    pub fn new(global: CliGlobalOptions) -> Result<Self, ConfigError> {
        let token = std::env::var(GHCOLLECT_TOKEN_VAR).map_err(|_| ConfigError::MissingToken)?;
        let cache = Arc::new(ResponseCache::open_default()?);
        let store = ResultStore::open(&global.db).map_err(|source| ConfigError::Store { path: global.db.clone(), source })?;
        let client = ApiClient::new(ApiClientConfig::new(token, cache));
        Ok(Self { client, store, global })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpaf::Parser;

    fn opts() -> bpaf::OptionParser<CliGlobalOptions> {
        cli_global_options().to_options()
    }

    #[test]
    fn defaults() {
        let parsed = opts().run_inner(&[]).expect("parses with no args");
        assert_eq!(parsed.db, PathBuf::from("files.db"));
        assert!(!parsed.skip_cache);
        assert!(!parsed.graphql);
        assert_eq!(parsed.batch_size, None);
        assert_eq!(parsed.log_level, LogLevel::None);
    }

    #[test]
    fn db_path_override() {
        let parsed = opts().run_inner(&["--db", "/tmp/other.db"]).expect("parses");
        assert_eq!(parsed.db, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn skip_cache_and_graphql_flags() {
        let parsed = opts().run_inner(&["--skip-cache", "--graphql"]).expect("parses");
        assert!(parsed.skip_cache);
        assert!(parsed.graphql);
    }

    #[test]
    fn batch_size_override() {
        let parsed = opts().run_inner(&["--batch-size", "20"]).expect("parses");
        assert_eq!(parsed.batch_size, Some(20));
    }

    #[test]
    fn log_level_invalid_rejected() {
        assert!(opts().run_inner(&["--log-level", "trace"]).is_err());
    }

    #[test]
    fn verbose_without_log_level_maps_to_info() {
        let global = CliGlobalOptions {
            db: PathBuf::from("files.db"),
            skip_cache: false,
            graphql: false,
            batch_size: None,
            log_level: LogLevel::None,
            verbose: true,
        };
        assert!(global.verbose);
        assert_eq!(global.log_level, LogLevel::None);
    }
}
