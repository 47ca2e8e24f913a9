//! Command-line front end wiring the five core crates together: a query
//! drives the size-sharded collector into the result store, and three
//! enrichment passes read pending rows back out of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bpaf::Bpaf;
use ghcollect_cli_common::{CliGlobalOptions, RunContext, cli_global_options};
use ghcollect_collector::CollectorConfig;
use ghcollect_fetch::{FileHistory, Strategy};
use reqwest::Method;

#[derive(Debug, Clone, Bpaf)]
pub struct CollectPathsArgs {
    /// Git ref to record alongside discovered paths
    #[bpaf(long("ref"), argument("REF"), fallback("HEAD".to_string()))]
    pub git_ref: String,

    /// Search query to enumerate, e.g. "filename:Cargo.toml"
    #[bpaf(positional("QUERY"))]
    pub query: String,
}

#[derive(Debug, Clone, Bpaf)]
pub struct FetchContentArgs {
    /// Directory content is written under (owner/repo/blob/ref/path)
    #[bpaf(long("content-dir"), argument("DIR"), fallback(PathBuf::from("content")))]
    pub content_dir: PathBuf,
}

#[derive(Debug, Clone, Bpaf)]
pub struct FetchMetadataArgs {
    /// Path the accumulated repo metadata JSON object is written to
    #[bpaf(long("out"), argument("PATH"), fallback(PathBuf::from("repo_metadata.json")))]
    pub out: PathBuf,
}

#[derive(Debug, Clone, Bpaf)]
pub struct FetchHistoryArgs {
    /// Path the accumulated file history JSON object is written to
    #[bpaf(long("out"), argument("PATH"), fallback(PathBuf::from("file_history.json")))]
    pub out: PathBuf,
}

#[allow(clippy::needless_pass_by_value)] // bpaf parse() requires owned String
fn parse_param(s: String) -> Result<(String, String), String> {
    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected K=V, got '{s}'"))
}

#[derive(Debug, Clone, Bpaf)]
pub struct ApiArgs {
    /// Query parameter, repeatable
    #[bpaf(long("param"), argument::<String>("K=V"), parse(parse_param), many)]
    pub params: Vec<(String, String)>,

    /// Endpoint path, e.g. /repos/owner/repo
    #[bpaf(positional("ENDPOINT"))]
    pub endpoint: String,
}

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version, fallback_to_usage, generate(cli))]
/// Collect source files matching a search query, their repo metadata, and per-file commit history
struct Cli {
    #[bpaf(external(commands))]
    command: Commands,
}

#[derive(Debug, Clone, Bpaf)]
enum Commands {
    #[bpaf(command("collect-paths"))]
    /// Discover every file path matching a search query
    CollectPaths(
        #[bpaf(external(cli_global_options), hide_usage)] CliGlobalOptions,
        #[bpaf(external(collect_paths_args))] CollectPathsArgs,
    ),

    #[bpaf(command("fetch-content"))]
    /// Download the raw bytes of every discovered file
    FetchContent(
        #[bpaf(external(cli_global_options), hide_usage)] CliGlobalOptions,
        #[bpaf(external(fetch_content_args))] FetchContentArgs,
    ),

    #[bpaf(command("fetch-metadata"))]
    /// Fetch repository metadata for every discovered repo
    FetchMetadata(
        #[bpaf(external(cli_global_options), hide_usage)] CliGlobalOptions,
        #[bpaf(external(fetch_metadata_args))] FetchMetadataArgs,
    ),

    #[bpaf(command("fetch-history"))]
    /// Fetch per-file commit history for every discovered file
    FetchHistory(
        #[bpaf(external(cli_global_options), hide_usage)] CliGlobalOptions,
        #[bpaf(external(fetch_history_args))] FetchHistoryArgs,
    ),

    #[bpaf(command("api"))]
    /// Issue a single ad hoc REST request and print its JSON body
    Api(
        #[bpaf(external(cli_global_options), hide_usage)] CliGlobalOptions,
        #[bpaf(external(api_args))] ApiArgs,
    ),
}

fn strategy(global: &CliGlobalOptions, default_batch_size: usize) -> Strategy {
    if global.graphql {
        Strategy::Batched { batch_size: global.batch_size.unwrap_or(default_batch_size) }
    } else {
        Strategy::PerItem { concurrency: 8 }
    }
}

async fn load_json_map<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<HashMap<String, T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_map<T: serde::Serialize>(path: &Path, map: &HashMap<String, T>) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(map)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::CollectPaths(global, args) => {
            ghcollect_cli_common::setup_tracing(&global);
            let ctx = RunContext::new(global)?;
            let mut config = CollectorConfig::new(args.query);
            config.git_ref = args.git_ref;
            config.skip_cache = ctx.global.skip_cache;
            ghcollect_collector::collect(&ctx.client, &ctx.store, &config).await?;
            Ok(())
        }
        Commands::FetchContent(global, args) => {
            ghcollect_cli_common::setup_tracing(&global);
            let ctx = RunContext::new(global)?;
            let strat = strategy(&ctx.global, 50);
            let report = ghcollect_fetch::fetch_content(&ctx.client, &ctx.store, &args.content_dir, strat, ctx.global.skip_cache).await?;
            tracing::info!(done = report.done, skipped = report.skipped, "fetch-content complete");
            Ok(())
        }
        Commands::FetchMetadata(global, args) => {
            ghcollect_cli_common::setup_tracing(&global);
            let ctx = RunContext::new(global)?;
            let strat = strategy(&ctx.global, 50);
            let (report, metas) = ghcollect_fetch::fetch_metadata(&ctx.client, &ctx.store, strat, ctx.global.skip_cache).await?;
            let map: HashMap<String, _> = metas.into_iter().map(|m| (format!("{}/{}", m.owner, m.repo), m)).collect();
            write_json_map(&args.out, &map).await?;
            tracing::info!(done = report.done, skipped = report.skipped, "fetch-metadata complete");
            Ok(())
        }
        Commands::FetchHistory(global, args) => {
            ghcollect_cli_common::setup_tracing(&global);
            let ctx = RunContext::new(global)?;
            let strat = strategy(&ctx.global, 20);
            let existing: HashMap<String, FileHistory> = load_json_map(&args.out).await?;
            let (report, merged) = ghcollect_fetch::fetch_history(&ctx.client, &ctx.store, &existing, strat, ctx.global.skip_cache).await?;
            write_json_map(&args.out, &merged).await?;
            tracing::info!(done = report.done, skipped = report.skipped, "fetch-history complete");
            Ok(())
        }
        Commands::Api(global, args) => {
            ghcollect_cli_common::setup_tracing(&global);
            let ctx = RunContext::new(global)?;
            let schema = if ctx.global.skip_cache {
                ghcollect_client::CacheSchema::Bypass
            } else {
                ghcollect_client::CacheSchema::Wrapped { ttl: ghcollect_cache::DEFAULT_WRAPPED_TTL }
            };
            let resp = ctx.client.request(Method::GET, &args.endpoint, &args.params, schema, ctx.global.skip_cache).await?;
            println!("{}", serde_json::to_string_pretty(&resp.body)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = cli().run();
    match run(opts.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}
