use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use triage::{cache, config, engine, github, updater};

/// How often the in-memory cache sweeps out expired entries.
const CACHE_SWEEP_MINUTES: u64 = 15;

fn init_logging() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer())
    .init();
}

#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(about = "Curated triage dashboards over GitHub issues and pull requests")]
#[command(version)]
struct Args {
  /// Path to the collections/rules config file
  #[arg(short, long)]
  config: PathBuf,

  /// Persistence backend: disk, memory, or sqlite (default: $PERSIST_BACKEND or disk)
  #[arg(long)]
  persist_backend: Option<String>,

  /// Backend-specific path (default: $PERSIST_PATH or a per-user default)
  #[arg(long)]
  persist_path: Option<String>,

  /// Override the configured minimum refresh interval (e.g. 30s)
  #[arg(long)]
  min_refresh: Option<String>,

  /// Override the configured maximum refresh interval (e.g. 10m)
  #[arg(long)]
  max_refresh: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  init_logging();

  let args = Args::parse();
  let config = config::Config::load(&args.config)?;

  let min_refresh = match &args.min_refresh {
    Some(s) => engine::filters::parse_duration(s)?,
    None => config.min_refresh,
  };
  let max_refresh = match &args.max_refresh {
    Some(s) => engine::filters::parse_duration(s)?,
    None => config.max_refresh,
  };

  let backend = cache::from_env(args.persist_backend.as_deref(), args.persist_path.as_deref())?;
  let content_cache = Arc::new(cache::Cache::new(backend));
  // A broken backend at startup is fatal; a cold one is fine.
  content_cache.initialize()?;

  let token = config::github_token()?;
  let client = github::GithubClient::new(&token)?;
  let engine = Arc::new(engine::Engine::new(
    client,
    Arc::clone(&content_cache),
    config.engine,
  ));

  info!(
    "{}: {} collections, refresh window {} to {}, backend {}",
    config.name,
    config.collections.len(),
    min_refresh,
    max_refresh,
    content_cache.backend_name()
  );

  let updater = updater::Updater::new(
    engine,
    Arc::clone(&content_cache),
    config.collections,
    min_refresh,
    max_refresh,
  );

  let sweep_cache = Arc::clone(&content_cache);
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(CACHE_SWEEP_MINUTES * 60));
    ticker.tick().await; // the first tick fires immediately
    loop {
      ticker.tick().await;
      sweep_cache.evict_expired();
    }
  });

  let loop_handle = tokio::spawn(Arc::clone(&updater).run_loop());

  tokio::signal::ctrl_c().await?;
  info!("shutting down: {}", updater.status());
  loop_handle.abort();

  // Final flush so the next start has a warm cache.
  if let Err(e) = content_cache.cleanup() {
    error!("final persist failed: {}", e);
  }

  Ok(())
}
