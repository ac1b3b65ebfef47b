mod bridge;
mod config;
mod gateway;
mod store;

use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(about = "Offline-resilient request gateway for the compliance console")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lifeline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Central server base URL, overriding config file and environment
  #[arg(short, long)]
  server: Option<String>,

  /// Path to the gateway database (default: platform data directory)
  #[arg(long)]
  database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  init_logging();

  // Load configuration and resolve the server address once
  let config = config::Config::load(args.config.as_deref())?;
  let env_server = std::env::var("LIFELINE_SERVER").ok();
  let server = config::ResolvedServerConfig::resolve(
    &config.server,
    env_server.as_deref(),
    args.server.as_deref(),
  )?;

  let store = open_store(&config.gateway, args.database.as_deref());
  let transport = Arc::new(gateway::HttpTransport::new(
    config.gateway.response_body_limit,
  )?);

  let gateway = gateway::Gateway::new(store, transport, server, config.gateway);

  info!(base_url = %gateway.resolved_config().base_url(), "gateway ready");

  // Periodic queue drain; opportunistic drains piggyback on live calls
  let _sync = gateway.start_interval();

  bridge::run(gateway).await
}

/// Open the persistent store, degrading to connectivity-only mode when
/// offline support is disabled or the database cannot be opened. A broken
/// local database must never keep the console from its server.
fn open_store(config: &config::GatewayConfig, path: Option<&Path>) -> Arc<dyn store::Store> {
  if !config.offline_support {
    info!("offline support disabled, running connectivity-only");
    return Arc::new(store::NoopStore);
  }

  let opened = match path {
    Some(p) => store::SqliteStore::open_at(p),
    None => store::SqliteStore::open(),
  };

  match opened {
    Ok(s) => Arc::new(s.with_limits(config.cache_body_limit, config.cache_max_entries)),
    Err(e) => {
      warn!("gateway store unavailable, running connectivity-only: {e:#}");
      Arc::new(store::NoopStore)
    }
  }
}

/// Log to a daily file under the data directory; stdout belongs to the
/// bridge protocol.
fn init_logging() {
  use tracing_subscriber::EnvFilter;

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("lifeline"))
    .unwrap_or_else(|| PathBuf::from("."));

  let appender = tracing_appender::rolling::daily(log_dir, "lifeline.log");

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(appender)
    .with_ansi(false)
    .init();
}
