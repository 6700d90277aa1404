use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gcode_serial_proxy::config::Config;
use gcode_serial_proxy::handlers::{ChainHandlers, Handlers, LoggingHandlers, NoopHandlers};
use gcode_serial_proxy::service::ProxyService;

#[derive(Debug, Parser)]
#[command(name = "gcode-serial-proxy")]
struct Options {
  /// path to the TOML configuration file
  #[arg(long, short)]
  config: PathBuf,

  /// replace the serial transport with its synthetic dry-run variant
  #[arg(long)]
  dry_run: bool,

  /// raise the default log level to debug (overridden by RUST_LOG if set)
  #[arg(long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let opts = Options::parse();

  let default_filter = if opts.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
    .init();

  let config = Config::load(&opts.config)
    .with_context(|| format!("failed to load configuration from {}", opts.config.display()))?;

  let handlers: Arc<dyn Handlers> = Arc::new(ChainHandlers::new(vec![
    Box::new(LoggingHandlers) as Box<dyn Handlers>,
    Box::new(NoopHandlers),
  ]));

  let service = ProxyService::start(config, opts.dry_run, handlers)
    .await
    .context("failed to start proxy service")?;

  wait_for_shutdown_signal().await?;

  tracing::info!("shutdown signal received, stopping");
  service.stop().await;

  Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
  use tokio::signal::unix::{signal, SignalKind};

  let mut terminate = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

  tokio::select! {
    result = tokio::signal::ctrl_c() => result.context("failed to wait for ctrl-c"),
    _ = terminate.recv() => Ok(()),
  }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
  tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")
}
