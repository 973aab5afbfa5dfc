mod app;
mod commands;
mod config;
mod event;
mod identity;
mod model;
mod remote;
mod store;
mod sync;
mod transfer;
mod views;

#[cfg(test)]
mod testing;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "focusgrid")]
#[command(about = "Pomodoro sessions, tasks and an Eisenhower matrix, with optional cloud sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/focusgrid/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to a daily file in the data directory; stdout belongs to command output.
fn init_logging(config: &config::Config) -> Result<WorkerGuard> {
  let dir = config.data_dir()?;
  let appender = tracing_appender::rolling::daily(&dir, "focusgrid.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_env("FOCUSGRID_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config)?;

  // Initialize and run the app
  let mut app = app::App::new(config)?;
  app.run(args.command).await?;

  Ok(())
}
