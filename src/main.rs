//! ab-flash-updater CLI
//!
//! Invoked with no arguments by the hot-plug handler when media is inserted.

use ab_flash_updater::config::DEFAULT_CONFIG_PATH;
use ab_flash_updater::{ExitCode, Orchestrator, SignalHandler, UpdaterConfig};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, subscriber::set_global_default, warn};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "ab-flash-updater")]
#[command(about = "Install a signed firmware bundle onto the inactive A/B slot", version)]
struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', env = "AB_FLASH_UPDATER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate and select the target slot, but write nothing
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .without_time()
        .finish();

    if let Err(e) = set_global_default(subscriber) {
        eprintln!("ab-flash-updater: failed to install log subscriber: {}", e);
    }
}

fn main() {
    let cli = Cli::parse();
    process::exit(run(cli).as_i32());
}

fn run(cli: Cli) -> ExitCode {
    let loaded = match UpdaterConfig::load(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_tracing("info");
            error!(path = %cli.config.display(), "{}", e);
            return ExitCode::Failure;
        }
    };
    init_tracing(&loaded.config.logging.level);

    match &loaded.source {
        Some(source) => info!(path = %source.path.display(), digest = %source.digest, "config loaded"),
        None => warn!(path = %cli.config.display(), "config file not found, using built-in defaults"),
    }

    let signals = SignalHandler::new();
    if let Err(e) = signals.install() {
        warn!(error = %e, "could not install signal handler");
    }

    let orchestrator = match Orchestrator::from_config(loaded.config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(kind = ?e.kind(), "{}", e);
            return e.exit_code();
        }
    };

    orchestrator
        .with_cancel(signals.token())
        .dry_run(cli.dry_run)
        .run()
        .exit_code()
}
