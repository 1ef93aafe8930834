//! CLI entry point for the asset cache and download engine, grounded in this
//! workspace's `bin/pageserver.rs`: a config-file-plus-overrides startup
//! sequence, structured logging initialized before anything else runs, and a
//! two-tier signal-driven shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use asset_manager::collaborators::NoAuth;
use asset_manager::config::AssetManagerConf;
use asset_manager::logging::{self, LogFormat};
use asset_manager::AssetManager;

#[derive(Parser)]
#[command(name = "asset-manager-ctl", about = "Asset cache and download engine control CLI")]
struct Cli {
    /// Base directory holding `asset_manager.toml`, `resources/`, `requests/`, `urlWorkingDir/`.
    #[arg(short = 'D', long = "base-dir", default_value = "./asset_manager_data")]
    base_dir: Utf8PathBuf,

    /// Override a config key, e.g. `-c budget_mb=750`. Repeatable.
    #[arg(short = 'c', value_name = "KEY=VALUE")]
    config_override: Vec<String>,

    #[arg(long = "log-format", default_value = "plain")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine and block until shutdown.
    Run,
    /// Print the current Requester registry as JSON, for operational debugging.
    Dump,
    /// Parse and print the effective configuration; exits nonzero on error.
    ValidateConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg_file_path = cli.base_dir.join("asset_manager.toml");

    let mut conf = AssetManagerConf::load(&cfg_file_path, &cli.config_override)
        .context("failed to load asset manager configuration")?;
    conf.base_directory = cli.base_dir.clone();

    match cli.command {
        Command::ValidateConfig => {
            println!("{}", serde_json::to_string_pretty(&conf)?);
            Ok(())
        }
        Command::Run => {
            logging::init(cli.log_format)?;
            run(conf)
        }
        Command::Dump => {
            logging::init(cli.log_format)?;
            dump(conf)
        }
    }
}

fn run(conf: AssetManagerConf) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let manager = runtime.block_on(AssetManager::start(conf, Arc::new(NoAuth)))?;
    tracing::info!("asset manager running; waiting for shutdown signal");

    // Two-tier shutdown, matching this workspace's `bin/pageserver.rs`: the
    // first SIGINT/SIGTERM drains the executor gracefully, SIGQUIT (or a
    // second signal) exits immediately.
    use signal_hook::consts::*;
    let mut signals =
        signal_hook::iterator::Signals::new([SIGINT, SIGTERM, SIGQUIT]).context("failed to install signal handler")?;
    let signal = signals
        .forever()
        .next()
        .expect("forever() never returns None unless explicitly closed");
    match signal {
        SIGQUIT => {
            tracing::info!(signal, "terminating immediately");
            std::process::exit(111);
        }
        _ => {
            tracing::info!(signal, "shutting down gracefully");
            manager.shutdown();
            runtime.shutdown_timeout(Duration::from_secs(5));
            Ok(())
        }
    }
}

fn dump(conf: AssetManagerConf) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let manager = runtime.block_on(AssetManager::start(conf, Arc::new(NoAuth)))?;
    let summaries = manager.registered_summaries();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
