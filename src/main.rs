mod alerts;
mod config;
mod delivery;
mod errors;
mod executor;
mod logging;
mod query;
mod retry;
mod scheduler;
mod state;
mod template;
mod utils;
mod watcher;

use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use config::file::read_config_file;
use config::validation::{error_report, validate_config, ValidationResult};
use config::{check_config, parse_config_file, Config};
use scheduler::Scheduler;
use state::StateStore;
use watcher::{build_generation, ConfigWatcher};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: PathBuf,

    /// State file, overrides `state_file` from the config
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Print config validation result and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_file = read_config_file(&args.config)?;

    if args.validate {
        let results = validate_config(&config_file);
        for result in &results {
            match result {
                ValidationResult::Error(m) => println!("ERROR: {}", m),
                ValidationResult::Warning(m) => println!("WARNING: {}", m),
            }
        }
        return match error_report(&results) {
            Some(report) => Err(anyhow::anyhow!(report)),
            None => {
                println!("Config file is valid");
                Ok(())
            }
        };
    }

    // Setup logging
    logging::setup_logging(&config_file.logging.clone().unwrap_or_default())?;

    info!("Starting querypush with config file: {}", args.config.display());

    check_config(&config_file)?;
    let mut config = parse_config_file(&config_file)?;
    if let Some(state) = args.state {
        config.state_file = state;
    }

    debug!("Parsed config: {:?}", config);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(args.config, config))?;

    info!("Exiting");
    Ok(())
}

async fn run(path: PathBuf, config: Config) -> anyhow::Result<()> {
    let state = Arc::new(StateStore::new(config.state_file.clone()));
    state.load().await;

    let generation = build_generation(&config, state.clone()).await?;
    let mut scheduler = Scheduler::new(generation);

    let (reload_tx, reload_rx) = mpsc::channel(1);
    let watcher = ConfigWatcher::new(path, state)?;
    let watch = tokio::spawn(watcher.run(config.tick, reload_tx));

    let result = scheduler.run(reload_rx).await;
    watch.abort();
    result
}
