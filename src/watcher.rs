use anyhow::{Context, Result};
use log::{debug, error, info};
use signal_hook::consts::SIGHUP;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::{load_config, Config};
use crate::executor::Engine;
use crate::query::LibsqlQueryAccess;
use crate::scheduler::Generation;
use crate::state::StateStore;

/// Opens the data sources of `config` and wires a fresh engine around them
pub async fn build_generation(config: &Config, state: Arc<StateStore>) -> Result<Generation> {
    let access = LibsqlQueryAccess::open(&config.databases).await?;
    let engine = Engine::new(Arc::new(access), config.alerts.clone(), state);
    Ok(Generation::new(config, Arc::new(engine)))
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reloads the configuration when its file changes or on SIGHUP
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
    hangup: Arc<AtomicBool>,
    state: Arc<StateStore>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, state: Arc<StateStore>) -> Result<Self> {
        let hangup = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGHUP, hangup.clone()).context("Unable to register SIGHUP handler")?;

        Ok(Self {
            modified: modified_time(&path),
            path,
            hangup,
            state,
        })
    }

    /// True once per file modification or SIGHUP
    fn changed(&mut self) -> bool {
        let hangup = self.hangup.swap(false, Ordering::SeqCst);
        let modified = modified_time(&self.path);

        if hangup {
            info!("Received SIGHUP, reloading configuration");
        } else if modified != self.modified {
            info!("Configuration file '{}' changed, reloading", self.path.display());
        }

        let changed = hangup || modified != self.modified;
        self.modified = modified;
        changed
    }

    async fn reload(&self) -> Result<Generation> {
        let config = load_config(&self.path)?;
        build_generation(&config, self.state.clone()).await
    }

    /// Polls every `period`, then at the `tick` of the latest loaded
    /// generation, and sends each one to the scheduler. A broken
    /// configuration is logged and the current one stays active.
    pub async fn run(mut self, mut period: Duration, generations: mpsc::Sender<Generation>) {
        loop {
            sleep(period).await;
            if !self.changed() {
                continue;
            }

            match self.reload().await {
                Ok(generation) => {
                    debug!("Applying new configuration with {} queries", generation.jobs.len());
                    period = generation.tick;
                    if generations.send(generation).await.is_err() {
                        return;
                    }
                }
                Err(e) => error!("Configuration reload failed, keeping the previous one: {:#}", e),
            }
        }
    }
}
