use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::alerts::AlertChannel;

/// Persisted run history, the file layout of `QueryState.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunState {
    #[serde(default)]
    pub last_run_times: HashMap<String, DateTime<Utc>>,
    /// Keyed by "job:Channel"
    #[serde(default)]
    pub last_alert_times: HashMap<String, DateTime<Utc>>,
}

fn alert_key(job: &str, channel: AlertChannel) -> String {
    format!("{}:{}", job, channel)
}

/// Run and alert timestamps, written through to a JSON file.
///
/// Every access goes through one lock. Saving writes a sibling temp file and
/// renames it over the previous state, so a crash leaves either the old or the
/// new file. On platforms where rename over an existing file is not atomic the
/// guarantee narrows to "the temp file holds the latest state".
pub struct StateStore {
    path: PathBuf,
    state: Mutex<RunState>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(RunState::default()),
        }
    }

    pub async fn last_run(&self, job: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_run_times.get(job).copied()
    }

    pub async fn set_last_run(&self, job: &str, timestamp: DateTime<Utc>) {
        self.state
            .lock()
            .await
            .last_run_times
            .insert(job.to_string(), timestamp);
        debug!("Set last run for '{}' to {}", job, timestamp);
    }

    pub async fn last_runs(&self) -> HashMap<String, DateTime<Utc>> {
        self.state.lock().await.last_run_times.clone()
    }

    pub async fn last_alert(&self, job: &str, channel: AlertChannel) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .last_alert_times
            .get(&alert_key(job, channel))
            .copied()
    }

    pub async fn set_last_alert(&self, job: &str, channel: AlertChannel, timestamp: DateTime<Utc>) {
        self.state
            .lock()
            .await
            .last_alert_times
            .insert(alert_key(job, channel), timestamp);
        debug!("Set last {} alert for '{}' to {}", channel, job, timestamp);
    }

    pub async fn snapshot(&self) -> RunState {
        self.state.lock().await.clone()
    }

    /// Replaces the in-memory state with the file content.
    /// A missing or unreadable file yields an empty state.
    pub async fn load(&self) {
        let mut state = self.state.lock().await;

        *state = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => match serde_json::from_str::<RunState>(&json) {
                Ok(loaded) => {
                    info!(
                        "Loaded state with {} query states and {} alert states",
                        loaded.last_run_times.len(),
                        loaded.last_alert_times.len()
                    );
                    loaded
                }
                Err(e) => {
                    error!("Failed to parse state file '{}': {}", self.path.display(), e);
                    RunState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No existing state file found, starting with empty state");
                RunState::default()
            }
            Err(e) => {
                error!("Failed to read state file '{}': {}", self.path.display(), e);
                RunState::default()
            }
        };
    }

    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;

        let result = self.write_atomically(&state).await;
        match &result {
            Ok(()) => debug!("Saved state to '{}'", self.path.display()),
            Err(e) => error!("Failed to save state to '{}': {:#}", self.path.display(), e),
        }
        result
    }

    async fn write_atomically(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }

        tokio::fs::write(&temp, json)
            .await
            .with_context(|| format!("Failed to write '{}'", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("Failed to replace '{}'", self.path.display()))?;

        Ok(())
    }
}
