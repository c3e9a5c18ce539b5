use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    #[default]
    Stdout,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "syslog")]
    Syslog,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
pub enum LogRotation {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "daily")]
    #[default]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "monthly")]
    Monthly,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub output: LogOutput,
    /// Directory holding the rotated `querypush-*.log` files
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub rotation: LogRotation,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_retention_days() -> u32 {
    30
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stdout,
            directory: default_directory(),
            rotation: LogRotation::Daily,
            retention_days: default_retention_days(),
            level: default_level(),
        }
    }
}
