use anyhow::Context;
use reqwest::Method;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use std::path::{Path, PathBuf};

use super::logging::LoggingConfig;

/// Configuration file as written by the operator, before validation
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub tick: Option<String>,
    #[serde(default)]
    pub shutdown_timeout: Option<String>,
    #[serde(default)]
    pub databases: Vec<DatabaseDefinition>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseDefinition {
    pub name: String,
    /// Local SQLite file
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Remote libSQL server
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
pub struct EndpointDefinition {
    pub name: String,
    pub url: String,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_method")]
    pub method: Method,
    #[serde(default)]
    pub headers: Vec<HeaderDefinition>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_backoff")]
    pub backoff: String,
    #[serde(default)]
    pub send_request_if_no_results: bool,
    /// Maximum rows per request, unbounded when missing
    #[serde(default)]
    pub payload_size: Option<usize>,
    #[serde(default = "default_request_delay")]
    pub request_delay: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct HeaderDefinition {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryStrategy {
    #[serde(rename = "delay")]
    #[default]
    Delay,
    #[serde(rename = "exponential_backoff")]
    ExponentialBackoff,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default = "default_slack_channel")]
    pub channel: String,
    #[serde(default = "default_slack_username")]
    pub username: String,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct QueryDefinition {
    pub name: String,
    pub cron: String,
    pub database: String,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
    #[serde(default = "default_query_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    #[serde(default)]
    pub on_failure: FailureAction,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub query_file: Option<PathBuf>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PayloadFormat {
    #[serde(rename = "json_array")]
    #[default]
    JsonArray,
    #[serde(rename = "json_lines")]
    JsonLines,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureAction {
    #[serde(rename = "log_and_continue")]
    #[default]
    LogAndContinue,
    #[serde(rename = "halt")]
    Halt,
    #[serde(rename = "slack_alert")]
    SlackAlert,
    #[serde(rename = "email_alert")]
    EmailAlert,
}

fn default_method() -> Method {
    Method::POST
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_backoff() -> String {
    "15s".to_string()
}

fn default_request_delay() -> String {
    "500ms".to_string()
}

fn default_request_timeout() -> String {
    "100s".to_string()
}

fn default_query_timeout() -> String {
    "30s".to_string()
}

fn default_slack_channel() -> String {
    "#alerts".to_string()
}

fn default_slack_username() -> String {
    "QueryPush".to_string()
}

fn default_cooldown_minutes() -> u32 {
    60
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

pub fn read_config_file(path: &Path) -> anyhow::Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&content)
}

pub fn parse_config_str(content: &str) -> anyhow::Result<ConfigFile> {
    serde_yml::from_str(content).context("Failed to parse config file")
}
