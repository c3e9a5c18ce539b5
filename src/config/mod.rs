pub mod cron;
pub mod file;
pub mod logging;
pub mod names;
pub mod timeunit;
pub mod validation;

use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use log::{error, warn};
use nom::character::complete::digit1;
use nom::combinator::map_res;
use nom::IResult;
use reqwest::{Method, Url};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::alerts::AlertChannel;
use crate::retry::RetryPolicy;

use self::cron::CronSchedule;
use self::file::{read_config_file, ConfigFile, DatabaseDefinition, EndpointDefinition, QueryDefinition};
use self::timeunit::parse_duration;
use self::validation::{error_report, validate_config, ValidationResult};

pub use self::file::{AlertsConfig, EmailConfig, FailureAction, PayloadFormat, RetryStrategy, SlackConfig};

pub const DEFAULT_STATE_FILE: &str = "QueryState.json";

/// One configuration generation, immutable until the next reload
#[derive(Debug, Clone)]
pub struct Config {
    pub jobs: Vec<Arc<Job>>,
    pub databases: Vec<DatabaseConfig>,
    pub alerts: AlertsConfig,
    pub state_file: PathBuf,
    pub tick: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub schedule: CronSchedule,
    pub timezone: Tz,
    pub database: String,
    pub endpoint: Arc<Endpoint>,
    pub enabled: bool,
    pub run_on_startup: bool,
    pub timeout: Duration,
    pub max_rows: Option<usize>,
    pub payload_format: PayloadFormat,
    pub failure_policy: FailurePolicy,
    pub query: QuerySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    Inline(String),
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    LogAndContinue,
    Halt,
    Alert(AlertChannel),
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: Url,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub send_if_empty: bool,
    /// Maximum rows per chunk, `None` sends everything in one request
    pub payload_size: Option<usize>,
    pub request_delay: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub name: String,
    pub source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Local(PathBuf),
    Remote { url: String, auth_token: String },
}

/// Logs every validation finding, `Err` with the aggregated report when any is an error
pub fn check_config(file: &ConfigFile) -> Result<()> {
    let results = validate_config(file);
    for result in &results {
        match result {
            ValidationResult::Error(m) => error!("{}", m),
            ValidationResult::Warning(m) => warn!("{}", m),
        }
    }

    match error_report(&results) {
        Some(report) => bail!(report),
        None => Ok(()),
    }
}

/// Reads, validates and resolves a configuration file
pub fn load_config(path: &Path) -> Result<Config> {
    let file = read_config_file(path)?;
    check_config(&file)?;
    parse_config_file(&file)
}

pub fn parse_config_file(file: &ConfigFile) -> Result<Config> {
    let mut databases = Vec::with_capacity(file.databases.len());
    for (i, definition) in file.databases.iter().enumerate() {
        let database = DatabaseConfig::parse(definition).with_context(|| {
            format!("Malformed database '{}' at position {}", definition.name, i + 1)
        })?;
        databases.push(database);
    }

    let mut endpoints: Vec<Arc<Endpoint>> = Vec::with_capacity(file.endpoints.len());
    for (i, definition) in file.endpoints.iter().enumerate() {
        let endpoint = Endpoint::parse(definition).with_context(|| {
            format!("Malformed endpoint '{}' at position {}", definition.name, i + 1)
        })?;
        endpoints.push(Arc::new(endpoint));
    }

    let mut jobs = Vec::with_capacity(file.queries.len());
    for (i, definition) in file.queries.iter().enumerate() {
        let job = Job::parse(definition, &endpoints, &databases, &file.alerts).with_context(|| {
            format!("Malformed query '{}' at position {}", definition.name, i + 1)
        })?;
        jobs.push(Arc::new(job));
    }

    Ok(Config {
        jobs,
        databases,
        alerts: file.alerts.clone(),
        state_file: file
            .state_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
        tick: optional_duration(&file.tick, Duration::from_secs(1)).context("Malformed tick")?,
        shutdown_timeout: optional_duration(&file.shutdown_timeout, Duration::from_secs(30))
            .context("Malformed shutdown_timeout")?,
    })
}

impl Job {
    fn parse(
        config: &QueryDefinition,
        endpoints: &[Arc<Endpoint>],
        databases: &[DatabaseConfig],
        alerts: &AlertsConfig,
    ) -> Result<Self> {
        let query = match (&config.query_text, &config.query_file) {
            (Some(_), Some(_)) => bail!("Defines both 'query_text' and 'query_file'. Only one is allowed."),
            (Some(text), None) => QuerySource::Inline(text.clone()),
            (None, Some(path)) => QuerySource::File(path.clone()),
            (None, None) => bail!("No query specified, set 'query_text' or 'query_file'"),
        };

        let endpoint = endpoints
            .iter()
            .find(|e| e.name == config.endpoint)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown endpoint '{}'", config.endpoint))?;

        if !databases.iter().any(|d| d.name == config.database) {
            bail!("Unknown database '{}'", config.database);
        }

        let failure_policy = match config.on_failure {
            FailureAction::LogAndContinue => FailurePolicy::LogAndContinue,
            FailureAction::Halt => FailurePolicy::Halt,
            FailureAction::SlackAlert if alerts.slack.is_none() => {
                bail!("Uses 'slack_alert' but alerts.slack is not configured")
            }
            FailureAction::EmailAlert if alerts.email.is_none() => {
                bail!("Uses 'email_alert' but alerts.email is not configured")
            }
            FailureAction::SlackAlert => FailurePolicy::Alert(AlertChannel::Slack),
            FailureAction::EmailAlert => FailurePolicy::Alert(AlertChannel::Email),
        };

        let timezone: Tz = match &config.timezone {
            Some(name) => name
                .parse()
                .map_err(|e| anyhow!("Unable to parse timezone '{}': {}", name, e))?,
            None => system_timezone(),
        };

        Ok(Self {
            name: config.name.clone(),
            schedule: CronSchedule::parse(&config.cron)?,
            timezone,
            database: config.database.clone(),
            endpoint,
            enabled: config.enabled,
            run_on_startup: config.run_on_startup,
            timeout: parse_duration(&config.timeout).context("Malformed timeout")?,
            max_rows: config.max_rows,
            payload_format: config.payload_format,
            failure_policy,
            query,
        })
    }
}

impl Endpoint {
    fn parse(config: &EndpointDefinition) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| anyhow!("Invalid url '{}': {}", config.url, e))?;

        Ok(Self {
            name: config.name.clone(),
            url,
            method: config.method.clone(),
            headers: config
                .headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            retry: RetryPolicy {
                retries: config.retry_attempts,
                strategy: config.retry_strategy,
                backoff: parse_duration(&config.backoff).context("Malformed backoff")?,
            },
            send_if_empty: config.send_request_if_no_results,
            payload_size: config.payload_size,
            request_delay: parse_duration(&config.request_delay).context("Malformed request_delay")?,
            request_timeout: parse_duration(&config.request_timeout)
                .context("Malformed request_timeout")?,
        })
    }
}

impl DatabaseConfig {
    fn parse(config: &DatabaseDefinition) -> Result<Self> {
        let source = match (&config.path, &config.url) {
            (Some(path), None) => DataSource::Local(path.clone()),
            (None, Some(url)) => DataSource::Remote {
                url: url.clone(),
                auth_token: config.auth_token.clone().unwrap_or_default(),
            },
            (Some(_), Some(_)) => bail!("Defines both 'path' and 'url'. Only one is allowed."),
            (None, None) => bail!("No data source specified, set 'path' or 'url'"),
        };

        Ok(Self {
            name: config.name.clone(),
            source,
        })
    }
}

fn optional_duration(value: &Option<String>, default: Duration) -> Result<Duration> {
    match value {
        Some(s) => parse_duration(s),
        None => Ok(default),
    }
}

pub fn system_timezone() -> Tz {
    iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| name.parse().ok())
        .unwrap_or(Tz::UTC)
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>)(input)
}

#[cfg(test)]
mod tests {
    use super::file::parse_config_str;
    use super::*;

    const CONFIG: &str = r#"
state_file: /tmp/state.json
tick: 2s
databases:
  - name: main
    path: data.db
endpoints:
  - name: api
    url: http://localhost:8080/ingest
    backoff: 2s
    retry_strategy: exponential_backoff
alerts:
  email:
    smtp_host: smtp.example.com
    from: querypush@example.com
    to: ops@example.com
queries:
  - name: orders
    cron: "*/5 * * * *"
    database: main
    endpoint: api
    timezone: Europe/Madrid
    on_failure: email_alert
    query_text: SELECT * FROM orders WHERE created_at > '{LastRun|yyyy-MM-dd HH:mm:ss}'
"#;

    #[test]
    fn test_parse_config() {
        let config = parse_config_file(&parse_config_str(CONFIG).unwrap()).unwrap();

        assert_eq!(config.state_file, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.tick, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));

        let job = &config.jobs[0];
        assert_eq!(job.name, "orders");
        assert_eq!(job.schedule.expression(), "*/5 * * * *");
        assert_eq!(job.timezone, chrono_tz::Europe::Madrid);
        assert_eq!(job.endpoint.name, "api");
        assert_eq!(job.endpoint.retry.backoff, Duration::from_secs(2));
        assert_eq!(job.endpoint.request_delay, Duration::from_millis(500));
        assert_eq!(job.timeout, Duration::from_secs(30));
        assert_eq!(job.failure_policy, FailurePolicy::Alert(AlertChannel::Email));
        assert!(matches!(job.query, QuerySource::Inline(_)));
        assert_eq!(
            config.databases[0].source,
            DataSource::Local(PathBuf::from("data.db"))
        );
    }

    #[test]
    fn test_unknown_endpoint_is_rejected() {
        let text = CONFIG.replace("endpoint: api", "endpoint: missing");
        let result = parse_config_file(&parse_config_str(&text).unwrap());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Unknown endpoint 'missing'"), "{}", message);
    }

    #[test]
    fn test_alert_channel_must_be_configured() {
        let text = CONFIG.replace("on_failure: email_alert", "on_failure: slack_alert");
        let result = parse_config_file(&parse_config_str(&text).unwrap());
        assert!(result.is_err());
    }
}
