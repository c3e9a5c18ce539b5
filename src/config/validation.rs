use chrono_tz::Tz;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::config::cron::CronSchedule;
use crate::config::file::{ConfigFile, EndpointDefinition, FailureAction, QueryDefinition};
use crate::config::logging::LogOutput;
use crate::config::timeunit::parse_duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Error(String),
    Warning(String),
}

fn check_duration(
    result: &mut Vec<ValidationResult>,
    owner: &str,
    field: &str,
    value: &str,
    min: Duration,
    max: Duration,
) {
    match parse_duration(value) {
        Ok(d) if d < min || d > max => result.push(ValidationResult::Error(format!(
            "{}: '{}' must be between {:?} and {:?}, got {:?}",
            owner, field, min, max, d
        ))),
        Ok(_) => {}
        Err(e) => result.push(ValidationResult::Error(format!("{}: {}", owner, e))),
    }
}

fn check_unique<'a>(
    result: &mut Vec<ValidationResult>,
    kind: &str,
    names: impl Iterator<Item = &'a String>,
) {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            result.push(ValidationResult::Error(format!("{} name must not be empty", kind)));
        } else if !seen.insert(name) {
            result.push(ValidationResult::Error(format!("Non unique {} name: '{}'", kind.to_lowercase(), name)));
        }
    }
}

fn validate_endpoint(endpoint: &EndpointDefinition) -> Vec<ValidationResult> {
    let mut result = vec![];
    let owner = format!("Endpoint '{}'", endpoint.name);

    match Url::parse(&endpoint.url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => result.push(ValidationResult::Error(format!(
            "{}: Unsupported url scheme '{}'",
            owner,
            url.scheme()
        ))),
        Err(e) => result.push(ValidationResult::Error(format!(
            "{}: Invalid url '{}': {}",
            owner, endpoint.url, e
        ))),
    }

    for header in &endpoint.headers {
        if HeaderName::from_bytes(header.name.trim().as_bytes()).is_err() {
            result.push(ValidationResult::Error(format!("{}: Invalid header name '{}'", owner, header.name)));
        }
        if HeaderValue::from_str(header.value.trim()).is_err() {
            result.push(ValidationResult::Error(format!(
                "{}: Invalid value for header '{}'",
                owner, header.name
            )));
        }
    }

    if endpoint.retry_attempts > 10 {
        result.push(ValidationResult::Error(format!(
            "{}: 'retry_attempts' must be between 0 and 10",
            owner
        )));
    }
    if endpoint.payload_size == Some(0) {
        result.push(ValidationResult::Error(format!("{}: 'payload_size' must be at least 1", owner)));
    }

    check_duration(&mut result, &owner, "backoff", &endpoint.backoff, Duration::from_secs(1), Duration::from_secs(300));
    check_duration(&mut result, &owner, "request_delay", &endpoint.request_delay, Duration::ZERO, Duration::from_secs(10));
    check_duration(&mut result, &owner, "request_timeout", &endpoint.request_timeout, Duration::from_secs(1), Duration::from_secs(3600));

    result
}

fn validate_query(conf: &ConfigFile, query: &QueryDefinition) -> Vec<ValidationResult> {
    let mut result = vec![];
    let owner = format!("Query '{}'", query.name);

    if let Err(e) = CronSchedule::parse(&query.cron) {
        result.push(ValidationResult::Error(format!("{}: Invalid cron expression: {:#}", owner, e)));
    }

    if !conf.databases.iter().any(|d| d.name == query.database) {
        result.push(ValidationResult::Error(format!(
            "{}: References unknown database '{}'",
            owner, query.database
        )));
    }
    if !conf.endpoints.iter().any(|e| e.name == query.endpoint) {
        result.push(ValidationResult::Error(format!(
            "{}: References unknown endpoint '{}'",
            owner, query.endpoint
        )));
    }

    match query.on_failure {
        FailureAction::SlackAlert if conf.alerts.slack.is_none() => result.push(ValidationResult::Error(
            format!("{}: Uses slack_alert but Slack configuration is missing", owner),
        )),
        FailureAction::EmailAlert if conf.alerts.email.is_none() => result.push(ValidationResult::Error(
            format!("{}: Uses email_alert but Email configuration is missing", owner),
        )),
        _ => {}
    }

    match (&query.query_text, &query.query_file) {
        (None, None) => result.push(ValidationResult::Error(format!(
            "{}: Must specify either 'query_text' or 'query_file'",
            owner
        ))),
        (Some(_), Some(_)) => result.push(ValidationResult::Error(format!(
            "{}: Cannot specify both 'query_text' and 'query_file'",
            owner
        ))),
        (Some(text), None) if text.trim().is_empty() => {
            result.push(ValidationResult::Error(format!("{}: 'query_text' must not be empty", owner)))
        }
        (None, Some(path)) if !Path::new(path).is_file() => result.push(ValidationResult::Error(format!(
            "{}: Query file '{}' not found",
            owner,
            path.display()
        ))),
        _ => {}
    }

    check_duration(&mut result, &owner, "timeout", &query.timeout, Duration::from_secs(1), Duration::from_secs(3600));

    if query.max_rows == Some(0) {
        result.push(ValidationResult::Error(format!("{}: 'max_rows' must be at least 1", owner)));
    }

    if let Some(tz_name) = &query.timezone {
        if tz_name.parse::<Tz>().is_err() {
            result.push(ValidationResult::Error(format!("{}: Unable to parse timezone '{}'", owner, tz_name)));
        }
    }

    if !query.enabled {
        result.push(ValidationResult::Warning(format!("{}: Disabled, it will not be scheduled", owner)));
    }

    result
}

fn validate_alerts(conf: &ConfigFile) -> Vec<ValidationResult> {
    let mut result = vec![];

    if let Some(slack) = &conf.alerts.slack {
        if Url::parse(&slack.webhook_url).is_err() {
            result.push(ValidationResult::Error(format!(
                "Slack: Invalid webhook url '{}'",
                slack.webhook_url
            )));
        }
        if !(1..=1440).contains(&slack.cooldown_minutes) {
            result.push(ValidationResult::Error(
                "Slack: 'cooldown_minutes' must be between 1 and 1440".to_string(),
            ));
        }
    }

    if let Some(email) = &conf.alerts.email {
        if email.smtp_host.trim().is_empty() {
            result.push(ValidationResult::Error("Email: 'smtp_host' must not be empty".to_string()));
        }
        if email.smtp_port == 0 {
            result.push(ValidationResult::Error("Email: 'smtp_port' must not be 0".to_string()));
        }
        for (field, address) in [("from", &email.from), ("to", &email.to)] {
            if address.parse::<lettre::message::Mailbox>().is_err() {
                result.push(ValidationResult::Error(format!(
                    "Email: Invalid '{}' address '{}'",
                    field, address
                )));
            }
        }
        if !(1..=1440).contains(&email.cooldown_minutes) {
            result.push(ValidationResult::Error(
                "Email: 'cooldown_minutes' must be between 1 and 1440".to_string(),
            ));
        }
    }

    result
}

fn validate_logging_config(conf: &ConfigFile) -> Vec<ValidationResult> {
    let mut result = vec![];

    if let Some(logging) = &conf.logging {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&logging.level.as_str()) {
            result.push(ValidationResult::Error(format!(
                "Invalid log level '{}'. Must be one of: {}",
                logging.level,
                valid_levels.join(", ")
            )));
        }

        if logging.output == LogOutput::File {
            if logging.directory.exists() && !logging.directory.is_dir() {
                result.push(ValidationResult::Error(format!(
                    "Log directory '{}' exists but is not a directory",
                    logging.directory.display()
                )));
            }
            if !(1..=365).contains(&logging.retention_days) {
                result.push(ValidationResult::Error(
                    "'retention_days' must be between 1 and 365".to_string(),
                ));
            }
        }
    }

    result
}

pub fn validate_config(conf: &ConfigFile) -> Vec<ValidationResult> {
    let mut result = vec![];

    if conf.databases.is_empty() {
        result.push(ValidationResult::Error("At least one database configuration is required".to_string()));
    }
    if conf.endpoints.is_empty() {
        result.push(ValidationResult::Error("At least one endpoint configuration is required".to_string()));
    }
    if conf.queries.is_empty() {
        result.push(ValidationResult::Warning("No queries configured".to_string()));
    }

    check_unique(&mut result, "Database", conf.databases.iter().map(|d| &d.name));
    check_unique(&mut result, "Endpoint", conf.endpoints.iter().map(|e| &e.name));
    check_unique(&mut result, "Query", conf.queries.iter().map(|q| &q.name));

    for database in &conf.databases {
        match (&database.path, &database.url) {
            (None, None) => result.push(ValidationResult::Error(format!(
                "Database '{}': Must specify either 'path' or 'url'",
                database.name
            ))),
            (Some(_), Some(_)) => result.push(ValidationResult::Error(format!(
                "Database '{}': Cannot specify both 'path' and 'url'",
                database.name
            ))),
            _ => {}
        }
    }

    for endpoint in &conf.endpoints {
        result.extend(validate_endpoint(endpoint));
    }

    for query in &conf.queries {
        result.extend(validate_query(conf, query));
    }

    result.extend(validate_alerts(conf));
    result.extend(validate_logging_config(conf));

    if let Some(tick) = &conf.tick {
        check_duration(&mut result, "Scheduler", "tick", tick, Duration::from_millis(100), Duration::from_secs(60));
    }
    if let Some(timeout) = &conf.shutdown_timeout {
        if let Err(e) = parse_duration(timeout) {
            result.push(ValidationResult::Error(format!("Scheduler: {}", e)));
        }
    }

    result
}

/// Joins all errors into one message, `None` when the configuration is usable
pub fn error_report(results: &[ValidationResult]) -> Option<String> {
    let errors: Vec<&str> = results
        .iter()
        .filter_map(|r| match r {
            ValidationResult::Error(m) => Some(m.as_str()),
            ValidationResult::Warning(_) => None,
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!("Configuration validation failed:\n{}", errors.join("\n")))
    }
}
