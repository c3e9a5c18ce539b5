use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::config::{AlertsConfig, EmailConfig, Job, SlackConfig};
use crate::delivery::DeliveryError;
use crate::errors;
use crate::state::StateStore;
use crate::utils::escape_html;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertChannel {
    Slack,
    Email,
}

impl fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertChannel::Slack => write!(f, "Slack"),
            AlertChannel::Email => write!(f, "Email"),
        }
    }
}

/// Everything a notification reports about one failed job
pub struct FailureReport<'a> {
    pub job: &'a Job,
    pub query_text: &'a str,
    pub error: &'a anyhow::Error,
    pub time: DateTime<Utc>,
}

impl FailureReport<'_> {
    fn local_time(&self) -> String {
        self.time
            .with_timezone(&self.job.timezone)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    fn message(&self) -> String {
        format!("{:#}", self.error)
    }
}

/// `true` when no alert was sent yet, or the cooldown has fully elapsed
pub fn cooldown_elapsed(last: Option<DateTime<Utc>>, cooldown_minutes: u32, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => now >= last + TimeDelta::minutes(cooldown_minutes as i64),
    }
}

pub struct AlertDispatcher {
    config: AlertsConfig,
    state: Arc<StateStore>,
    client: Client,
}

impl AlertDispatcher {
    pub fn new(config: AlertsConfig, state: Arc<StateStore>) -> Self {
        Self {
            config,
            state,
            client: Client::new(),
        }
    }

    fn cooldown_minutes(&self, channel: AlertChannel) -> u32 {
        match channel {
            AlertChannel::Slack => self.config.slack.as_ref().map(|c| c.cooldown_minutes),
            AlertChannel::Email => self.config.email.as_ref().map(|c| c.cooldown_minutes),
        }
        .unwrap_or(60)
    }

    pub async fn can_send(&self, job: &str, channel: AlertChannel) -> bool {
        let last = self.state.last_alert(job, channel).await;
        let cooldown = self.cooldown_minutes(channel);
        let allowed = cooldown_elapsed(last, cooldown, Utc::now());

        if let (false, Some(last)) = (allowed, last) {
            let remaining = last + TimeDelta::minutes(cooldown as i64) - Utc::now();
            debug!(
                "{} alert for '{}' is in cooldown for {} more minutes",
                channel,
                job,
                remaining.num_minutes() + 1
            );
        }
        allowed
    }

    /// Sends one notification unless the channel is cooling down.
    /// The send time is stored only after the transport accepted the message.
    pub async fn dispatch(&self, channel: AlertChannel, report: &FailureReport<'_>) -> Result<()> {
        let job = &report.job.name;

        if !self.can_send(job, channel).await {
            debug!("Skipping {} alert for '{}' due to cooldown period", channel, job);
            return Ok(());
        }

        let sent = match channel {
            AlertChannel::Slack => match &self.config.slack {
                Some(slack) => self.send_slack(slack, report).await,
                None => {
                    warn!("Slack alert requested for '{}' but Slack configuration is missing", job);
                    return Ok(());
                }
            },
            AlertChannel::Email => match &self.config.email {
                Some(email) => send_email(email.clone(), report).await,
                None => {
                    warn!("Email alert requested for '{}' but email configuration is missing", job);
                    return Ok(());
                }
            },
        };

        if let Err(e) = sent {
            error!("Failed to send {} alert for '{}': {:#}", channel, job, e);
            return Err(e);
        }

        info!("{} alert sent successfully for '{}'", channel, job);
        self.state.set_last_alert(job, channel, Utc::now()).await;
        self.state.save().await
    }

    async fn send_slack(&self, slack: &SlackConfig, report: &FailureReport<'_>) -> Result<()> {
        info!(
            "Sending Slack alert for '{}' to channel '{}'",
            report.job.name, slack.channel
        );

        let response = self
            .client
            .post(&slack.webhook_url)
            .json(&slack_payload(slack, report))
            .send()
            .await
            .map_err(DeliveryError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body }.into());
        }
        Ok(())
    }
}

pub fn slack_payload(slack: &SlackConfig, report: &FailureReport<'_>) -> Value {
    let job = report.job;
    json!({
        "channel": slack.channel,
        "username": slack.username,
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": format!("🚨 QueryPush Failure: {}", job.name) }
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*Database:*\n{}", job.database) },
                    { "type": "mrkdwn", "text": format!("*Endpoint:*\n{}", job.endpoint.name) },
                    { "type": "mrkdwn", "text": format!("*Schedule:*\n`{}`", job.schedule) },
                    { "type": "mrkdwn", "text": format!("*Time:*\n{}", report.local_time()) }
                ]
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Query:*\n```sql\n{}\n```", report.query_text) }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Error:*\n```\n{}\n```", report.message()) }
            },
            {
                "type": "context",
                "elements": [
                    { "type": "mrkdwn", "text": format!("Exception Type: `{}`", errors::kind(report.error)) }
                ]
            }
        ]
    })
}

pub fn email_html(report: &FailureReport<'_>) -> String {
    let job = report.job;
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 20px; }}
        .header {{ background-color: #dc3545; color: white; padding: 15px; border-radius: 5px; margin-bottom: 20px; }}
        .section {{ margin-bottom: 20px; }}
        .label {{ font-weight: bold; color: #495057; }}
        .code {{ background-color: #f8f9fa; border: 1px solid #dee2e6; padding: 10px; border-radius: 5px; font-family: monospace; white-space: pre-wrap; }}
        .error {{ background-color: #f8d7da; border: 1px solid #f5c6cb; color: #721c24; padding: 10px; border-radius: 5px; }}
    </style>
</head>
<body>
    <div class="header"><h2>🚨 QueryPush Failure: {name}</h2></div>
    <div class="section">
        <p><span class="label">Database:</span> {database}</p>
        <p><span class="label">Endpoint:</span> {endpoint}</p>
        <p><span class="label">Schedule:</span> {schedule}</p>
        <p><span class="label">Failure Time:</span> {time}</p>
    </div>
    <div class="section">
        <h3>Query</h3>
        <div class="code">{query}</div>
    </div>
    <div class="section">
        <h3>Exception Details</h3>
        <div class="error">
            <p><span class="label">Type:</span> {kind}</p>
            <p><span class="label">Message:</span> {message}</p>
        </div>
    </div>
</body>
</html>
"#,
        name = escape_html(&job.name),
        database = escape_html(&job.database),
        endpoint = escape_html(&job.endpoint.name),
        schedule = escape_html(job.schedule.expression()),
        time = report.local_time(),
        query = escape_html(report.query_text),
        kind = errors::kind(report.error),
        message = escape_html(&report.message()),
    )
}

async fn send_email(config: EmailConfig, report: &FailureReport<'_>) -> Result<()> {
    info!("Sending email alert for '{}' to {}", report.job.name, config.to);

    let from: Mailbox = config
        .from
        .parse()
        .with_context(|| format!("Invalid sender address '{}'", config.from))?;
    let to: Mailbox = config
        .to
        .parse()
        .with_context(|| format!("Invalid recipient address '{}'", config.to))?;

    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(format!("QueryPush Failure for {} Query", report.job.name))
        .header(ContentType::TEXT_HTML)
        .body(email_html(report))?;

    // lettre's SMTP transport blocks
    tokio::task::spawn_blocking(move || {
        let builder = if config.use_ssl {
            SmtpTransport::starttls_relay(&config.smtp_host)?
        } else {
            SmtpTransport::builder_dangerous(&config.smtp_host)
        };
        let mut mailer = builder.port(config.smtp_port);

        if let Some(username) = &config.username {
            mailer = mailer.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        mailer.build().send(&email)?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Email task failed: {}", e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::parse_config_str;
    use crate::config::parse_config_file;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
databases:
  - name: warehouse
    path: warehouse.db
endpoints:
  - name: api
    url: http://localhost:9/ingest
queries:
  - name: orders
    cron: "0 * * * *"
    database: warehouse
    endpoint: api
    timezone: UTC
    query_text: SELECT 1
"#;

    fn job() -> Arc<Job> {
        let config = parse_config_file(&parse_config_str(CONFIG).unwrap()).unwrap();
        config.jobs[0].clone()
    }

    async fn webhook(status: StatusCode) -> (String, Arc<Mutex<Vec<Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(body);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/hook", addr), received)
    }

    fn slack(url: &str) -> SlackConfig {
        SlackConfig {
            webhook_url: url.to_string(),
            channel: "#ops".to_string(),
            username: "QueryPush".to_string(),
            cooldown_minutes: 60,
        }
    }

    #[test]
    fn test_cooldown_boundary() {
        let last = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(cooldown_elapsed(None, 60, last));
        assert!(!cooldown_elapsed(Some(last), 60, last + TimeDelta::minutes(59)));
        assert!(!cooldown_elapsed(Some(last), 60, last + TimeDelta::seconds(3599)));
        assert!(cooldown_elapsed(Some(last), 60, last + TimeDelta::minutes(60)));
        assert!(cooldown_elapsed(Some(last), 60, last + TimeDelta::hours(5)));
    }

    #[test]
    fn test_slack_payload_sections() {
        let job = job();
        let error = anyhow!("connection refused");
        let report = FailureReport {
            job: &job,
            query_text: "SELECT * FROM orders",
            error: &error,
            time: Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap(),
        };

        let payload = slack_payload(&slack("http://unused"), &report);
        assert_eq!(payload["channel"], "#ops");
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0]["text"]["text"], "🚨 QueryPush Failure: orders");
        assert_eq!(blocks[1]["fields"][0]["text"], "*Database:*\nwarehouse");
        assert_eq!(blocks[1]["fields"][1]["text"], "*Endpoint:*\napi");
        assert_eq!(blocks[1]["fields"][2]["text"], "*Schedule:*\n`0 * * * *`");
        assert_eq!(blocks[1]["fields"][3]["text"], "*Time:*\n2026-03-01 12:30:00");
        assert_eq!(blocks[2]["text"]["text"], "*Query:*\n```sql\nSELECT * FROM orders\n```");
        assert_eq!(blocks[3]["text"]["text"], "*Error:*\n```\nconnection refused\n```");
        assert_eq!(blocks[4]["elements"][0]["text"], "Exception Type: `Error`");
    }

    #[test]
    fn test_email_is_escaped() {
        let job = job();
        let error = anyhow!("near \"<\": syntax error");
        let report = FailureReport {
            job: &job,
            query_text: "SELECT * FROM t WHERE a < 1",
            error: &error,
            time: Utc::now(),
        };

        let html = email_html(&report);
        assert!(html.contains("QueryPush Failure: orders"));
        assert!(html.contains("SELECT * FROM t WHERE a &lt; 1"));
        assert!(html.contains("near &quot;&lt;&quot;: syntax error"));
        assert!(html.contains("<span class=\"label\">Database:</span> warehouse"));
    }

    #[tokio::test]
    async fn test_slack_alert_respects_cooldown() {
        let dir = tempdir().unwrap();
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let (url, received) = webhook(StatusCode::OK).await;
        let dispatcher = AlertDispatcher::new(
            AlertsConfig {
                slack: Some(slack(&url)),
                email: None,
            },
            state.clone(),
        );

        let job = job();
        let error = anyhow!("boom");
        let report = FailureReport {
            job: &job,
            query_text: "SELECT 1",
            error: &error,
            time: Utc::now(),
        };

        dispatcher.dispatch(AlertChannel::Slack, &report).await.unwrap();
        dispatcher.dispatch(AlertChannel::Slack, &report).await.unwrap();

        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(state.last_alert("orders", AlertChannel::Slack).await.is_some());
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_failed_send_is_not_recorded() {
        let dir = tempdir().unwrap();
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let (url, received) = webhook(StatusCode::INTERNAL_SERVER_ERROR).await;
        let dispatcher = AlertDispatcher::new(
            AlertsConfig {
                slack: Some(slack(&url)),
                email: None,
            },
            state.clone(),
        );

        let job = job();
        let error = anyhow!("boom");
        let report = FailureReport {
            job: &job,
            query_text: "SELECT 1",
            error: &error,
            time: Utc::now(),
        };

        let result = dispatcher.dispatch(AlertChannel::Slack, &report).await;
        assert!(result.is_err());
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(state.last_alert("orders", AlertChannel::Slack).await, None);
    }

    #[tokio::test]
    async fn test_missing_channel_is_skipped() {
        let dir = tempdir().unwrap();
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let dispatcher = AlertDispatcher::new(AlertsConfig::default(), state.clone());

        let job = job();
        let error = anyhow!("boom");
        let report = FailureReport {
            job: &job,
            query_text: "SELECT 1",
            error: &error,
            time: Utc::now(),
        };

        dispatcher.dispatch(AlertChannel::Email, &report).await.unwrap();
        assert_eq!(state.last_alert("orders", AlertChannel::Email).await, None);
    }
}
