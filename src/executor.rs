use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

use crate::alerts::{AlertDispatcher, FailureReport};
use crate::config::{AlertsConfig, FailurePolicy, Job, QuerySource};
use crate::delivery::Delivery;
use crate::errors::is_invalid_query;
use crate::query::QueryAccess;
use crate::state::StateStore;
use crate::template::{self, TemplateContext};
use crate::utils::{format_duration, short_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

/// Runs jobs end to end: query text, variables, query, delivery, failure policy
pub struct Engine {
    query: Arc<dyn QueryAccess>,
    delivery: Delivery,
    alerts: AlertDispatcher,
    state: Arc<StateStore>,
}

impl Engine {
    pub fn new(query: Arc<dyn QueryAccess>, alerts: AlertsConfig, state: Arc<StateStore>) -> Self {
        Self {
            query,
            delivery: Delivery::default(),
            alerts: AlertDispatcher::new(alerts, state.clone()),
            state,
        }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Executes `job` until one attempt succeeds or the retry budget is spent.
    ///
    /// Returns `Err` only when the job's failure policy is `halt`; every other
    /// failure is handled here and reported as [`Outcome::Failed`].
    pub async fn execute(&self, job: &Job) -> Result<Outcome> {
        let id = short_id();
        let policy = &job.endpoint.retry;
        let start = Instant::now();

        info!(
            "[{}] Starting execution of query '{}' (max attempts: {})",
            id,
            job.name,
            policy.max_attempts()
        );

        let mut resolved = None;
        let mut attempt = 0;

        let failure = loop {
            attempt += 1;

            let e = match self.attempt(job, &mut resolved).await {
                Ok(()) => {
                    info!(
                        "[{}] Query '{}' completed successfully on attempt {} in {}",
                        id,
                        job.name,
                        attempt,
                        format_duration(start.elapsed())
                    );
                    match self.record_success(job).await {
                        Ok(()) => return Ok(Outcome::Succeeded { attempts: attempt }),
                        Err(e) => break e,
                    }
                }
                Err(e) => e,
            };

            if is_invalid_query(&e) {
                error!(
                    "[{}] Query '{}' failed with invalid query error, skipping retries: {:#}",
                    id, job.name, e
                );
                break e;
            }

            if attempt >= policy.max_attempts() {
                error!(
                    "[{}] Query '{}' failed on final attempt {}/{}: {:#}",
                    id,
                    job.name,
                    attempt,
                    policy.max_attempts(),
                    e
                );
                break e;
            }

            let delay = policy.delay(attempt);
            warn!(
                "[{}] Query '{}' failed on attempt {}/{}: {:#}. Retrying in {}",
                id,
                job.name,
                attempt,
                policy.max_attempts(),
                e,
                format_duration(delay)
            );
            sleep(delay).await;
        };

        let query_text = match resolved {
            Some(text) => text,
            None => self.query_text(job).await.unwrap_or_default(),
        };
        self.handle_failure(job, &query_text, failure).await?;

        Ok(Outcome::Failed { attempts: attempt })
    }

    async fn attempt(&self, job: &Job, resolved: &mut Option<String>) -> Result<()> {
        debug!("Executing single attempt for query '{}'", job.name);

        let text = self.query_text(job).await?;
        let context = TemplateContext::new(
            job.name.as_str(),
            job.timezone,
            self.state.last_run(&job.name).await,
        );
        let text = resolved.insert(template::resolve(&text, &context));

        let rows = self
            .query
            .run_query(&job.database, text, job.timeout, job.max_rows)
            .await?;
        debug!("Database query returned {} rows", rows.len());

        if rows.is_empty() && !job.endpoint.send_if_empty {
            info!(
                "Query '{}' returned no results and send_request_if_no_results is disabled, skipping HTTP request",
                job.name
            );
            return Ok(());
        }

        self.delivery
            .send(&job.endpoint, &rows, job.payload_format)
            .await
    }

    async fn query_text(&self, job: &Job) -> Result<String> {
        match &job.query {
            QuerySource::Inline(text) => Ok(text.clone()),
            QuerySource::File(path) => {
                debug!("Reading query file '{}' for '{}'", path.display(), job.name);
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Unable to read query file '{}'", path.display()))
            }
        }
    }

    async fn record_success(&self, job: &Job) -> Result<()> {
        self.state.set_last_run(&job.name, Utc::now()).await;
        self.state
            .save()
            .await
            .with_context(|| format!("Unable to record the run of '{}'", job.name))
    }

    async fn handle_failure(&self, job: &Job, query_text: &str, error: anyhow::Error) -> Result<()> {
        match job.failure_policy {
            FailurePolicy::LogAndContinue => {
                warn!("Query '{}' failed but configured to continue execution", job.name);
                Ok(())
            }
            FailurePolicy::Halt => {
                error!("Query '{}' configured to halt on failure, terminating execution", job.name);
                Err(error.context(format!("Query '{}' failed with halt policy", job.name)))
            }
            FailurePolicy::Alert(channel) => {
                let report = FailureReport {
                    job,
                    query_text,
                    error: &error,
                    time: Utc::now(),
                };
                if let Err(e) = self.alerts.dispatch(channel, &report).await {
                    warn!("Alert for '{}' could not be delivered: {:#}", job.name, e);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::config::file::parse_config_str;
    use crate::config::{parse_config_file, Config};
    use crate::query::Row;
    use async_trait::async_trait;
    use axum::routing::post;
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FakeQuery {
        calls: Mutex<Vec<(tokio::time::Instant, String)>>,
        error: Option<&'static str>,
        failures: AtomicU32,
        rows: Vec<Row>,
    }

    impl FakeQuery {
        fn rows(rows: Vec<Row>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                error: None,
                failures: AtomicU32::new(0),
                rows,
            })
        }

        fn failing(error: &'static str, times: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                error: Some(error),
                failures: AtomicU32::new(times),
                rows: Vec::new(),
            })
        }

        fn texts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl QueryAccess for FakeQuery {
        async fn run_query(
            &self,
            _source: &str,
            query: &str,
            _timeout: Duration,
            _max_rows: Option<usize>,
        ) -> Result<Vec<Row>> {
            self.calls
                .lock()
                .unwrap()
                .push((tokio::time::Instant::now(), query.to_string()));

            if let Some(error) = self.error {
                if self.failures.load(Ordering::SeqCst) > 0 {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(anyhow!(error));
                }
            }
            Ok(self.rows.clone())
        }
    }

    fn config(url: &str, endpoint: &str, query: &str) -> Config {
        let text = format!(
            r#"
databases:
  - name: main
    path: main.db
endpoints:
  - name: api
    url: {url}
{endpoint}
alerts:
  slack:
    webhook_url: {url}
queries:
  - name: orders
    cron: "*/5 * * * *"
    database: main
    endpoint: api
    timezone: UTC
{query}
"#
        );
        parse_config_file(&parse_config_str(&text).unwrap()).unwrap()
    }

    async fn counting_server() -> (String, Arc<Mutex<Vec<String>>>) {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        let app = Router::new().route(
            "/",
            post(move |body: String| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(body);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/", addr), bodies)
    }

    fn row(id: i64) -> Row {
        match json!({ "id": id }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_between_attempts() {
        let dir = tempdir().unwrap();
        let config = config(
            "http://127.0.0.1:9/",
            "    retry_attempts: 3\n    retry_strategy: exponential_backoff\n    backoff: 2s",
            "    query_text: SELECT 1",
        );
        let fake = FakeQuery::failing("connection reset by peer", 10);
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let engine = Engine::new(fake.clone(), config.alerts.clone(), state.clone());

        let outcome = engine.execute(&config.jobs[0]).await.unwrap();
        assert_eq!(outcome, Outcome::Failed { attempts: 4 });

        let calls = fake.calls.lock().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].0 - w[0].0).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
        assert_eq!(state.last_run("orders").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let dir = tempdir().unwrap();
        let config = config(
            "http://127.0.0.1:9/",
            "    send_request_if_no_results: false\n    backoff: 1s",
            "    query_text: SELECT 1",
        );
        let fake = FakeQuery::failing("database is locked", 1);
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let engine = Engine::new(fake.clone(), config.alerts.clone(), state.clone());

        let outcome = engine.execute(&config.jobs[0]).await.unwrap();
        assert_eq!(outcome, Outcome::Succeeded { attempts: 2 });
        assert!(state.last_run("orders").await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_query_is_not_retried() {
        let dir = tempdir().unwrap();
        let config = config("http://127.0.0.1:9/", "    retry_attempts: 5", "    query_text: SELEC 1");
        let fake = FakeQuery::failing("near \"SELEC\": syntax error", 10);
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let engine = Engine::new(fake.clone(), config.alerts.clone(), state);

        let outcome = engine.execute(&config.jobs[0]).await.unwrap();
        assert_eq!(outcome, Outcome::Failed { attempts: 1 });
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_skips_delivery_and_records_run() {
        let dir = tempdir().unwrap();
        let (url, bodies) = counting_server().await;
        let config = config(&url, "    send_request_if_no_results: false", "    query_text: SELECT 1");
        let fake = FakeQuery::rows(Vec::new());
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let engine = Engine::new(fake, config.alerts.clone(), state.clone());

        let outcome = engine.execute(&config.jobs[0]).await.unwrap();
        assert_eq!(outcome, Outcome::Succeeded { attempts: 1 });
        assert!(bodies.lock().unwrap().is_empty());
        assert!(state.last_run("orders").await.is_some());
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn test_empty_result_is_sent_when_enabled() {
        let dir = tempdir().unwrap();
        let (url, bodies) = counting_server().await;
        let config = config(&url, "    send_request_if_no_results: true", "    query_text: SELECT 1");
        let engine = Engine::new(
            FakeQuery::rows(Vec::new()),
            config.alerts.clone(),
            Arc::new(StateStore::new(dir.path().join("state.json"))),
        );

        engine.execute(&config.jobs[0]).await.unwrap();
        assert_eq!(*bodies.lock().unwrap(), vec!["[]".to_string()]);
    }

    #[tokio::test]
    async fn test_rows_are_delivered_from_query_file() {
        let dir = tempdir().unwrap();
        let query_file = dir.path().join("orders.sql");
        std::fs::write(&query_file, "SELECT * FROM orders WHERE day = '{UtcNow|yyyy}'").unwrap();

        let (url, bodies) = counting_server().await;
        let config = config(
            &url,
            "    payload_size: 10",
            &format!("    payload_format: json_lines\n    query_file: {}", query_file.display()),
        );
        let fake = FakeQuery::rows(vec![row(1), row(2)]);
        let engine = Engine::new(
            fake.clone(),
            config.alerts.clone(),
            Arc::new(StateStore::new(dir.path().join("state.json"))),
        );

        engine.execute(&config.jobs[0]).await.unwrap();

        let year = Utc::now().format("%Y").to_string();
        assert_eq!(fake.texts(), vec![format!("SELECT * FROM orders WHERE day = '{}'", year)]);
        assert_eq!(*bodies.lock().unwrap(), vec!["{\"id\":1}\n{\"id\":2}".to_string()]);
    }

    #[tokio::test]
    async fn test_alert_carries_resolved_query() {
        let dir = tempdir().unwrap();
        let (url, bodies) = counting_server().await;
        let config = config(
            &url,
            "    retry_attempts: 0",
            "    on_failure: slack_alert\n    query_text: SELECT * FROM t WHERE d > '{LastRun|yyyy}'",
        );
        let state = Arc::new(StateStore::new(dir.path().join("state.json")));
        let engine = Engine::new(
            FakeQuery::failing("no such table: t", 1),
            config.alerts.clone(),
            state.clone(),
        );

        let outcome = engine.execute(&config.jobs[0]).await.unwrap();
        assert_eq!(outcome, Outcome::Failed { attempts: 1 });

        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let payload: Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(
            payload["blocks"][2]["text"]["text"],
            "*Query:*\n```sql\nSELECT * FROM t WHERE d > ''\n```"
        );
        assert!(state
            .last_alert("orders", crate::alerts::AlertChannel::Slack)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_halt_policy_propagates() {
        let dir = tempdir().unwrap();
        let config = config(
            "http://127.0.0.1:9/",
            "    retry_attempts: 0",
            "    on_failure: halt\n    query_text: SELECT 1",
        );
        let engine = Engine::new(
            FakeQuery::failing("no such column: x", 1),
            config.alerts.clone(),
            Arc::new(StateStore::new(dir.path().join("state.json"))),
        );

        let error = engine.execute(&config.jobs[0]).await.unwrap_err();
        assert!(format!("{:#}", error).contains("no such column: x"));
    }
}
