use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::Instant;
use tokio::time::sleep;

use crate::config::{Endpoint, PayloadFormat};
use crate::query::Row;
use crate::utils::format_duration;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

impl DeliveryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "HttpStatusError",
            Self::Request(e) if e.is_timeout() => "HttpTimeout",
            Self::Request(_) => "HttpRequestError",
            Self::InvalidHeader(_) => "InvalidHeader",
        }
    }
}

/// Splits rows into request-sized chunks, keeping their order.
/// An empty result still yields one empty chunk so the endpoint can be told
/// there was nothing to report.
pub fn chunk_rows(rows: &[Row], payload_size: Option<usize>) -> Vec<&[Row]> {
    match payload_size {
        _ if rows.is_empty() => vec![rows],
        Some(size) if size > 0 => rows.chunks(size).collect(),
        _ => vec![rows],
    }
}

pub fn format_payload(rows: &[Row], format: PayloadFormat) -> Result<String> {
    let body = match format {
        PayloadFormat::JsonArray => serde_json::to_string(rows)?,
        PayloadFormat::JsonLines => rows
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n"),
    };
    Ok(body)
}

fn build_headers(endpoint: &Endpoint) -> Result<HeaderMap, DeliveryError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (key, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|_| DeliveryError::InvalidHeader(key.clone()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| DeliveryError::InvalidHeader(key.clone()))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Pushes query results to HTTP endpoints
pub struct Delivery {
    client: Client,
}

impl Default for Delivery {
    fn default() -> Self {
        Self::new()
    }
}

impl Delivery {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub async fn send(&self, endpoint: &Endpoint, rows: &[Row], format: PayloadFormat) -> Result<()> {
        let headers = build_headers(endpoint)?;
        let chunks = chunk_rows(rows, endpoint.payload_size);
        let count = chunks.len();

        info!(
            "Sending {} rows to endpoint '{}' ({} {}) in {} chunks, payload format: {:?}",
            rows.len(),
            endpoint.name,
            endpoint.method,
            endpoint.url,
            count,
            format
        );

        for (i, chunk) in chunks.into_iter().enumerate() {
            let body = format_payload(chunk, format).context("Failed to serialize payload")?;
            self.send_chunk(endpoint, &headers, body, i + 1, count)
                .await
                .with_context(|| {
                    format!("Endpoint '{}' rejected chunk {}/{}", endpoint.name, i + 1, count)
                })?;

            if i + 1 < count && !endpoint.request_delay.is_zero() {
                debug!(
                    "Waiting {} before next request",
                    format_duration(endpoint.request_delay)
                );
                sleep(endpoint.request_delay).await;
            }
        }

        info!("Completed sending {} chunks to endpoint '{}'", count, endpoint.name);
        Ok(())
    }

    async fn send_chunk(
        &self,
        endpoint: &Endpoint,
        headers: &HeaderMap,
        body: String,
        index: usize,
        count: usize,
    ) -> Result<(), DeliveryError> {
        let policy = &endpoint.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "Sending chunk {}/{} to {} (attempt {})",
                index, count, endpoint.url, attempt
            );

            let start = Instant::now();
            let result = self.request(endpoint, headers, body.clone()).await;

            let e = match result {
                Ok(status) => {
                    info!(
                        "HTTP request successful: {} in {} (chunk {}/{}, attempt {})",
                        status,
                        format_duration(start.elapsed()),
                        index,
                        count,
                        attempt
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt >= policy.max_attempts() {
                error!(
                    "HTTP request failed for chunk {}/{} on final attempt {}/{}: {}",
                    index,
                    count,
                    attempt,
                    policy.max_attempts(),
                    e
                );
                return Err(e);
            }

            let delay = policy.delay(attempt);
            warn!(
                "HTTP request failed for chunk {}/{} on attempt {}/{}: {}. Retrying in {}",
                index,
                count,
                attempt,
                policy.max_attempts(),
                e,
                format_duration(delay)
            );
            sleep(delay).await;
        }
    }

    async fn request(
        &self,
        endpoint: &Endpoint,
        headers: &HeaderMap,
        body: String,
    ) -> Result<StatusCode, DeliveryError> {
        let response = self
            .client
            .request(endpoint.method.clone(), endpoint.url.clone())
            .headers(headers.clone())
            .timeout(endpoint.request_timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(status)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Status { status, body })
        }
    }
}
