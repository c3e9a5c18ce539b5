use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, info};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{DataSource, DatabaseConfig};
use crate::utils::format_duration;

/// One result row, field order follows the source column order
pub type Row = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
    #[error("Data source '{0}' not found")]
    UnknownSource(String),
    #[error(transparent)]
    Database(#[from] libsql::Error),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "QueryTimeout",
            Self::UnknownSource(_) => "UnknownDataSource",
            Self::Database(_) => "DatabaseError",
        }
    }
}

/// Runs query text against a named data source
#[async_trait]
pub trait QueryAccess: Send + Sync {
    async fn run_query(
        &self,
        source: &str,
        query: &str,
        timeout: Duration,
        max_rows: Option<usize>,
    ) -> Result<Vec<Row>>;
}

/// Data sources backed by local SQLite files or remote libSQL servers
pub struct LibsqlQueryAccess {
    databases: HashMap<String, libsql::Database>,
}

impl LibsqlQueryAccess {
    pub async fn open(configs: &[DatabaseConfig]) -> Result<Self> {
        let mut databases = HashMap::with_capacity(configs.len());

        for config in configs {
            let database = match &config.source {
                DataSource::Local(path) => libsql::Builder::new_local(path).build().await,
                DataSource::Remote { url, auth_token } => {
                    libsql::Builder::new_remote(url.clone(), auth_token.clone())
                        .build()
                        .await
                }
            }
            .with_context(|| format!("Failed to open database '{}'", config.name))?;

            debug!("Opened database '{}' ({:?})", config.name, config.source);
            databases.insert(config.name.clone(), database);
        }

        Ok(Self { databases })
    }

    async fn read_rows(
        database: &libsql::Database,
        query: &str,
        max_rows: Option<usize>,
    ) -> Result<Vec<Row>, QueryError> {
        let connection = database.connect()?;
        let mut rows = connection.query(query, ()).await?;

        let columns: Vec<String> = (0..rows.column_count())
            .map(|i| {
                rows.column_name(i)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Column{}", i))
            })
            .collect();

        let limit = max_rows.unwrap_or(usize::MAX);
        let mut result = Vec::new();

        while result.len() < limit {
            let Some(row) = rows.next().await? else {
                break;
            };

            let mut record = Map::with_capacity(columns.len());
            for (i, name) in columns.iter().enumerate() {
                let value = row.get_value(i as i32)?;
                record.insert(name.clone(), to_json(value));
            }
            result.push(record);
        }

        Ok(result)
    }
}

#[async_trait]
impl QueryAccess for LibsqlQueryAccess {
    async fn run_query(
        &self,
        source: &str,
        query: &str,
        timeout: Duration,
        max_rows: Option<usize>,
    ) -> Result<Vec<Row>> {
        let database = self
            .databases
            .get(source)
            .ok_or_else(|| QueryError::UnknownSource(source.to_string()))?;

        info!(
            "Executing query on database '{}' (timeout: {}, max rows: {})",
            source,
            format_duration(timeout),
            max_rows.map_or("unbounded".to_string(), |n| n.to_string())
        );

        let start = Instant::now();
        let rows = tokio::time::timeout(timeout, Self::read_rows(database, query, max_rows))
            .await
            .map_err(|_| QueryError::Timeout(timeout))??;

        info!(
            "Query returned {} rows in {}",
            rows.len(),
            format_duration(start.elapsed())
        );

        Ok(rows)
    }
}

fn to_json(value: libsql::Value) -> Value {
    match value {
        libsql::Value::Null => Value::Null,
        libsql::Value::Integer(i) => Value::from(i),
        libsql::Value::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        libsql::Value::Text(s) => Value::String(s),
        libsql::Value::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}
