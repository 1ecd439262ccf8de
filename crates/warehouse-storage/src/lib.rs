//! Relational store access for warehouse ingestion: connection pooling, the
//! generic CRUD surface, and pre-update history capture.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;
use warehouse_core::{
    whitelist, EntityDescriptor, Record, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN,
};

mod memory;
mod postgres;

pub use memory::{FailOn, MemoryStore, StoreCall};
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("{0}")]
    Persistence(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) => StoreError::Persistence(db.message().to_string()),
            None => StoreError::Persistence(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("WAREHOUSE_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("WAREHOUSE_DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_port),
            database: std::env::var("WAREHOUSE_DB_NAME")
                .unwrap_or_else(|_| "warehouse".to_string()),
            user: std::env::var("WAREHOUSE_DB_USER").unwrap_or_else(|_| "warehouse".to_string()),
            password: std::env::var("WAREHOUSE_DB_PASSWORD").unwrap_or_default(),
            max_connections: std::env::var("WAREHOUSE_DB_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_connections),
            acquire_timeout_secs: std::env::var("WAREHOUSE_DB_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_acquire_timeout_secs),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

/// Opens a connection pool. Any failure here is reported as
/// [`StoreError::ConnectionUnavailable`].
pub async fn connect(config: &StoreConfig) -> StoreResult<PgPool> {
    info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        "connecting to warehouse store"
    );

    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .password(&config.password);

    PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout())
        .connect_with(options)
        .await
        .map_err(|err| StoreError::ConnectionUnavailable(err.to_string()))
}

pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn query(&self, table: &str, conditions: &Record) -> StoreResult<Vec<Record>>;

    async fn find(&self, table: &str, id: i64) -> StoreResult<Option<Record>>;

    async fn insert(&self, entity: &EntityDescriptor, record: &Record) -> StoreResult<i64>;

    async fn update(&self, entity: &EntityDescriptor, id: i64, record: &Record)
        -> StoreResult<u64>;

    async fn delete(&self, table: &str, id: i64) -> StoreResult<u64>;
}

fn timestamp(now: DateTime<Utc>) -> Value {
    Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true))
}

pub fn prepare_insert(entity: &EntityDescriptor, record: &Record, now: DateTime<Utc>) -> Record {
    let mut row = whitelist(record, entity.attributes);
    row.remove(ID_COLUMN);
    row.insert(CREATED_AT_COLUMN.to_string(), timestamp(now));
    row.insert(UPDATED_AT_COLUMN.to_string(), timestamp(now));
    row
}

pub fn prepare_update(entity: &EntityDescriptor, record: &Record, now: DateTime<Utc>) -> Record {
    let mut row = whitelist(record, entity.attributes);
    row.remove(ID_COLUMN);
    row.remove(CREATED_AT_COLUMN);
    row.insert(UPDATED_AT_COLUMN.to_string(), timestamp(now));
    row
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::io::Write;
    use warehouse_core::PROJECT;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().expect("ts")
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn insert_rows_are_whitelisted_and_stamped() {
        let input = record(json!({
            "id": 99,
            "externalProjectId": "proj-1",
            "name": "Warehouse",
            "created_at": "1999-01-01T00:00:00Z",
            "secret": "nope",
        }));
        let row = prepare_insert(&PROJECT, &input, fixed_now());
        assert_eq!(
            Value::Object(row),
            json!({
                "external_project_id": "proj-1",
                "name": "Warehouse",
                "created_at": "2026-03-01T09:30:00.000000Z",
                "updated_at": "2026-03-01T09:30:00.000000Z",
            })
        );
    }

    #[test]
    fn update_rows_keep_created_at_untouched() {
        let input = record(json!({
            "id": 99,
            "external_project_id": "proj-1",
            "status": "active",
            "created_at": "1999-01-01T00:00:00Z",
        }));
        let row = prepare_update(&PROJECT, &input, fixed_now());
        assert!(!row.contains_key("id"));
        assert!(!row.contains_key("created_at"));
        assert_eq!(row["status"], json!("active"));
        assert_eq!(row["updated_at"], json!("2026-03-01T09:30:00.000000Z"));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("projects"), "\"projects\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn driver_errors_without_a_server_message_keep_their_text() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.to_string(), sqlx::Error::RowNotFound.to_string());
        assert!(matches!(err, StoreError::Persistence(_)));
    }

    #[test]
    fn store_config_loads_from_yaml_with_pool_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "host: db.internal\ndatabase: warehouse\nuser: ingest\npassword: hunter2"
        )
        .expect("write");

        let config = StoreConfig::from_yaml_file(file.path()).expect("load");
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5432);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(10));

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("db.internal"));
    }

    #[test]
    fn store_config_reports_unreadable_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = StoreConfig::from_yaml_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }

    #[test]
    fn persistence_errors_keep_the_driver_message() {
        let err = StoreError::Persistence("duplicate key value violates unique constraint".into());
        assert_eq!(err.to_string(), "duplicate key value violates unique constraint");
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Persistence(_)));
        let err = StoreError::ConnectionUnavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
