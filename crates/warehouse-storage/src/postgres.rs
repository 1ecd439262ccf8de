//! Postgres implementation of [`Store`].
//!
//! Rows travel as JSON in both directions: writes bind a single `jsonb` value
//! and let `jsonb_populate_record` coerce it into the table's column types,
//! reads return `to_jsonb(row)`. Table and column names only ever come from
//! static entity descriptors and are quoted before use.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};
use warehouse_core::{history_snapshot, EntityDescriptor, Record};

use crate::{
    connect, prepare_insert, prepare_update, quote_ident, Store, StoreConfig, StoreError,
    StoreResult,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        Ok(Self::new(connect(config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // Commits on Ok, rolls back on Err. A dropped transaction is rolled back by sqlx.
    pub async fn transaction<T, F>(&self, block: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<T>> + Send,
    {
        let mut tx = self.pool.begin().await?;
        match block(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn query(&self, table: &str, conditions: &Record) -> StoreResult<Vec<Record>> {
        let mut conn = self.pool.acquire().await?;
        query_rows(&mut conn, table, conditions).await
    }

    async fn find(&self, table: &str, id: i64) -> StoreResult<Option<Record>> {
        let mut conn = self.pool.acquire().await?;
        find_row(&mut conn, table, id, false).await
    }

    async fn insert(&self, entity: &EntityDescriptor, record: &Record) -> StoreResult<i64> {
        let row = prepare_insert(entity, record, Utc::now());
        let mut conn = self.pool.acquire().await?;
        let id = insert_row(&mut conn, entity.table, row).await?;
        debug!(table = entity.table, id, "inserted row");
        Ok(id)
    }

    async fn update(
        &self,
        entity: &EntityDescriptor,
        id: i64,
        record: &Record,
    ) -> StoreResult<u64> {
        let entity = *entity;
        let row = prepare_update(&entity, record, Utc::now());
        let affected = self
            .transaction(move |conn| {
                Box::pin(async move {
                    record_history(conn, &entity, id).await?;
                    update_row(conn, entity.table, id, row).await
                })
            })
            .await?;
        debug!(table = entity.table, id, affected, "updated row");
        Ok(affected)
    }

    async fn delete(&self, table: &str, id: i64) -> StoreResult<u64> {
        let sql = delete_sql(table);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// Locks the parent row until the caller's transaction ends.
pub(crate) async fn record_history(
    conn: &mut PgConnection,
    entity: &EntityDescriptor,
    id: i64,
) -> StoreResult<bool> {
    let Some(history) = entity.history else {
        return Ok(false);
    };
    let Some(current) = find_row(conn, entity.table, id, true).await? else {
        debug!(table = entity.table, id, "no row to snapshot");
        return Ok(false);
    };

    let snapshot = history_snapshot(&history, id, &current);
    let history_id = insert_row(conn, history.table, snapshot).await?;
    debug!(
        table = history.table,
        parent_id = id,
        history_id,
        "captured pre-update snapshot"
    );
    Ok(true)
}

async fn query_rows(
    conn: &mut PgConnection,
    table: &str,
    conditions: &Record,
) -> StoreResult<Vec<Record>> {
    let columns: Vec<&str> = conditions.keys().map(String::as_str).collect();
    let sql = select_sql(table, &columns);
    let mut query = sqlx::query(&sql);
    if !columns.is_empty() {
        query = query.bind(Value::Object(conditions.clone()));
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(decode_row).collect()
}

async fn find_row(
    conn: &mut PgConnection,
    table: &str,
    id: i64,
    for_update: bool,
) -> StoreResult<Option<Record>> {
    let sql = find_sql(table, for_update);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(decode_row).transpose()
}

async fn insert_row(conn: &mut PgConnection, table: &str, row: Record) -> StoreResult<i64> {
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let sql = insert_sql(table, &columns);
    let id: i64 = sqlx::query_scalar(&sql)
        .bind(Value::Object(row))
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

async fn update_row(
    conn: &mut PgConnection,
    table: &str,
    id: i64,
    row: Record,
) -> StoreResult<u64> {
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    let sql = update_sql(table, &columns);
    let result = sqlx::query(&sql)
        .bind(Value::Object(row))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn decode_row(row: &PgRow) -> StoreResult<Record> {
    match row.try_get::<Value, _>("data")? {
        Value::Object(fields) => Ok(fields),
        other => Err(StoreError::Persistence(format!(
            "expected a JSON object row, got {other}"
        ))),
    }
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

// `$1` is a jsonb object holding the condition values. `IS NOT DISTINCT FROM`
// lets a JSON null match a NULL column.
fn select_sql(table: &str, columns: &[&str]) -> String {
    let table = quote_ident(table);
    if columns.is_empty() {
        return format!(r#"SELECT to_jsonb(t) AS data FROM {table} AS t ORDER BY t."id""#);
    }
    let predicates = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("t.{c} IS NOT DISTINCT FROM c.{c}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        r#"SELECT to_jsonb(t) AS data FROM {table} AS t, jsonb_populate_record(NULL::{table}, $1) AS c WHERE {predicates} ORDER BY t."id""#
    )
}

fn find_sql(table: &str, for_update: bool) -> String {
    let table = quote_ident(table);
    let lock = if for_update { " FOR UPDATE" } else { "" };
    format!(r#"SELECT to_jsonb(t) AS data FROM {table} AS t WHERE t."id" = $1{lock}"#)
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let table = quote_ident(table);
    if columns.is_empty() {
        return format!(r#"INSERT INTO {table} DEFAULT VALUES RETURNING "id""#);
    }
    let cols = column_list(columns);
    format!(
        r#"INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{table}, $1) RETURNING "id""#
    )
}

// Callers always pass at least `updated_at`.
fn update_sql(table: &str, columns: &[&str]) -> String {
    let table = quote_ident(table);
    let assignments = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("{c} = r.{c}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"UPDATE {table} AS t SET {assignments} FROM jsonb_populate_record(NULL::{table}, $1) AS r WHERE t."id" = $2"#
    )
}

fn delete_sql(table: &str) -> String {
    format!(r#"DELETE FROM {} WHERE "id" = $1"#, quote_ident(table))
}
