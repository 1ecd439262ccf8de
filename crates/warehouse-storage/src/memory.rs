//! In-process [`Store`] used for dry runs and tests.
//!
//! Mirrors the Postgres semantics that matter to reconciliation (whitelisting,
//! timestamps, history-before-update under one lock) and records every call so
//! callers can assert on exactly which store operations happened.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use warehouse_core::{history_snapshot, EntityDescriptor, Record, ID_COLUMN};

use crate::{prepare_insert, prepare_update, Store, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Query { table: String, conditions: Record },
    Find { table: String, id: i64 },
    Insert { table: String, record: Record },
    Update { table: String, id: i64, record: Record },
    Delete { table: String, id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Query,
    Insert,
    Update,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: FailOn,
    table: String,
    message: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<i64, Record>>,
    next_ids: HashMap<String, i64>,
    calls: Vec<StoreCall>,
    failures: Vec<InjectedFailure>,
}

impl MemoryState {
    fn check(&self, op: FailOn, table: &str) -> StoreResult<()> {
        match self
            .failures
            .iter()
            .find(|f| f.op == op && f.table == table)
        {
            Some(failure) => Err(StoreError::Persistence(failure.message.clone())),
            None => Ok(()),
        }
    }

    fn put(&mut self, table: &str, mut row: Record) -> i64 {
        let next = self.next_ids.entry(table.to_string()).or_insert(1);
        let id = match row.get(ID_COLUMN).and_then(Value::as_i64) {
            Some(id) => id,
            None => *next,
        };
        *next = (*next).max(id + 1);
        row.insert(ID_COLUMN.to_string(), Value::from(id));
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row);
        id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a row directly, keeping its `id` when present. Not recorded as a call.
    pub async fn seed(&self, table: &str, row: Record) -> i64 {
        self.state.lock().await.put(table, row)
    }

    pub async fn rows(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn fail_on(&self, op: FailOn, table: &str, message: impl Into<String>) {
        self.state.lock().await.failures.push(InjectedFailure {
            op,
            table: table.to_string(),
            message: message.into(),
        });
    }
}

fn row_matches(row: &Record, conditions: &Record) -> bool {
    conditions
        .iter()
        .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
}

#[async_trait]
impl Store for MemoryStore {
    async fn query(&self, table: &str, conditions: &Record) -> StoreResult<Vec<Record>> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Query {
            table: table.to_string(),
            conditions: conditions.clone(),
        });
        state.check(FailOn::Query, table)?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row_matches(row, conditions))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find(&self, table: &str, id: i64) -> StoreResult<Option<Record>> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Find {
            table: table.to_string(),
            id,
        });
        Ok(state.tables.get(table).and_then(|rows| rows.get(&id)).cloned())
    }

    async fn insert(&self, entity: &EntityDescriptor, record: &Record) -> StoreResult<i64> {
        let row = prepare_insert(entity, record, Utc::now());
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Insert {
            table: entity.table.to_string(),
            record: row.clone(),
        });
        state.check(FailOn::Insert, entity.table)?;
        Ok(state.put(entity.table, row))
    }

    async fn update(
        &self,
        entity: &EntityDescriptor,
        id: i64,
        record: &Record,
    ) -> StoreResult<u64> {
        let changes = prepare_update(entity, record, Utc::now());
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Update {
            table: entity.table.to_string(),
            id,
            record: changes.clone(),
        });
        state.check(FailOn::Update, entity.table)?;

        let Some(current) = state
            .tables
            .get(entity.table)
            .and_then(|rows| rows.get(&id))
            .cloned()
        else {
            return Ok(0);
        };

        if let Some(history) = entity.history {
            state.put(history.table, history_snapshot(&history, id, &current));
        }

        let mut updated = current;
        updated.extend(changes);
        state.put(entity.table, updated);
        Ok(1)
    }

    async fn delete(&self, table: &str, id: i64) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Delete {
            table: table.to_string(),
            id,
        });
        let removed = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(&id))
            .is_some();
        Ok(u64::from(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warehouse_core::{PERSON, PROJECT};

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids_and_timestamps() {
        let store = MemoryStore::new();
        let first = store
            .insert(&PROJECT, &record(json!({"external_project_id": "a"})))
            .await
            .expect("insert");
        let second = store
            .insert(&PROJECT, &record(json!({"external_project_id": "b"})))
            .await
            .expect("insert");
        assert_eq!((first, second), (1, 2));

        let rows = store.rows("projects").await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains_key("created_at"));
        assert!(rows[0].contains_key("updated_at"));
    }

    #[tokio::test]
    async fn query_matches_equality_and_null() {
        let store = MemoryStore::new();
        store
            .seed("persons", record(json!({"id": 4, "email": null, "full_name": "Ada"})))
            .await;
        store
            .seed("persons", record(json!({"id": 7, "email": "g@x.io", "full_name": "Grace"})))
            .await;

        let all = store.query("persons", &Record::new()).await.expect("query");
        assert_eq!(all.len(), 2);

        let nulls = store
            .query("persons", &record(json!({"email": null})))
            .await
            .expect("query");
        assert_eq!(nulls.len(), 1);
        assert_eq!(nulls[0]["full_name"], json!("Ada"));

        let inserted = store
            .insert(&PERSON, &record(json!({"external_person_id": "p-1"})))
            .await
            .expect("insert");
        assert_eq!(inserted, 8);
    }

    #[tokio::test]
    async fn update_snapshots_prior_state_before_applying() {
        let store = MemoryStore::new();
        store
            .seed(
                "projects",
                record(json!({
                    "id": 10,
                    "external_project_id": "proj-1",
                    "name": "Before",
                    "created_at": "2026-01-01T00:00:00Z",
                    "updated_at": "2026-01-01T00:00:00Z",
                })),
            )
            .await;

        let affected = store
            .update(&PROJECT, 10, &record(json!({"name": "After", "id": 999})))
            .await
            .expect("update");
        assert_eq!(affected, 1);

        let history = store.rows("projects_history").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["project_id"], json!(10));
        assert_eq!(history[0]["name"], json!("Before"));
        assert_eq!(history[0]["updated_at"], json!("2026-01-01T00:00:00Z"));

        let current = store.find("projects", 10).await.expect("find").expect("row");
        assert_eq!(current["name"], json!("After"));
        assert_eq!(current["id"], json!(10));
        assert_eq!(current["created_at"], json!("2026-01-01T00:00:00Z"));
        assert_ne!(current["updated_at"], json!("2026-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn update_of_missing_row_writes_nothing() {
        let store = MemoryStore::new();
        let affected = store
            .update(&PROJECT, 3, &record(json!({"name": "ghost"})))
            .await
            .expect("update");
        assert_eq!(affected, 0);
        assert!(store.rows("projects_history").await.is_empty());
        assert!(store.rows("projects").await.is_empty());
    }

    #[tokio::test]
    async fn entities_without_history_never_write_snapshots() {
        let store = MemoryStore::new();
        store
            .seed("persons", record(json!({"id": 1, "full_name": "Ada"})))
            .await;
        store
            .update(&PERSON, 1, &record(json!({"full_name": "Ada L."})))
            .await
            .expect("update");
        assert_eq!(store.rows("persons").await[0]["full_name"], json!("Ada L."));
        assert!(store.rows("persons_history").await.is_empty());
    }

    #[tokio::test]
    async fn injected_update_failure_leaves_no_snapshot() {
        let store = MemoryStore::new();
        store
            .seed("projects", record(json!({"id": 1, "name": "Before"})))
            .await;
        store.fail_on(FailOn::Update, "projects", "deadlock detected").await;

        let err = store
            .update(&PROJECT, 1, &record(json!({"name": "After"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "deadlock detected");
        assert!(store.rows("projects_history").await.is_empty());
        assert_eq!(store.rows("projects").await[0]["name"], json!("Before"));
    }

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let store = MemoryStore::new();
        let id = store
            .insert(&PROJECT, &record(json!({"external_project_id": "x", "bogus": 1})))
            .await
            .expect("insert");
        store.find("projects", id).await.expect("find");
        store.delete("projects", id).await.expect("delete");
        assert_eq!(store.delete("projects", id).await.expect("delete"), 0);

        let calls = store.calls().await;
        assert_eq!(calls.len(), 4);
        match &calls[0] {
            StoreCall::Insert { table, record } => {
                assert_eq!(table, "projects");
                assert!(!record.contains_key("bogus"));
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(
            calls[1],
            StoreCall::Find {
                table: "projects".into(),
                id
            }
        );

        store.clear_calls().await;
        assert!(store.calls().await.is_empty());
    }
}
