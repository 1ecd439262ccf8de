//! Batch reconciliation: turns upstream batches into inserts and updates
//! against the warehouse store, resolving foreign keys on the way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use warehouse_core::{
    normalize_keys, Batch, BatchEnvelope, EntityDescriptor, EntityKind, ExecuteResult, Record,
    RelationDescriptor, ID_COLUMN,
};
use warehouse_storage::{MemoryStore, PgStore, Store, StoreConfig, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub store: StoreConfig,
    pub store_config_path: Option<PathBuf>,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        match std::env::var("WAREHOUSE_STORE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path),
            _ => Ok(Self {
                store: StoreConfig::from_env(),
                store_config_path: None,
            }),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Ok(Self {
            store: StoreConfig::from_yaml_file(&path)?,
            store_config_path: Some(path),
        })
    }

    pub async fn connect_store(&self) -> StoreResult<PgStore> {
        match &self.store_config_path {
            Some(path) => info!(path = %path.display(), "using store settings from file"),
            None => debug!("using store settings from environment"),
        }
        PgStore::connect(&self.store).await
    }
}

pub async fn resolve_relations(
    store: &dyn Store,
    mut record: Record,
    relations: &[RelationDescriptor],
) -> StoreResult<Record> {
    for relation in relations {
        let Some(external) = record.remove(relation.external_key) else {
            continue;
        };

        let resolved = if external.is_null() {
            Value::Null
        } else {
            let mut conditions = Record::new();
            conditions.insert(
                relation.resolver.external_id_field.to_string(),
                external.clone(),
            );
            let rows = store.query(relation.resolver.table, &conditions).await?;
            match rows.first().and_then(|row| row.get(ID_COLUMN)) {
                Some(id) => id.clone(),
                None => {
                    debug!(
                        table = relation.resolver.table,
                        external = %external,
                        "relation target not synced yet; storing null foreign key"
                    );
                    Value::Null
                }
            }
        };

        record.insert(relation.internal_key.to_string(), resolved);
    }
    Ok(record)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Inserted { id: i64, external_id: Value },
    Updated { id: i64, external_id: Value },
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub last_external_id: Option<Value>,
}

impl BatchSummary {
    pub fn processed(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted { external_id, .. } => {
                self.inserted += 1;
                self.last_external_id = Some(external_id);
            }
            RecordOutcome::Updated { external_id, .. } => {
                self.updated += 1;
                self.last_external_id = Some(external_id);
            }
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn execute(&self, batch: &Batch) -> ExecuteResult {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "reconcile_batch",
            %run_id,
            entity_type = %batch.entity_type,
            records = batch.content.len()
        );

        async {
            match self.reconcile_batch(batch).await {
                Ok(summary) => ExecuteResult::Success {
                    processed: summary.processed(),
                },
                Err(err) => ExecuteResult::Error {
                    message: err.to_string(),
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile_batch(&self, batch: &Batch) -> Result<BatchSummary, StoreError> {
        let mut summary = BatchSummary::default();

        if batch.content.is_empty() {
            debug!("empty batch");
            return Ok(summary);
        }
        let Some(kind) = EntityKind::from_tag(&batch.entity_type) else {
            info!("no handler registered for batch type; ignoring");
            return Ok(summary);
        };
        let entity = kind.descriptor();

        for (index, raw) in batch.content.iter().enumerate() {
            match self.reconcile_record(entity, raw).await {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    warn!(
                        index,
                        error = %err,
                        processed = summary.processed(),
                        last_external_id = ?summary.last_external_id,
                        "store failure; aborting remaining records"
                    );
                    return Err(err);
                }
            }
        }

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "batch reconciled"
        );
        Ok(summary)
    }

    pub async fn reconcile_record(
        &self,
        entity: &EntityDescriptor,
        raw: &Value,
    ) -> StoreResult<RecordOutcome> {
        let Some(fields) = raw.as_object() else {
            debug!("skipping non-object record");
            return Ok(RecordOutcome::Skipped);
        };
        let record = normalize_keys(fields);
        let Some(external_id) = entity.external_id(&record).cloned() else {
            debug!(
                field = entity.external_id_field,
                "skipping record without external id"
            );
            return Ok(RecordOutcome::Skipped);
        };

        let record = resolve_relations(self.store.as_ref(), record, entity.relations).await?;

        let mut conditions = Record::new();
        conditions.insert(entity.external_id_field.to_string(), external_id.clone());
        let existing = self.store.query(entity.table, &conditions).await?;
        if existing.len() > 1 {
            warn!(
                table = entity.table,
                external_id = %external_id,
                matches = existing.len(),
                "external id is not unique; updating the oldest row"
            );
        }

        match existing.first() {
            None => {
                let id = self.store.insert(entity, &record).await?;
                debug!(id, external_id = %external_id, "inserted");
                Ok(RecordOutcome::Inserted { id, external_id })
            }
            Some(row) => {
                let id = row.get(ID_COLUMN).and_then(Value::as_i64).ok_or_else(|| {
                    StoreError::Persistence(format!(
                        "row in {} matching {} has no integer id",
                        entity.table, external_id
                    ))
                })?;
                let affected = self.store.update(entity, id, &record).await?;
                if affected == 0 {
                    warn!(id, "row disappeared before update");
                }
                debug!(id, external_id = %external_id, "updated");
                Ok(RecordOutcome::Updated { id, external_id })
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchPayload {
    Envelope(BatchEnvelope),
    Bare(Batch),
}

/// Reads a batch from disk, accepting both `{"data": {...}}` and a bare `{"type", "content"}`.
pub async fn load_batch_file(path: impl AsRef<Path>) -> Result<Batch> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let payload: BatchPayload =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match payload {
        BatchPayload::Envelope(envelope) => envelope.data,
        BatchPayload::Bare(batch) => batch,
    })
}

pub async fn run_ingest_once_from_env(
    path: impl AsRef<Path>,
    dry_run: bool,
) -> Result<ExecuteResult> {
    let batch = load_batch_file(path).await?;

    let store: Arc<dyn Store> = if dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let config = IngestConfig::from_env()?;
        match config.connect_store().await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, "store unavailable");
                return Ok(ExecuteResult::Error {
                    message: err.to_string(),
                });
            }
        }
    };

    Ok(Reconciler::new(store).execute(&batch).await)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = IngestConfig::from_env()?;
    let store = config.connect_store().await?;
    warehouse_storage::migrate(store.pool())
        .await
        .context("running migrations")?;
    info!("migrations applied");
    Ok(())
}
