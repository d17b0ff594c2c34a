use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdc_core::{CanonicalRecord, EntityKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::{sha256_hex, write_file_atomic};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch for {expected} contained a {found} record")]
    KindMismatch { expected: EntityKind, found: EntityKind },
    #[error("value out of range for column {column}")]
    OutOfRange { column: &'static str },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One row of the collection log: what a cycle did and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLogEntry {
    pub task_name: String,
    pub status: String,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

impl CycleLogEntry {
    pub fn new(
        task_name: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            status: status.into(),
            message: message.into(),
            logged_at: Utc::now(),
        }
    }
}

/// Durable sink for normalized batches. Writes must be idempotent on each
/// record's upsert key.
#[async_trait]
pub trait BatchStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist one batch of a single entity kind, returning rows written.
    async fn store_batch(
        &self,
        kind: EntityKind,
        records: &[CanonicalRecord],
    ) -> Result<usize, StoreError>;

    async fn log_cycle(&self, _entry: &CycleLogEntry) -> Result<(), StoreError> {
        Ok(())
    }
}

pub(crate) fn ensure_kind(kind: EntityKind, records: &[CanonicalRecord]) -> Result<(), StoreError> {
    match records.iter().find(|r| r.kind() != kind) {
        Some(other) => Err(StoreError::KindMismatch {
            expected: kind,
            found: other.kind(),
        }),
        None => Ok(()),
    }
}

/// Writes each batch as a JSON-lines file under `<root>/<kind>/<YYYYMMDD>/`.
///
/// File names carry the content hash, so replaying an identical batch is a no-op.
#[derive(Debug, Clone)]
pub struct JsonlBatchStore {
    root: PathBuf,
}

impl JsonlBatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("collection_logs.jsonl")
    }
}

#[async_trait]
impl BatchStore for JsonlBatchStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn store_batch(
        &self,
        kind: EntityKind,
        records: &[CanonicalRecord],
    ) -> Result<usize, StoreError> {
        ensure_kind(kind, records)?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }

        let hash = sha256_hex(&body);
        let path = self
            .root
            .join(kind.as_str())
            .join(Utc::now().format("%Y%m%d").to_string())
            .join(format!("{kind}_{}.jsonl", &hash[..16]));

        let created = write_file_atomic(&path, &body, false).await?;
        info!(path = %path.display(), rows = records.len(), created, "wrote jsonl batch");
        Ok(if created { records.len() } else { 0 })
    }

    async fn log_cycle(&self, entry: &CycleLogEntry) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-process store keyed by upsert key. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    records: Mutex<BTreeMap<String, CanonicalRecord>>,
    logs: Mutex<Vec<CycleLogEntry>>,
    fail_writes: bool,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every write fails, for exercising persistence errors.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub async fn records(&self) -> Vec<CanonicalRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn logs(&self) -> Vec<CycleLogEntry> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store_batch(
        &self,
        kind: EntityKind,
        records: &[CanonicalRecord],
    ) -> Result<usize, StoreError> {
        ensure_kind(kind, records)?;
        if self.fail_writes {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory store configured to fail",
            )));
        }
        let mut map = self.records.lock().await;
        for record in records {
            map.insert(record.upsert_key(), record.clone());
        }
        Ok(records.len())
    }

    async fn log_cycle(&self, entry: &CycleLogEntry) -> Result<(), StoreError> {
        self.logs.lock().await.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mdc_core::{Market, QuoteRecord};
    use tempfile::tempdir;

    fn quote(symbol: &str, price: f64) -> CanonicalRecord {
        CanonicalRecord::Quote(QuoteRecord {
            symbol: symbol.into(),
            market: Market::from_symbol(symbol),
            name: None,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).single().unwrap(),
            last_price: price,
            change_amount: None,
            change_percent: None,
            volume: Some(1_200),
            turnover: None,
            source_id: "eastmoney".into(),
        })
    }

    #[tokio::test]
    async fn memory_store_upserts_on_key() {
        let store = MemoryBatchStore::new();
        store
            .store_batch(EntityKind::Quote, &[quote("600584", 41.0)])
            .await
            .unwrap();
        store
            .store_batch(EntityKind::Quote, &[quote("600584", 41.5), quote("000001", 11.2)])
            .await
            .unwrap();

        let records = store.records().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| matches!(r, CanonicalRecord::Quote(q) if q.last_price == 41.5)));
    }

    #[tokio::test]
    async fn stores_reject_mixed_kind_batches() {
        let store = MemoryBatchStore::new();
        let err = store
            .store_batch(EntityKind::News, &[quote("600584", 41.0)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::KindMismatch {
                expected: EntityKind::News,
                found: EntityKind::Quote
            }
        ));
    }

    #[tokio::test]
    async fn jsonl_store_writes_lines_and_logs() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlBatchStore::new(dir.path());

        let written = store
            .store_batch(EntityKind::Quote, &[quote("600584", 41.0), quote("000001", 11.2)])
            .await
            .expect("store batch");
        assert_eq!(written, 2);

        let replayed = store
            .store_batch(EntityKind::Quote, &[quote("600584", 41.0), quote("000001", 11.2)])
            .await
            .expect("replay batch");
        assert_eq!(replayed, 0);

        let quote_dir = dir.path().join("quote");
        let day_dir = std::fs::read_dir(&quote_dir)
            .expect("quote dir")
            .next()
            .expect("day dir")
            .expect("entry")
            .path();
        let file = std::fs::read_dir(&day_dir)
            .expect("day dir")
            .next()
            .expect("batch file")
            .expect("entry")
            .path();
        let contents = std::fs::read_to_string(file).expect("read batch");
        assert_eq!(contents.lines().count(), 2);
        let first: CanonicalRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(first.kind(), EntityKind::Quote);

        store
            .log_cycle(&CycleLogEntry::new("quote", "success", "2 rows"))
            .await
            .expect("log");
        store
            .log_cycle(&CycleLogEntry::new("news", "failed", "store down"))
            .await
            .expect("log");
        let log = std::fs::read_to_string(store.log_path()).expect("read log");
        assert_eq!(log.lines().count(), 2);
    }
}
