use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use mdc_core::NewsItem;
use mdc_storage::write_file_atomic;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    Duplicate,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    retention_days: i64,
    entries: BTreeMap<String, DateTime<Utc>>,
}

/// News fingerprints already emitted, with the time each was first seen.
///
/// Lookup and insert happen under one lock, so concurrent cycles admit a
/// given fingerprint at most once per retention window.
#[derive(Debug)]
pub struct DedupIndex {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    retention: Duration,
    path: Option<PathBuf>,
    /// Held from snapshot to rename so an older snapshot never lands last.
    flush_lock: tokio::sync::Mutex<()>,
}

impl DedupIndex {
    pub fn in_memory(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
            path: None,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the index persisted at `path`; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>, retention: Duration) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: IndexFile = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing dedup index {}", path.display()))?;
                file.entries.into_iter().collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading dedup index {}", path.display()))
            }
        };
        info!(path = %path.display(), entries = entries.len(), "loaded news dedup index");
        Ok(Self {
            entries: Mutex::new(entries),
            retention,
            path: Some(path),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Admit a news item, keyed on a fingerprint recomputed from its content.
    pub fn admit(&self, item: &NewsItem, now: DateTime<Utc>) -> Admission {
        self.admit_fingerprint(&item.compute_fingerprint(), now)
    }

    pub fn admit_fingerprint(&self, fingerprint: &str, now: DateTime<Utc>) -> Admission {
        let mut entries = self.entries();
        match entries.get(fingerprint) {
            Some(first_seen) if now - *first_seen <= self.retention => Admission::Duplicate,
            _ => {
                entries.insert(fingerprint.to_string(), now);
                Admission::Accepted
            }
        }
    }

    /// Drop entries older than the retention window. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, first_seen| now - *first_seen <= self.retention);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted expired fingerprints");
        }
        evicted
    }

    /// Persist the index atomically. In-memory indexes are a no-op.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _flushing = self.flush_lock.lock().await;
        let file = IndexFile {
            version: 1,
            retention_days: self.retention.num_days(),
            entries: self.entries().iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing dedup index")?;
        write_file_atomic(path, &bytes, true).await?;
        Ok(())
    }
}
