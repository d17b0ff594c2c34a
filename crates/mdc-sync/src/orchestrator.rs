use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mdc_adapters::{Normalized, SchemaNormalizer};
use mdc_core::{CanonicalRecord, EntityKind, Target};
use mdc_storage::{BatchStore, CycleLogEntry, ProviderFailure, RawArchive};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chain::{ChainFailure, ChainSuccess, ProviderAttemptReport, SourceChain};
use crate::dedup::{Admission, DedupIndex};
use crate::ranking::rank_sectors;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    /// Permits in the worker pool shared by every cycle.
    pub pool_size: usize,
    pub cycle_timeout: Duration,
    /// News published longer ago than this, relative to cycle start, is dropped.
    pub news_max_age: chrono::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            pool_size: 6,
            cycle_timeout: Duration::from_secs(120),
            news_max_age: chrono::Duration::days(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target: Target,
    pub status: TargetStatus,
    pub source_id: Option<String>,
    /// Records this target contributed to the batch.
    pub records: usize,
    pub rejected_rows: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub failovers: Vec<ProviderAttemptReport>,
    pub failure: Option<ChainFailure>,
}

impl TargetOutcome {
    fn failed(target: Target, failure: ChainFailure) -> Self {
        let status = match failure {
            ChainFailure::Timeout { .. } => TargetStatus::TimedOut,
            _ => TargetStatus::Failed,
        };
        Self {
            target,
            status,
            source_id: None,
            records: 0,
            rejected_rows: 0,
            duplicates: 0,
            stale: 0,
            failovers: Vec::new(),
            failure: Some(failure),
        }
    }

    fn succeeded(target: Target, success: &ChainSuccess<Normalized>) -> Self {
        Self {
            target,
            status: TargetStatus::Succeeded,
            source_id: Some(success.source_id.clone()),
            records: 0,
            rejected_rows: success.accepted.rejected.len(),
            duplicates: 0,
            stale: 0,
            failovers: success.failovers.clone(),
            failure: None,
        }
    }
}

/// Everything one collection cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub cycle_id: Uuid,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetOutcome>,
    /// The accepted batch handed to the store.
    pub records: Vec<CanonicalRecord>,
    pub rows_written: usize,
    /// Records dropped because an earlier one in the batch had the same upsert key.
    pub collapsed: usize,
    pub persistence_error: Option<String>,
    pub dedup_flush_error: Option<String>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.count(TargetStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.targets.len() - self.succeeded()
    }

    pub fn timed_out(&self) -> usize {
        self.count(TargetStatus::TimedOut)
    }

    pub fn duplicates(&self) -> usize {
        self.targets.iter().map(|t| t.duplicates).sum()
    }

    pub fn stale(&self) -> usize {
        self.targets.iter().map(|t| t.stale).sum()
    }

    pub fn rejected_rows(&self) -> usize {
        self.targets.iter().map(|t| t.rejected_rows).sum()
    }

    fn count(&self, status: TargetStatus) -> usize {
        self.targets.iter().filter(|t| t.status == status).count()
    }

    pub fn status_label(&self) -> &'static str {
        if self.persistence_error.is_some() || (self.succeeded() == 0 && !self.targets.is_empty()) {
            "failed"
        } else if self.failed() > 0 || self.dedup_flush_error.is_some() {
            "partial"
        } else {
            "success"
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}/{} targets ok, {} records, {} written, {} duplicates, {} stale, {} rejected rows",
            self.succeeded(),
            self.targets.len(),
            self.records.len(),
            self.rows_written,
            self.duplicates(),
            self.stale(),
            self.rejected_rows()
        );
        if let Some(err) = &self.persistence_error {
            line.push_str(&format!("; store error: {err}"));
        }
        line
    }
}

/// Cycles to run together, each an entity kind and its targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPlan {
    pub cycles: Vec<(EntityKind, Vec<Target>)>,
}

impl CollectionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cycle(mut self, kind: EntityKind, targets: Vec<Target>) -> Self {
        if !targets.is_empty() {
            self.cycles.push((kind, targets));
        }
        self
    }

    pub fn retain_kinds(&mut self, kinds: &[EntityKind]) {
        self.cycles.retain(|(kind, _)| kinds.contains(kind));
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        self.cycles.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }
}

type Fetched = Result<ChainSuccess<Normalized>, ChainFailure>;

/// Drives collection cycles: chain, normalize, rank or dedup, then store.
pub struct CollectionOrchestrator {
    chains: HashMap<EntityKind, Arc<SourceChain>>,
    normalizer: Arc<SchemaNormalizer>,
    dedup: Arc<DedupIndex>,
    store: Arc<dyn BatchStore>,
    archive: Option<RawArchive>,
    pool: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl CollectionOrchestrator {
    pub fn new(
        normalizer: SchemaNormalizer,
        dedup: Arc<DedupIndex>,
        store: Arc<dyn BatchStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            chains: HashMap::new(),
            normalizer: Arc::new(normalizer),
            dedup,
            store,
            archive: None,
            pool: Arc::new(Semaphore::new(settings.pool_size.max(1))),
            settings,
        }
    }

    pub fn with_chain(mut self, chain: SourceChain) -> Self {
        self.chains.insert(chain.kind(), Arc::new(chain));
        self
    }

    pub fn with_archive(mut self, archive: RawArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn chain(&self, kind: EntityKind) -> Option<&Arc<SourceChain>> {
        self.chains.get(&kind)
    }

    pub fn dedup(&self) -> &Arc<DedupIndex> {
        &self.dedup
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Run every cycle of `plan` concurrently on the shared worker pool.
    /// Results come back in plan order.
    pub async fn run_plan(self: &Arc<Self>, plan: &CollectionPlan) -> Vec<BatchResult> {
        let mut set = JoinSet::new();
        for (index, (kind, targets)) in plan.cycles.iter().cloned().enumerate() {
            let this = Arc::clone(self);
            set.spawn(async move { (index, this.run_cycle(kind, targets).await) });
        }

        let mut results = Vec::with_capacity(plan.cycles.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(err) => error!(error = %err, "collection cycle task failed"),
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    pub async fn run_cycle(&self, kind: EntityKind, targets: Vec<Target>) -> BatchResult {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %kind, %cycle_id, targets = targets.len());
        self.run_cycle_inner(cycle_id, kind, targets)
            .instrument(span)
            .await
    }

    async fn run_cycle_inner(
        &self,
        cycle_id: Uuid,
        kind: EntityKind,
        targets: Vec<Target>,
    ) -> BatchResult {
        let started_at = Utc::now();
        let (slots, timed_out) = self.fetch_all(kind, &targets).await;

        let stale_cutoff = started_at - self.settings.news_max_age;
        let mut outcomes = Vec::with_capacity(targets.len());
        let mut records = Vec::new();
        let mut seen_keys = HashSet::new();
        let mut collapsed = 0usize;

        for (target, slot) in targets.into_iter().zip(slots) {
            let fetched = slot.unwrap_or_else(|| {
                Err(if timed_out {
                    ChainFailure::Timeout {
                        target: target.label(),
                    }
                } else {
                    ChainFailure::Aborted {
                        target: target.label(),
                        message: "collection task panicked".to_string(),
                    }
                })
            });

            let success = match fetched {
                Ok(success) => success,
                Err(failure) => {
                    warn!(%target, %failure, "target failed");
                    outcomes.push(TargetOutcome::failed(target, failure));
                    continue;
                }
            };

            if let Some(archive) = &self.archive {
                if let Err(err) = archive.archive(&success.payload).await {
                    warn!(%target, error = %format!("{err:#}"), "failed to archive raw payload");
                }
            }

            let mut outcome = TargetOutcome::succeeded(target.clone(), &success);
            let mut accepted = success.accepted.records;

            match kind {
                EntityKind::Sector => {
                    let top_n = match &target {
                        Target::TopSectors { top_n, .. } => *top_n,
                        _ => 0,
                    };
                    let entries = accepted
                        .into_iter()
                        .filter_map(|record| match record {
                            CanonicalRecord::Sector(entry) => Some(entry),
                            _ => None,
                        })
                        .collect();
                    accepted = rank_sectors(entries, top_n)
                        .into_iter()
                        .map(CanonicalRecord::Sector)
                        .collect();
                }
                EntityKind::News => {
                    let mut kept = Vec::with_capacity(accepted.len());
                    for record in accepted {
                        if let CanonicalRecord::News(item) = &record {
                            if item.published_at < stale_cutoff {
                                outcome.stale += 1;
                                continue;
                            }
                            if self.dedup.admit(item, Utc::now()) == Admission::Duplicate {
                                outcome.duplicates += 1;
                                continue;
                            }
                        }
                        kept.push(record);
                    }
                    accepted = kept;
                }
                EntityKind::Quote => {}
            }

            for record in accepted {
                if seen_keys.insert(record.upsert_key()) {
                    outcome.records += 1;
                    records.push(record);
                } else {
                    collapsed += 1;
                }
            }
            debug!(%target, source_id = ?outcome.source_id, records = outcome.records, "target collected");
            outcomes.push(outcome);
        }

        let mut dedup_flush_error = None;
        if kind == EntityKind::News {
            self.dedup.evict_expired(Utc::now());
            if let Err(err) = self.dedup.flush().await {
                warn!(error = %format!("{err:#}"), "failed to persist news dedup index");
                dedup_flush_error = Some(format!("{err:#}"));
            }
        }

        let mut rows_written = 0;
        let mut persistence_error = None;
        if !records.is_empty() {
            match self.store.store_batch(kind, &records).await {
                Ok(rows) => rows_written = rows,
                Err(err) => {
                    error!(store = self.store.name(), error = %err, "batch persistence failed");
                    persistence_error = Some(err.to_string());
                }
            }
        }

        let result = BatchResult {
            cycle_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            targets: outcomes,
            records,
            rows_written,
            collapsed,
            persistence_error,
            dedup_flush_error,
        };

        let entry = CycleLogEntry::new(
            format!("{kind}_collection"),
            result.status_label(),
            result.summary_line(),
        );
        if let Err(err) = self.store.log_cycle(&entry).await {
            warn!(error = %err, "failed to record cycle log");
        }

        info!(
            status = result.status_label(),
            succeeded = result.succeeded(),
            failed = result.failed(),
            records = result.records.len(),
            rows_written = result.rows_written,
            duplicates = result.duplicates(),
            "cycle finished"
        );
        result
    }

    /// Fetch and normalize every target on the worker pool. Returns one slot
    /// per target (empty when the deadline aborted its task) and whether the
    /// cycle deadline cut collection short.
    async fn fetch_all(&self, kind: EntityKind, targets: &[Target]) -> (Vec<Option<Fetched>>, bool) {
        let mut slots: Vec<Option<Fetched>> = (0..targets.len()).map(|_| None).collect();

        let Some(chain) = self.chains.get(&kind).cloned() else {
            for (slot, target) in slots.iter_mut().zip(targets) {
                *slot = Some(Err(ChainFailure::AllSourcesExhausted {
                    kind,
                    target: target.label(),
                    attempts: Vec::new(),
                }));
            }
            return (slots, false);
        };

        let mut set = JoinSet::new();
        let mut task_slots = HashMap::with_capacity(targets.len());
        for (index, target) in targets.iter().cloned().enumerate() {
            let chain = Arc::clone(&chain);
            let normalizer = Arc::clone(&self.normalizer);
            let pool = Arc::clone(&self.pool);
            let handle = set.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    let failure = ChainFailure::Aborted {
                        target: target.label(),
                        message: "worker pool closed".to_string(),
                    };
                    return (index, Err(failure));
                };
                let fetched = chain
                    .fetch_accepted(&target, |payload| {
                        normalizer
                            .normalize(kind, &payload.source_id, payload)
                            .map_err(|err| ProviderFailure::schema(err.to_string()))
                    })
                    .await;
                (index, fetched)
            });
            task_slots.insert(handle.id(), index);
        }

        let deadline = Instant::now() + self.settings.cycle_timeout;
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((index, fetched)))) => slots[index] = Some(fetched),
                Ok(Some(Err(err))) => {
                    error!(error = %err, "target task failed");
                    if let Some(&index) = task_slots.get(&err.id()) {
                        slots[index] = Some(Err(ChainFailure::Aborted {
                            target: targets[index].label(),
                            message: "collection task panicked".to_string(),
                        }));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(timeout = ?self.settings.cycle_timeout, pending = set.len(), "cycle timed out, aborting in-flight targets");
                    set.abort_all();
                    timed_out = true;
                    break;
                }
            }
        }
        (slots, timed_out)
    }
}
