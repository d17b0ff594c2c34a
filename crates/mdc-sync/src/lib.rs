//! Collection orchestration: provider chains, news dedup, sector ranking,
//! configuration, cycle reports and the cron scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mdc_adapters::{provider_from_spec, SchemaNormalizer};
use mdc_core::{is_trading_session, EntityKind};
use mdc_storage::{BatchStore, HttpFetcher, JsonlBatchStore, MemoryBatchStore, PgBatchStore, RawArchive};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod chain;
pub mod config;
pub mod dedup;
pub mod orchestrator;
pub mod ranking;
pub mod report;

pub use chain::{
    AttemptOutcome, ChainFailure, ChainSuccess, CircuitBreakerConfig, ProviderAttemptReport,
    ProviderHandle, SourceChain,
};
pub use config::{CollectorConfig, ConfigError, StorageBackend};
pub use dedup::{Admission, DedupIndex};
pub use orchestrator::{
    BatchResult, CollectionOrchestrator, CollectionPlan, OrchestratorSettings, TargetOutcome,
    TargetStatus,
};
pub use ranking::rank_sectors;
pub use report::{recent_reports_markdown, write_cycle_report};

/// Open the batch store the configuration names.
pub async fn open_store(config: &CollectorConfig) -> Result<Arc<dyn BatchStore>> {
    let store: Arc<dyn BatchStore> = match config.storage.backend {
        StorageBackend::Jsonl => Arc::new(JsonlBatchStore::new(config.storage.data_dir.clone())),
        StorageBackend::Memory => Arc::new(MemoryBatchStore::new()),
        StorageBackend::Postgres => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .context("postgres storage needs a database url")?;
            let store = PgBatchStore::connect(url, config.storage.max_connections)
                .await
                .context("connecting to postgres")?;
            store.init_schema().await.context("creating collector tables")?;
            Arc::new(store)
        }
    };
    Ok(store)
}

/// Wire providers, chains, normalizer, dedup index and store from config.
pub async fn build_orchestrator(
    config: &CollectorConfig,
    store: Arc<dyn BatchStore>,
) -> Result<CollectionOrchestrator> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);

    let mut normalizer = SchemaNormalizer::with_builtin_tables();
    for mapping in &config.mappings {
        normalizer.register(mapping.clone());
    }

    let mut chains = Vec::new();
    for kind in EntityKind::ALL {
        let specs = config.providers.for_kind(kind);
        if specs.is_empty() {
            continue;
        }
        let mut providers = Vec::with_capacity(specs.len());
        for spec in specs {
            let provider = provider_from_spec(kind, spec, Arc::clone(&http))
                .with_context(|| format!("building {kind} provider {}", spec.adapter_name()))?;
            if !normalizer.has_mapping(kind, provider.source_id()) {
                warn!(%kind, source_id = provider.source_id(), "no mapping table; its payloads will be rejected");
            }
            providers.push(provider);
        }
        info!(%kind, chain = ?specs.iter().map(|s| s.adapter_name()).collect::<Vec<_>>(), "provider chain ready");
        chains.push(SourceChain::new(
            kind,
            providers,
            config.retry_policy(),
            config.breaker_config(),
        ));
    }

    let dedup = DedupIndex::open(config.dedup_index_path(), config.dedup_retention())
        .await
        .context("opening news dedup index")?;

    let mut orchestrator = CollectionOrchestrator::new(
        normalizer,
        Arc::new(dedup),
        store,
        config.orchestrator_settings(),
    );
    for chain in chains {
        orchestrator = orchestrator.with_chain(chain);
    }
    if let Some(dir) = config.archive_dir() {
        orchestrator = orchestrator.with_archive(RawArchive::new(dir));
    }
    Ok(orchestrator)
}

/// Drop the quote cycle when `now` is outside an A-share trading session.
/// Returns whether anything was dropped.
pub fn apply_market_hours(plan: &mut CollectionPlan, now: DateTime<Utc>) -> bool {
    if is_trading_session(now) || !plan.kinds().contains(&EntityKind::Quote) {
        return false;
    }
    plan.cycles.retain(|(kind, _)| *kind != EntityKind::Quote);
    true
}

/// One collection pass: market-hours guard, every cycle of the plan, reports.
pub async fn collect_once(
    orchestrator: &Arc<CollectionOrchestrator>,
    mut plan: CollectionPlan,
    respect_market_hours: bool,
    reports_dir: Option<&Path>,
) -> Vec<BatchResult> {
    if respect_market_hours && apply_market_hours(&mut plan, Utc::now()) {
        info!("outside trading session, skipping quote cycle");
    }
    if plan.is_empty() {
        return Vec::new();
    }

    let results = orchestrator.run_plan(&plan).await;
    if let Some(dir) = reports_dir {
        for result in &results {
            if let Err(err) = write_cycle_report(dir, result).await {
                warn!(cycle_id = %result.cycle_id, error = %format!("{err:#}"), "failed to write cycle report");
            }
        }
    }
    results
}

/// Scheduler running the configured plan on each cron, or `None` when disabled.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<CollectionOrchestrator>,
    config: &CollectorConfig,
) -> Result<Option<JobScheduler>> {
    if !config.schedule.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let plan = config.plan();
    let reports_dir = config.reports_dir.clone();
    let respect_market_hours = config.schedule.respect_market_hours;
    for cron in &config.schedule.crons {
        let orchestrator = Arc::clone(&orchestrator);
        let plan = plan.clone();
        let reports_dir = reports_dir.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            let plan = plan.clone();
            let reports_dir = reports_dir.clone();
            Box::pin(async move {
                let results =
                    collect_once(&orchestrator, plan, respect_market_hours, Some(reports_dir.as_path()))
                        .await;
                for result in &results {
                    info!(kind = %result.kind, status = result.status_label(), summary = %result.summary_line(), "scheduled cycle done");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
