use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdc_core::EntityKind;
use mdc_storage::{BatchStore, MemoryBatchStore};
use mdc_sync::{
    build_orchestrator, collect_once, maybe_build_scheduler, open_store, recent_reports_markdown,
    CollectorConfig, StorageBackend,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mdc-cli")]
#[command(about = "A-share market data collector")]
struct Cli {
    /// Collector config; overrides MDC_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection pass over the configured targets.
    Collect {
        /// Entity kinds to collect (quote, sector, news); all when omitted.
        #[arg(value_delimiter = ',')]
        kinds: Vec<EntityKind>,
        /// Collect into memory and print the batches instead of storing them.
        #[arg(long)]
        dry_run: bool,
        /// Skip quotes outside A-share trading sessions.
        #[arg(long)]
        respect_market_hours: bool,
    },
    /// Run the configured plan on the schedule crons until interrupted.
    Schedule,
    /// Create the PostgreSQL tables.
    InitDb,
    /// Validate the configuration and print the collection plan.
    CheckConfig,
    /// Summarize the most recent cycle reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

async fn load_config(path: Option<PathBuf>) -> Result<CollectorConfig> {
    let path = path.or_else(|| std::env::var("MDC_CONFIG").ok().map(PathBuf::from));
    CollectorConfig::resolve(path.as_deref(), |key| std::env::var(key).ok())
        .await
        .context("loading collector config")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config).await?;

    match cli.command.unwrap_or(Commands::Collect {
        kinds: Vec::new(),
        dry_run: false,
        respect_market_hours: false,
    }) {
        Commands::Collect {
            kinds,
            dry_run,
            respect_market_hours,
        } => {
            let store: Arc<dyn BatchStore> = if dry_run {
                Arc::new(MemoryBatchStore::new())
            } else {
                open_store(&config).await?
            };
            let orchestrator = Arc::new(build_orchestrator(&config, store).await?);

            let mut plan = config.plan();
            if !kinds.is_empty() {
                plan.retain_kinds(&kinds);
            }
            let reports = (!dry_run).then_some(config.reports_dir.as_path());
            let results = collect_once(&orchestrator, plan, respect_market_hours, reports).await;

            for result in &results {
                println!(
                    "{} cycle {}: {} ({})",
                    result.kind,
                    result.cycle_id,
                    result.status_label(),
                    result.summary_line()
                );
                if dry_run {
                    for record in &result.records {
                        println!("{}", serde_json::to_string(record)?);
                    }
                }
            }
            if results.is_empty() {
                println!("nothing to collect");
            }
        }
        Commands::Schedule => {
            let store = open_store(&config).await?;
            let orchestrator = Arc::new(build_orchestrator(&config, store).await?);
            let Some(sched) = maybe_build_scheduler(orchestrator, &config).await? else {
                anyhow::bail!("schedule.enabled is false in the collector config");
            };
            sched.start().await.context("starting scheduler")?;
            info!(crons = ?config.schedule.crons, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::InitDb => {
            if config.storage.backend != StorageBackend::Postgres {
                anyhow::bail!("init-db needs storage.backend: postgres");
            }
            open_store(&config).await?;
            println!("collector tables ready");
        }
        Commands::CheckConfig => {
            println!("config ok: storage={:?}", config.storage.backend);
            for kind in EntityKind::ALL {
                let chain = config
                    .providers
                    .for_kind(kind)
                    .iter()
                    .map(|spec| spec.adapter_name())
                    .collect::<Vec<_>>();
                println!("{kind}: providers {chain:?}");
            }
            for (kind, targets) in &config.plan().cycles {
                let labels = targets.iter().map(|t| t.label()).collect::<Vec<_>>();
                println!("{kind}: targets {labels:?}");
            }
        }
        Commands::Report { runs } => {
            println!("{}", recent_reports_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
