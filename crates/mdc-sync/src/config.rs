//! `collector.yaml` loading, environment overrides and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mdc_adapters::{FieldMapping, ProviderSpec};
use mdc_core::{EntityKind, Market, SectorBoard, Target};
use mdc_storage::{BackoffPolicy, HttpClientConfig, RetryPolicy, TokenBucketConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::chain::CircuitBreakerConfig;
use crate::orchestrator::{CollectionPlan, OrchestratorSettings};

pub const DEFAULT_CONFIG_PATH: &str = "collector.yaml";

/// Upper bound for day-valued settings.
const MAX_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub token_bucket: Option<TokenBucketSection>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "mdc-collector/0.1".to_string(),
            global_concurrency: 8,
            per_source_concurrency: 2,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TokenBucketSection {
    pub capacity: u32,
    pub refill_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.5,
            attempt_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub base_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_secs: 60,
            max_cooldown_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub retention_days: i64,
    /// Defaults to `<state_dir>/news_index.json`.
    pub index_path: Option<PathBuf>,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            retention_days: 7,
            index_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub pool_size: usize,
    pub cycle_timeout_secs: u64,
    pub news_max_age_days: i64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            pool_size: 6,
            cycle_timeout_secs: 120,
            news_max_age_days: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TargetsSection {
    pub symbols: Vec<String>,
    /// Index codes, collected in the quote cycle. Each needs a venue prefix
    /// (`sh000001`, `sz399001`) since index and stock codes overlap.
    pub indices: Vec<String>,
    pub sector_boards: Vec<SectorBoard>,
    pub sector_top_n: usize,
    /// Symbols whose company news is collected.
    pub news_symbols: Vec<String>,
    pub headlines: bool,
}

impl Default for TargetsSection {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            indices: Vec::new(),
            sector_boards: vec![SectorBoard::Concept, SectorBoard::Industry],
            sector_top_n: 20,
            news_symbols: Vec::new(),
            headlines: true,
        }
    }
}

/// Ordered provider chains per entity kind; first entry is tried first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    pub quote: Vec<ProviderSpec>,
    pub sector: Vec<ProviderSpec>,
    pub news: Vec<ProviderSpec>,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        let eastmoney = ProviderSpec::Eastmoney {
            base_url: None,
            page_size: None,
        };
        let sina = ProviderSpec::Sina { base_url: None };
        Self {
            quote: vec![eastmoney.clone(), sina.clone()],
            sector: vec![eastmoney.clone(), sina],
            news: vec![
                eastmoney,
                ProviderSpec::SinaRoll {
                    base_url: None,
                    page_size: None,
                },
            ],
        }
    }
}

impl ProvidersSection {
    pub fn for_kind(&self, kind: EntityKind) -> &[ProviderSpec] {
        match kind {
            EntityKind::Quote => &self.quote,
            EntityKind::Sector => &self.sector,
            EntityKind::News => &self.news,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Jsonl,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Jsonl,
            data_dir: PathBuf::from("./data"),
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ArchiveSection {
    pub enabled: bool,
    /// Defaults to `<data_dir>/raw`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub enabled: bool,
    pub crons: Vec<String>,
    /// Skip quote cycles outside A-share trading sessions.
    pub respect_market_hours: bool,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 6 * * *".to_string(), "0 18 * * *".to_string()],
            respect_market_hours: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub http: HttpSection,
    pub retry: RetrySection,
    pub circuit_breaker: BreakerSection,
    pub dedup: DedupSection,
    pub orchestrator: OrchestratorSection,
    pub targets: TargetsSection,
    pub providers: ProvidersSection,
    pub storage: StorageSection,
    pub archive: ArchiveSection,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub schedule: ScheduleSection,
    /// Extra mapping tables, registered on top of the built-in ones.
    pub mappings: Vec<FieldMapping>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            http: HttpSection::default(),
            retry: RetrySection::default(),
            circuit_breaker: BreakerSection::default(),
            dedup: DedupSection::default(),
            orchestrator: OrchestratorSection::default(),
            targets: TargetsSection::default(),
            providers: ProvidersSection::default(),
            storage: StorageSection::default(),
            archive: ArchiveSection::default(),
            state_dir: PathBuf::from("./state"),
            reports_dir: PathBuf::from("./reports"),
            schedule: ScheduleSection::default(),
            mappings: Vec::new(),
        }
    }
}

impl CollectorConfig {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&text, path)
    }

    /// Load `MDC_CONFIG` (or `collector.yaml`), apply environment overrides
    /// and validate. Without `MDC_CONFIG`, a missing default file means defaults.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let explicit = std::env::var("MDC_CONFIG").ok().map(PathBuf::from);
        Self::resolve(explicit.as_deref(), |key| std::env::var(key).ok()).await
    }

    pub async fn resolve(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load(path).await?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                match tokio::fs::try_exists(path).await {
                    Ok(true) => Self::load(path).await?,
                    _ => Self::default(),
                }
            }
        };
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.storage.database_url = Some(url);
        }
        if let Some(dir) = lookup("MDC_DATA_DIR").filter(|v| !v.is_empty()) {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MDC_STATE_DIR").filter(|v| !v.is_empty()) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(agent) = lookup("MDC_USER_AGENT").filter(|v| !v.is_empty()) {
            self.http.user_agent = agent;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        for (kind, targets) in self.plan().cycles {
            if !targets.is_empty() && self.providers.for_kind(kind).is_empty() {
                return invalid(format!("{kind} targets configured but providers.{kind} is empty"));
            }
        }
        if self.orchestrator.pool_size == 0 {
            return invalid("orchestrator.pool_size must be at least 1".into());
        }
        if self.orchestrator.cycle_timeout_secs == 0 {
            return invalid("orchestrator.cycle_timeout_secs must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid(format!("retry.jitter {} is outside [0, 1]", self.retry.jitter));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms is below retry.base_delay_ms".into());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1".into());
        }
        if !(1..=MAX_DAYS).contains(&self.dedup.retention_days) {
            return invalid(format!(
                "dedup.retention_days {} is outside [1, {MAX_DAYS}]",
                self.dedup.retention_days
            ));
        }
        if !(1..=MAX_DAYS).contains(&self.orchestrator.news_max_age_days) {
            return invalid(format!(
                "orchestrator.news_max_age_days {} is outside [1, {MAX_DAYS}]",
                self.orchestrator.news_max_age_days
            ));
        }
        if let Some(code) = self
            .targets
            .indices
            .iter()
            .find(|code| Market::explicit(code).is_none())
        {
            return invalid(format!("targets.indices entry {code} needs a sh/sz/bj prefix"));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none() {
            return invalid("postgres storage needs storage.database_url or DATABASE_URL".into());
        }
        if self.schedule.enabled && self.schedule.crons.is_empty() {
            return invalid("schedule is enabled without any crons".into());
        }
        Ok(())
    }

    pub fn plan(&self) -> CollectionPlan {
        let quotes = self
            .targets
            .symbols
            .iter()
            .chain(&self.targets.indices)
            .map(Target::symbol)
            .collect();
        let sectors = self
            .targets
            .sector_boards
            .iter()
            .map(|board| Target::TopSectors {
                board: *board,
                top_n: self.targets.sector_top_n,
            })
            .collect();
        let mut news: Vec<Target> = self.targets.news_symbols.iter().map(Target::symbol).collect();
        if self.targets.headlines {
            news.push(Target::Headlines);
        }
        CollectionPlan::new()
            .with_cycle(EntityKind::Quote, quotes)
            .with_cycle(EntityKind::Sector, sectors)
            .with_cycle(EntityKind::News, news)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: Some(self.http.user_agent.clone()),
            global_concurrency: self.http.global_concurrency.max(1),
            per_source_concurrency: self.http.per_source_concurrency.max(1),
            token_bucket: self.http.token_bucket.map(|bucket| TokenBucketConfig {
                capacity: bucket.capacity.max(1),
                refill_every: Duration::from_millis(bucket.refill_ms),
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            attempt_timeout: Duration::from_secs(self.retry.attempt_timeout_secs),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            base_cooldown: Duration::from_secs(self.circuit_breaker.base_cooldown_secs),
            max_cooldown: Duration::from_secs(self.circuit_breaker.max_cooldown_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            pool_size: self.orchestrator.pool_size,
            cycle_timeout: Duration::from_secs(self.orchestrator.cycle_timeout_secs),
            news_max_age: chrono::Duration::days(self.orchestrator.news_max_age_days),
        }
    }

    pub fn dedup_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.dedup.retention_days)
    }

    pub fn dedup_index_path(&self) -> PathBuf {
        self.dedup
            .index_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("news_index.json"))
    }

    pub fn archive_dir(&self) -> Option<PathBuf> {
        self.archive.enabled.then(|| {
            self.archive
                .dir
                .clone()
                .unwrap_or_else(|| self.storage.data_dir.join("raw"))
        })
    }
}
