//! Ordered provider failover with a per-provider circuit breaker.
//!
//! A provider's circuit is closed while its failure streak is below the
//! threshold. Reaching the threshold opens it for a cool-down that grows with
//! the streak. Once the cool-down elapses the circuit is half-open: exactly one
//! caller probes the provider while everyone else keeps skipping it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mdc_adapters::Provider;
use mdc_core::{EntityKind, RawPayload, Target};
use mdc_storage::{ProviderFailure, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed invocations before the provider cools down.
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Cool-down for a provider whose streak just reached `streak`.
    pub fn cooldown_for(&self, streak: u32) -> Option<Duration> {
        let threshold = self.failure_threshold.max(1);
        if streak < threshold {
            return None;
        }
        let factor = streak - threshold + 1;
        Some(self.base_cooldown.saturating_mul(factor).min(self.max_cooldown))
    }
}

#[derive(Debug, Default)]
struct Health {
    failure_streak: u32,
    cooldown_until: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Closed,
    Probe,
    CoolingDown(Duration),
    ProbeInFlight,
}

/// A provider plus its mutable health, owned by one chain.
pub struct ProviderHandle {
    provider: Arc<dyn Provider>,
    priority: usize,
    health: Mutex<Health>,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("source_id", &self.provider.source_id())
            .field("priority", &self.priority)
            .field("failure_streak", &self.failure_streak())
            .finish()
    }
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn Provider>, priority: usize) -> Self {
        Self {
            provider,
            priority,
            health: Mutex::new(Health::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.provider.source_id()
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn failure_streak(&self) -> u32 {
        self.health().failure_streak
    }

    /// Time left before the provider may be probed again.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.health().cooldown_until?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        // A poisoned lock only means a panic elsewhere; the counters stay usable.
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self, now: Instant) -> Gate {
        let mut health = self.health();
        match health.cooldown_until {
            None => Gate::Closed,
            Some(until) if now < until => Gate::CoolingDown(until - now),
            Some(_) if health.probe_in_flight => Gate::ProbeInFlight,
            Some(_) => {
                health.probe_in_flight = true;
                Gate::Probe
            }
        }
    }

    fn record_success(&self) {
        let mut health = self.health();
        health.failure_streak = 0;
        health.cooldown_until = None;
        health.probe_in_flight = false;
    }

    /// Returns the new cool-down when this failure opened the circuit.
    fn record_failure(
        &self,
        cause: &ProviderFailure,
        breaker: &CircuitBreakerConfig,
        now: Instant,
    ) -> Option<Duration> {
        let mut health = self.health();
        health.probe_in_flight = false;
        if cause.blames_target() {
            return None;
        }
        health.failure_streak = health.failure_streak.saturating_add(1);
        let cooldown = breaker.cooldown_for(health.failure_streak)?;
        health.cooldown_until = Some(now + cooldown);
        Some(cooldown)
    }

    fn release_probe(&self) {
        self.health().probe_in_flight = false;
    }
}

/// Clears a half-open probe claim if the probing task is dropped mid-flight.
struct ProbeClaim<'a> {
    handle: &'a ProviderHandle,
}

impl Drop for ProbeClaim<'_> {
    fn drop(&mut self) {
        self.handle.release_probe();
    }
}

/// What happened to one provider during a chain walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Failed { cause: ProviderFailure, attempts: u32 },
    CoolingDown { remaining_ms: u64 },
    ProbeInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttemptReport {
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl fmt::Display for ProviderAttemptReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Failed { cause, attempts } => {
                write!(f, "{}: {cause} after {attempts} attempt(s)", self.source_id)
            }
            AttemptOutcome::CoolingDown { remaining_ms } => {
                write!(f, "{}: cooling down for {remaining_ms}ms", self.source_id)
            }
            AttemptOutcome::ProbeInFlight => write!(f, "{}: recovery probe in flight", self.source_id),
        }
    }
}

fn summarize(reports: &[ProviderAttemptReport]) -> String {
    if reports.is_empty() {
        return "no providers configured".to_string();
    }
    reports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum ChainFailure {
    #[error("all {kind} sources exhausted for {target}: {}", summarize(.attempts))]
    AllSourcesExhausted {
        kind: EntityKind,
        target: String,
        attempts: Vec<ProviderAttemptReport>,
    },
    #[error("collection of {target} timed out")]
    Timeout { target: String },
    #[error("collection of {target} aborted: {message}")]
    Aborted { target: String, message: String },
}

/// A payload one provider returned and the caller accepted.
#[derive(Debug, Clone)]
pub struct ChainSuccess<T> {
    pub source_id: String,
    pub payload: RawPayload,
    pub accepted: T,
    /// Providers tried and skipped before this one.
    pub failovers: Vec<ProviderAttemptReport>,
}

/// Providers for one entity kind, tried in priority order.
#[derive(Debug)]
pub struct SourceChain {
    kind: EntityKind,
    handles: Vec<Arc<ProviderHandle>>,
    retry: RetryPolicy,
    breaker: CircuitBreakerConfig,
}

impl SourceChain {
    pub fn new(
        kind: EntityKind,
        providers: Vec<Arc<dyn Provider>>,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let handles = providers
            .into_iter()
            .enumerate()
            .map(|(priority, provider)| Arc::new(ProviderHandle::new(provider, priority)))
            .collect();
        Self {
            kind,
            handles,
            retry,
            breaker,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn handles(&self) -> &[Arc<ProviderHandle>] {
        &self.handles
    }

    pub async fn fetch(&self, target: &Target) -> Result<ChainSuccess<()>, ChainFailure> {
        self.fetch_accepted(target, |_| Ok(())).await
    }

    /// Walk the chain until a provider returns a payload that `accept` takes.
    ///
    /// `accept` runs inside each attempt, so its errors count against the
    /// provider that produced the payload.
    pub async fn fetch_accepted<T, F>(
        &self,
        target: &Target,
        accept: F,
    ) -> Result<ChainSuccess<T>, ChainFailure>
    where
        T: Send,
        F: Fn(&RawPayload) -> Result<T, ProviderFailure> + Send + Sync,
    {
        let accept = &accept;
        let mut reports = Vec::new();

        for handle in &self.handles {
            let source_id = handle.name().to_string();
            let claim = match handle.gate(Instant::now()) {
                Gate::Closed => None,
                Gate::Probe => {
                    info!(kind = %self.kind, source_id, %target, "probing provider after cool-down");
                    Some(ProbeClaim { handle })
                }
                Gate::CoolingDown(remaining) => {
                    debug!(kind = %self.kind, source_id, ?remaining, "skipping provider in cool-down");
                    reports.push(ProviderAttemptReport {
                        source_id,
                        outcome: AttemptOutcome::CoolingDown {
                            remaining_ms: remaining.as_millis().min(u64::MAX as u128) as u64,
                        },
                    });
                    continue;
                }
                Gate::ProbeInFlight => {
                    reports.push(ProviderAttemptReport {
                        source_id,
                        outcome: AttemptOutcome::ProbeInFlight,
                    });
                    continue;
                }
            };

            let provider = Arc::clone(&handle.provider);
            let outcome = self
                .retry
                .attempt(|_| {
                    let provider = Arc::clone(&provider);
                    async move {
                        let payload = provider.fetch(target).await?;
                        let accepted = accept(&payload)?;
                        Ok((payload, accepted))
                    }
                })
                .await;

            match outcome {
                Ok((mut payload, accepted)) => {
                    handle.record_success();
                    drop(claim);
                    payload.source_id = source_id.clone();
                    if !reports.is_empty() {
                        info!(kind = %self.kind, source_id, %target, skipped = reports.len(), "served by fallback provider");
                    }
                    return Ok(ChainSuccess {
                        source_id,
                        payload,
                        accepted,
                        failovers: reports,
                    });
                }
                Err(exhausted) => {
                    if let Some(cooldown) =
                        handle.record_failure(&exhausted.cause, &self.breaker, Instant::now())
                    {
                        warn!(
                            kind = %self.kind,
                            source_id,
                            streak = handle.failure_streak(),
                            ?cooldown,
                            "provider circuit opened"
                        );
                    }
                    drop(claim);
                    warn!(kind = %self.kind, source_id, %target, cause = %exhausted.cause, attempts = exhausted.attempts, "provider failed, trying next");
                    reports.push(ProviderAttemptReport {
                        source_id,
                        outcome: AttemptOutcome::Failed {
                            cause: exhausted.cause,
                            attempts: exhausted.attempts,
                        },
                    });
                }
            }
        }

        Err(ChainFailure::AllSourcesExhausted {
            kind: self.kind,
            target: target.label(),
            attempts: reports,
        })
    }
}
