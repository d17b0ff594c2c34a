//! Provider failure taxonomy, retry/backoff, rate-limited HTTP fetching, raw
//! payload archiving and the batch persistence interface.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use mdc_core::RawPayload;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod batch;
mod postgres;

pub use batch::{BatchStore, CycleLogEntry, JsonlBatchStore, MemoryBatchStore, StoreError};
pub use postgres::PgBatchStore;

/// Whether a failed provider call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Why a single provider call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum ProviderFailure {
    #[error("attempt timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("provider returned an empty payload")]
    EmptyPayload,
    #[error("malformed payload: {message}")]
    Malformed { message: String },
    #[error("schema violation: {message}")]
    SchemaViolation { message: String },
    #[error("target {target} is not supported by this provider")]
    UnsupportedTarget { target: String },
    #[error("request rejected before sending: {message}")]
    Rejected { message: String },
}

impl ProviderFailure {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_ms: after.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::EmptyPayload
            | Self::Malformed { .. } => FailureClass::Transient,
            Self::HttpStatus { status, .. } => {
                classify_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY))
            }
            Self::SchemaViolation { .. } | Self::UnsupportedTarget { .. } | Self::Rejected { .. } => {
                FailureClass::Permanent
            }
        }
    }

    /// The failure says something about the target rather than the provider's
    /// health, so it should not count toward the provider's failure streak.
    pub fn blames_target(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedTarget { .. } | Self::HttpStatus { status: 404, .. }
        )
    }
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

pub fn failure_from_reqwest(err: &reqwest::Error, timeout: Duration) -> ProviderFailure {
    if err.is_timeout() {
        ProviderFailure::timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        ProviderFailure::Connection {
            message: err.to_string(),
        }
    } else if err.is_builder() {
        ProviderFailure::Rejected {
            message: err.to_string(),
        }
    } else {
        ProviderFailure::malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of half the exponential term added as random jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    fn exponential(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.exponential(attempt_index).min(self.max_delay)
    }

    /// Delay after the `attempt_index`-th failure given a uniform `sample` in `[0, 1)`.
    ///
    /// Jitter never exceeds half the exponential term, so the sequence stays
    /// non-decreasing for any samples.
    pub fn jittered_delay(&self, attempt_index: usize, sample: f64) -> Duration {
        let exp = self.exponential(attempt_index);
        let ratio = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0) * 0.5;
        let jitter = exp.mul_f64(ratio);
        exp.saturating_add(jitter).min(self.max_delay)
    }
}

/// Bounded retries with exponential backoff around one provider call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

/// Final failure after the retry budget was spent or a permanent failure hit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{cause} (after {attempts} attempt(s))")]
pub struct RetryExhausted {
    pub cause: ProviderFailure,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The closure receives the 1-based attempt number.
    pub async fn attempt<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderFailure>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, operation(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderFailure::timeout(self.attempt_timeout)),
            };

            let cause = match outcome {
                Ok(value) => return Ok(value),
                Err(cause) => cause,
            };

            if cause.class() == FailureClass::Permanent || attempt >= max_attempts {
                return Err(RetryExhausted {
                    cause,
                    attempts: attempt,
                });
            }

            let delay = self
                .backoff
                .jittered_delay((attempt - 1) as usize, rand::random::<f64>());
            debug!(attempt, max_attempts, ?delay, %cause, "transient failure, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Process-wide request budget shared by every provider.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()).min(u32::MAX as u128) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout enforced by the HTTP client.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Single-attempt HTTP client. Retrying is the caller's job.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<TokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` once on behalf of `source_id`.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedResponse, ProviderFailure> {
        let span = info_span!("http_fetch", source_id, url);
        async move {
            let closed = |_| ProviderFailure::Rejected {
                message: "http fetcher is shutting down".to_string(),
            };
            let _global = self.global_limit.acquire().await.map_err(closed)?;
            let per_source = self.per_source_semaphore(source_id).await;
            let _source = per_source.acquire().await.map_err(closed)?;

            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let mut request = self.client.get(url);
            if let Some(referer) = referer {
                request = request.header(reqwest::header::REFERER, referer);
            }

            let resp = request
                .send()
                .await
                .map_err(|err| failure_from_reqwest(&err, self.timeout))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(ProviderFailure::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let body = resp
                .bytes()
                .await
                .map_err(|err| failure_from_reqwest(&err, self.timeout))?
                .to_vec();
            if body.iter().all(|b| b.is_ascii_whitespace()) {
                return Err(ProviderFailure::EmptyPayload);
            }

            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a temp file and rename, so readers see
/// either nothing or the whole file. Returns `false` when `path` already existed.
pub async fn write_file_atomic(path: &Path, bytes: &[u8], replace: bool) -> anyhow::Result<bool> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    if !replace
        && fs::try_exists(path)
            .await
            .with_context(|| format!("checking path {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists && !replace => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw provider bodies, kept for auditing.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(&self, payload: &RawPayload, content_hash: &str) -> PathBuf {
        let stamp = payload.fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp)
            .join(&payload.source_id)
            .join(format!("{content_hash}.{}", extension_for(&payload.content_type)))
    }

    pub async fn archive(&self, payload: &RawPayload) -> anyhow::Result<ArchivedPayload> {
        let bytes: Vec<u8> = if payload.body.is_empty() {
            serde_json::to_vec(&payload.rows).context("serializing payload rows for archive")?
        } else {
            payload.body.clone()
        };
        let content_hash = sha256_hex(&bytes);
        let relative_path = self.relative_path(payload, &content_hash);
        let created = write_file_atomic(&self.root.join(&relative_path), &bytes, false).await?;
        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            byte_size: bytes.len(),
            deduplicated: !created,
        })
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let lower = content_type.to_ascii_lowercase();
    if lower.contains("json") {
        "json"
    } else if lower.contains("html") {
        "html"
    } else if lower.contains("javascript") || lower.starts_with("text/") {
        "txt"
    } else {
        "bin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use mdc_core::EntityKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                jitter: 1.0,
            },
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jittered_delays_never_decrease() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            jitter: 1.0,
        };
        // worst case for monotonicity: maximal jitter followed by none
        let samples = [0.999, 0.0, 0.999, 0.0, 0.5, 0.999, 0.0, 0.3];
        let delays: Vec<Duration> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| policy.jittered_delay(i, *s))
            .collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn status_classification_separates_transient_and_permanent() {
        let server_error = ProviderFailure::HttpStatus {
            status: 503,
            url: "u".into(),
        };
        let throttled = ProviderFailure::HttpStatus {
            status: 429,
            url: "u".into(),
        };
        let not_found = ProviderFailure::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        let forbidden = ProviderFailure::HttpStatus {
            status: 403,
            url: "u".into(),
        };
        assert_eq!(server_error.class(), FailureClass::Transient);
        assert_eq!(throttled.class(), FailureClass::Transient);
        assert_eq!(not_found.class(), FailureClass::Permanent);
        assert!(not_found.blames_target());
        assert_eq!(forbidden.class(), FailureClass::Permanent);
        assert!(!forbidden.blames_target());
        assert_eq!(ProviderFailure::EmptyPayload.class(), FailureClass::Transient);
        assert_eq!(ProviderFailure::schema("bad").class(), FailureClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_up_to_the_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .attempt(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderFailure::EmptyPayload) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.cause, ProviderFailure::EmptyPayload);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_aborts_without_spending_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .attempt(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderFailure::schema("missing column")) }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_are_cut_off_as_timeouts() {
        let result = fast_policy(2)
            .attempt(|attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok::<_, ProviderFailure>(attempt)
            })
            .await;
        assert_eq!(result.unwrap(), 2);

        let err = fast_policy(2)
            .attempt(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ProviderFailure>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.cause, ProviderFailure::Timeout { after_ms: 1000 });
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn fetcher_maps_http_statuses_to_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .and(header("referer", "https://finance.sina.com.cn/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"rc\":0}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blank"))
            .respond_with(ResponseTemplate::new(200).set_body_string("  \n"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ok = fetcher
            .fetch_bytes(
                "sina",
                &format!("{}/ok", server.uri()),
                Some("https://finance.sina.com.cn/"),
            )
            .await
            .unwrap();
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, b"{\"rc\":0}");

        let down = fetcher
            .fetch_bytes("sina", &format!("{}/down", server.uri()), None)
            .await
            .unwrap_err();
        assert!(matches!(down, ProviderFailure::HttpStatus { status: 503, .. }));
        assert_eq!(down.class(), FailureClass::Transient);

        let blank = fetcher
            .fetch_bytes("sina", &format!("{}/blank", server.uri()), None)
            .await
            .unwrap_err();
        assert_eq!(blank, ProviderFailure::EmptyPayload);
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_bodies() {
        let dir = tempdir().expect("tempdir");
        let archive = RawArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-03-02T02:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let payload = RawPayload::new("eastmoney", EntityKind::Quote, fetched_at)
            .with_body("application/json", b"{\"data\":{}}".to_vec());

        let first = archive.archive(&payload).await.expect("first archive");
        let second = archive.archive(&payload).await.expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.to_string_lossy().ends_with(".json"));
        assert!(dir.path().join(&first.relative_path).exists());
    }
}
