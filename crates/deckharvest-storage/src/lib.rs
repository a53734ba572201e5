//! Rate-limited HTTP access, atomic artifact writes and the deck store interface.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

pub mod postgres;
pub mod store;

pub use postgres::PgDeckStore;
pub use store::{DeckStore, MemoryDeckStore};

pub const CRATE_NAME: &str = "deckharvest-storage";

async fn open_temp_sibling(path: &Path) -> anyhow::Result<(PathBuf, fs::File)> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    Ok((temp_path, file))
}

async fn finish_temp(temp_path: &Path, mut file: fs::File, path: &Path) -> anyhow::Result<()> {
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(temp_path, path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Write bytes to `path` through a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<u64> {
    let (temp_path, mut file) = open_temp_sibling(path).await?;
    if let Err(err) = file.write_all(bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }
    finish_temp(&temp_path, file, path).await?;
    Ok(bytes.len() as u64)
}

enum StreamFailure {
    Body(reqwest::Error),
    Io(anyhow::Error),
}

/// Copy a response body chunk by chunk into `path` via a temp file.
async fn stream_atomic(path: &Path, resp: reqwest::Response) -> Result<u64, StreamFailure> {
    let (temp_path, mut file) = open_temp_sibling(path).await.map_err(StreamFailure::Io)?;
    let mut written = 0u64;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let failure = match chunk {
            Ok(bytes) => match file.write_all(&bytes).await {
                Ok(()) => {
                    written += bytes.len() as u64;
                    continue;
                }
                Err(err) => StreamFailure::Io(
                    anyhow::Error::new(err)
                        .context(format!("writing temp file {}", temp_path.display())),
                ),
            },
            Err(err) => StreamFailure::Body(err),
        };
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
        return Err(failure);
    }
    finish_temp(&temp_path, file, path)
        .await
        .map_err(StreamFailure::Io)?;
    Ok(written)
}

/// Minimum-interval pacing for one remote source, shared by every caller targeting it.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    jitter_fraction: f64,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `rate` is in requests per second; zero or negative disables pacing.
    pub fn per_second(rate: f64) -> Self {
        let min_interval = if rate > 0.0 && rate.is_finite() {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            jitter_fraction: 0.1,
            last_request: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::per_second(0.0)
    }

    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the source may be hit again. The lock is held across the sleep so
    /// concurrent callers are released one interval apart.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed + self.jitter();
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn jitter(&self) -> Duration {
        let max = self.min_interval.as_secs_f64() * self.jitter_fraction;
        if max <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::rng().random_range(0.0..=max))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base: f64,
    pub unit: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: 2.0,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// `unit * base^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.unit.as_secs_f64() * self.base.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let jitter = self.max_jitter.as_secs_f64();
        let extra = if jitter > 0.0 {
            rand::rng().random_range(0.0..=jitter)
        } else {
            0.0
        };
        self.delay_for_attempt(attempt_index) + Duration::from_secs_f64(extra)
    }
}

#[derive(Debug, Clone)]
pub struct RequestEngineConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Cooldown used when a 429 carries no usable `Retry-After`.
    pub default_throttle_wait: Duration,
}

impl Default for RequestEngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            default_throttle_wait: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Transport {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempts")]
    HttpStatus {
        url: String,
        status: u16,
        attempts: usize,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl RequestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

enum FailureCause {
    Transport(reqwest::Error),
    Status(u16),
}

impl FailureCause {
    fn into_error(self, url: &str, attempts: usize) -> RequestError {
        match self {
            FailureCause::Transport(source) => RequestError::Transport {
                url: url.to_string(),
                attempts,
                source,
            },
            FailureCause::Status(status) => RequestError::HttpStatus {
                url: url.to_string(),
                status,
                attempts,
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            FailureCause::Transport(err) => err.to_string(),
            FailureCause::Status(status) => format!("http status {status}"),
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Rate-limited GET access to one source: pacing, throttle cooldowns and backoff retries.
#[derive(Debug)]
pub struct RequestEngine {
    client: reqwest::Client,
    source: String,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
    timeout: Duration,
    default_throttle_wait: Duration,
    throttled: AtomicU64,
}

impl RequestEngine {
    pub fn new(
        source: impl Into<String>,
        limiter: Arc<RateLimiter>,
        config: RequestEngineConfig,
    ) -> Result<Self, RequestError> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(RequestError::Client)?;

        Ok(Self {
            client,
            source: source.into(),
            limiter,
            backoff: config.backoff,
            timeout: config.timeout,
            default_throttle_wait: config.default_throttle_wait,
            throttled: AtomicU64::new(0),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Number of 429 responses waited out since this engine was built.
    pub fn throttled_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    pub async fn get(
        &self,
        url: &str,
        params: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, RequestError> {
        let span = info_span!("http_fetch", source = %self.source, url);
        self.get_with_retries(url, params, timeout.unwrap_or(self.timeout))
            .instrument(span)
            .await
    }

    /// Stream a large body straight to `path` (atomically), with the same pacing and retries
    /// as `get`. Returns the number of bytes written.
    pub async fn download_to_file(
        &self,
        url: &str,
        timeout: Option<Duration>,
        path: &Path,
    ) -> anyhow::Result<u64> {
        let span = info_span!("http_download", source = %self.source, url);
        self.download_with_retries(url, timeout.unwrap_or(self.timeout), path)
            .instrument(span)
            .await
    }

    /// One paced attempt. `Ok(None)` means the remote throttled us and the cooldown has passed.
    async fn attempt(
        &self,
        url: &str,
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Option<reqwest::Response>, FailureCause> {
        self.limiter.acquire().await;

        let mut request = self.client.get(url).timeout(timeout);
        if !params.is_empty() {
            request = request.query(params);
        }
        let resp = request.send().await.map_err(FailureCause::Transport)?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = retry_after(resp.headers()).unwrap_or(self.default_throttle_wait);
            self.throttled.fetch_add(1, Ordering::Relaxed);
            warn!(
                source = %self.source,
                wait_secs = wait.as_secs_f64(),
                "rate limited by remote, waiting before retrying"
            );
            tokio::time::sleep(wait).await;
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FailureCause::Status(status.as_u16()));
        }
        Ok(Some(resp))
    }

    /// Sleep before the next attempt, or hand back the final error once retries are spent.
    async fn back_off(
        &self,
        failure: FailureCause,
        attempt: usize,
        url: &str,
    ) -> Result<(), RequestError> {
        let attempts = attempt + 1;
        if attempt >= self.backoff.max_retries {
            error!(
                attempts,
                cause = %failure.describe(),
                "request failed after exhausting retries"
            );
            return Err(failure.into_error(url, attempts));
        }

        let wait = self.backoff.jittered_delay(attempt);
        warn!(
            attempt = attempts,
            max_attempts = self.backoff.max_retries + 1,
            wait_secs = wait.as_secs_f64(),
            cause = %failure.describe(),
            "request failed, retrying"
        );
        tokio::time::sleep(wait).await;
        Ok(())
    }

    async fn get_with_retries(
        &self,
        url: &str,
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<FetchedResponse, RequestError> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.attempt(url, params, timeout).await {
                Ok(None) => continue,
                Ok(Some(resp)) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match resp.bytes().await {
                        Ok(body) => {
                            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body: body.to_vec(),
                            });
                        }
                        Err(err) => FailureCause::Transport(err),
                    }
                }
                Err(cause) => cause,
            };
            self.back_off(failure, attempt, url).await?;
            attempt += 1;
        }
    }

    async fn download_with_retries(
        &self,
        url: &str,
        timeout: Duration,
        path: &Path,
    ) -> anyhow::Result<u64> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.attempt(url, &[], timeout).await {
                Ok(None) => continue,
                Ok(Some(resp)) => match stream_atomic(path, resp).await {
                    Ok(bytes) => {
                        debug!(bytes, path = %path.display(), "downloaded");
                        return Ok(bytes);
                    }
                    Err(StreamFailure::Body(err)) => FailureCause::Transport(err),
                    Err(StreamFailure::Io(err)) => return Err(err),
                },
                Err(cause) => cause,
            };
            self.back_off(failure, attempt, url).await?;
            attempt += 1;
        }
    }
}
