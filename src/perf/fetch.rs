//! Fetch-with-retry used by processing workers.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait initial_backoff
//! attempt 3: wait initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```
//!
//! A definitive client error (4xx) is returned at once; server errors and
//! network failures are retried up to `max_retries` times.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::{PipelineError, Result};

/// Source of raw lap payloads
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Exponential backoff settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(cfg: &FetchConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            backoff_multiplier: cfg.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-indexed)
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or runs out of retries
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let wait = self.backoff(attempt);
                    warn!(attempt = attempt + 1, ?wait, error = %e, "retrying fetch");
                    thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// HTTP fetcher backed by a blocking reqwest client
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            policy: RetryPolicy::from(cfg),
        })
    }

    fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().map_err(|e| PipelineError::Fetch {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch {
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }

        let body = response.bytes().map_err(|e| PipelineError::Fetch {
            status: None,
            message: format!("failed to read body: {}", e),
        })?;
        Ok(body.to_vec())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "fetching lap payload");
        self.policy.run(|| self.fetch_once(url))
    }
}

#[derive(Debug, Clone)]
enum Canned {
    Body(Vec<u8>),
    Status(u16),
}

/// In-memory fetcher serving canned bodies or HTTP statuses
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    routes: RwLock<HashMap<String, Canned>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: Vec<u8>) {
        self.routes.write().insert(url.into(), Canned::Body(body));
    }

    pub fn insert_status(&self, url: impl Into<String>, status: u16) {
        self.routes.write().insert(url.into(), Canned::Status(status));
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        match self.routes.read().get(url) {
            Some(Canned::Body(body)) => Ok(body.clone()),
            Some(Canned::Status(status)) => Err(PipelineError::Fetch {
                status: Some(*status),
                message: format!("HTTP {}", status),
            }),
            None => Err(PipelineError::Fetch {
                status: Some(404),
                message: format!("no route for {}", url),
            }),
        }
    }
}
