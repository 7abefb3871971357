//! Pipeline configuration, loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Explicit worker count; `None` derives it from available parallelism
    pub workers: Option<usize>,
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_workers: constants::pool::MAX_DEFAULT_WORKERS,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..Self::default()
        }
    }

    /// min(available parallelism, max_workers) unless overridden
    pub fn worker_count(&self) -> usize {
        if let Some(n) = self.workers {
            return n.max(1);
        }
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(constants::pool::FALLBACK_WORKERS);
        available.min(self.max_workers).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub chunk_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: constants::worker::DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: constants::fetch::TIMEOUT_MS,
            max_retries: constants::fetch::MAX_RETRIES,
            initial_backoff_ms: constants::fetch::INITIAL_BACKOFF_MS,
            max_backoff_ms: constants::fetch::MAX_BACKOFF_MS,
            backoff_multiplier: constants::fetch::BACKOFF_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// On-disk cache directory; `None` keeps the cache in memory
    pub dir: Option<PathBuf>,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_entries: constants::cache::MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: constants::config::DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = serde_json::from_str(&contents).map_err(|e| {
            PipelineError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path).inspect_err(|e| warn!("{}", e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.chunk_size == 0 {
            return Err(PipelineError::Config("worker.chunk_size must be > 0".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(PipelineError::Config("cache.max_entries must be > 0".into()));
        }
        if self.pool.max_workers == 0 || self.pool.workers == Some(0) {
            return Err(PipelineError::Config("pool needs at least one worker".into()));
        }
        Ok(())
    }
}
