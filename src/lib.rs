//! lap-oxide: off-thread telemetry lap pipeline
//!
//! Fetches gzip'd compressed lap payloads (or parses uploaded logger files)
//! on a pool of worker threads, streams the points back in ordered chunks,
//! downsamples them with LTTB and keeps finished laps in a persistent LRU
//! cache.

pub mod clock;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod lap_cache;
pub mod loader;
pub mod perf;
pub mod storage;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, Result};
pub use lap_cache::{CacheStats, LapCache};
pub use loader::LapLoader;
pub use perf::{Priority, TaskCallbacks, TaskHandle, TaskOutput, TaskRequest, WorkerPool};
