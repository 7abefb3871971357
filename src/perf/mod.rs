//! Off-thread processing
//!
//! - `downsample`: LTTB, usable synchronously or as a pool task
//! - `fetch`: payload fetching with bounded retry
//! - `worker`: the processing worker and its message protocol
//! - `pool`: priority dispatch over a fixed set of workers

pub mod downsample;
pub mod fetch;
pub mod pool;
pub mod worker;

pub use downsample::{downsample_lap, lttb, lttb_xy};
pub use fetch::{Fetcher, HttpFetcher, MemoryFetcher, RetryPolicy};
pub use pool::{
    PoolStats, Priority, TaskCallbacks, TaskHandle, TaskOutput, TaskRequest, WorkerOutbox,
    WorkerPool,
};
pub use worker::{
    ProcessingWorker, TaskId, ThreadWorkerFactory, WorkerFactory, WorkerHandle, WorkerRequest,
    WorkerResponse,
};

// Re-export profiling macros for convenience
// When no profiling feature is enabled, these become no-ops
pub use profiling;
