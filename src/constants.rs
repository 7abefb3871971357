//! Pipeline-wide constants and default values
//!
//! This module centralizes the magic numbers used by the worker pool,
//! processing workers and lap cache, making them easier to maintain and configure.

/// Worker pool sizing
pub mod pool {
    /// Upper bound on the default worker count
    pub const MAX_DEFAULT_WORKERS: usize = 4;

    /// Worker count used when available parallelism cannot be queried
    pub const FALLBACK_WORKERS: usize = 2;
}

/// Processing worker defaults
pub mod worker {
    /// Points per streamed chunk
    pub const DEFAULT_CHUNK_SIZE: usize = 1000;

    /// Default target for downsample requests
    pub const DEFAULT_DOWNSAMPLE_TARGET: usize = 2000;
}

/// Progress milestones reported by workers (percent)
pub mod progress {
    pub const START: u8 = 0;
    pub const FETCHED: u8 = 30;
    pub const DECOMPRESSED: u8 = 45;
    pub const UPLOAD_DECODED: u8 = 20;
    pub const DONE: u8 = 100;
}

/// Persistent cache defaults
pub mod cache {
    /// Maximum number of cached laps
    pub const MAX_ENTRIES: usize = 20;

    /// On-disk schema version; bumping it wipes existing entries
    pub const SCHEMA_VERSION: u32 = 1;

    /// Estimated serialized size of one telemetry point
    pub const BYTES_PER_POINT: u64 = 200;

    /// Fixed per-entry overhead in the size estimate
    pub const ENTRY_OVERHEAD_BYTES: u64 = 1024;
}

/// Fetch retry defaults
pub mod fetch {
    /// Per-request timeout
    pub const TIMEOUT_MS: u64 = 30_000;

    /// Retries after the first attempt
    pub const MAX_RETRIES: usize = 3;

    pub const INITIAL_BACKOFF_MS: u64 = 250;
    pub const MAX_BACKOFF_MS: u64 = 8_000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
}

/// Lap analysis constants
pub mod lap {
    /// Number of sectors a lap is split into
    pub const SECTOR_COUNT: usize = 3;
}

/// Configuration file paths
pub mod config {
    /// Configuration file name
    pub const CONFIG_FILE: &str = "lap-oxide.json";

    /// Default lap data server
    pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/telemetry";
}
