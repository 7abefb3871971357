pub mod codec;
pub mod point;
pub mod source;
pub mod stats;

// Re-export key types for convenience
pub use point::{
    Channel, CompressedPoint, LapKey, LapMetadata, LapSource, LapTelemetry, SectorTiming,
    TelemetryPoint,
};
pub use source::{ParsedUpload, parse_upload};
pub use stats::compute_metadata;
