//! Wire codec: gzip inflate and the compressed point array format.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

use super::point::{CompressedPoint, TelemetryPoint};
use crate::error::{PipelineError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Inflate a gzip payload
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    profiling::scope!("gunzip");

    if !is_gzip(bytes) {
        return Err(PipelineError::Decode("payload is not gzip data".to_string()));
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut decompressed = Vec::with_capacity(bytes.len() * 4);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| PipelineError::Decode(e.to_string()))?;
    Ok(decompressed)
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Parse a JSON array of compressed points and expand each one
pub fn decode_points(json: &[u8]) -> Result<Vec<TelemetryPoint>> {
    profiling::scope!("decode_points");

    let compressed: Vec<CompressedPoint> = serde_json::from_slice(json)
        .map_err(|e| PipelineError::Parse(format!("invalid compressed point array: {}", e)))?;
    Ok(compressed.into_iter().map(CompressedPoint::expand).collect())
}

/// Compress points to the wire array and gzip it
pub fn encode_points(points: &[TelemetryPoint]) -> Result<Vec<u8>> {
    let compressed: Vec<CompressedPoint> = points.iter().map(CompressedPoint::from).collect();
    gzip(&serde_json::to_vec(&compressed)?)
}
