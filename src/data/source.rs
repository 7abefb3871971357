//! Uploaded file parsing: delimited text with a header row.

use chrono::DateTime;
use csv::ReaderBuilder;
use tracing::{debug, warn};

use super::codec::{gunzip, is_gzip};
use super::point::{Channel, TelemetryPoint};
use crate::error::{PipelineError, Result};

/// What a header column feeds into
#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    ReceivedAt,
    DeviceTime,
    Lap,
    Channel(Channel),
}

impl Field {
    fn from_header(name: &str) -> Option<Field> {
        let name = name.trim();
        const RECEIVED: [&str; 3] = ["received_at", "meta_time", "time"];
        const DEVICE: [&str; 2] = ["device_time", "timestamp"];
        if RECEIVED.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            Some(Field::ReceivedAt)
        } else if DEVICE.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            Some(Field::DeviceTime)
        } else if name.eq_ignore_ascii_case("lap") {
            Some(Field::Lap)
        } else {
            Channel::from_name(name).map(Field::Channel)
        }
    }
}

/// Result of parsing an upload
#[derive(Debug)]
pub struct ParsedUpload {
    pub points: Vec<TelemetryPoint>,
    /// Rows dropped for a column-count mismatch or missing time
    pub skipped_rows: usize,
}

/// Decode and parse an uploaded telemetry file.
///
/// `.gz` uploads (or gzip magic bytes) are inflated first.
pub fn parse_upload(bytes: &[u8], filename: &str) -> Result<ParsedUpload> {
    profiling::scope!("parse_upload");

    let inflated;
    let bytes = if filename.to_ascii_lowercase().ends_with(".gz") || is_gzip(bytes) {
        inflated = gunzip(bytes)?;
        &inflated[..]
    } else {
        bytes
    };

    let text = std::str::from_utf8(bytes)
        .map_err(|e| PipelineError::Decode(format!("{} is not valid UTF-8: {}", filename, e)))?;
    parse_delimited(text.trim_start_matches('\u{feff}'))
}

/// Pick the delimiter that appears most in the header line
fn sniff_delimiter(header: &str) -> u8 {
    [b';', b'\t', b',']
        .into_iter()
        .max_by_key(|&d| header.bytes().filter(|&b| b == d).count())
        .filter(|&d| header.bytes().any(|b| b == d))
        .unwrap_or(b',')
}

/// Parse delimited text whose first line is a header
pub fn parse_delimited(text: &str) -> Result<ParsedUpload> {
    let header_line = text.lines().next().unwrap_or_default();
    if header_line.trim().is_empty() {
        return Err(PipelineError::Parse("file is empty".to_string()));
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(sniff_delimiter(header_line))
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| PipelineError::Parse(format!("unreadable header: {}", e)))?
        .clone();
    let fields: Vec<Option<Field>> = headers.iter().map(Field::from_header).collect();

    let has_time = fields
        .iter()
        .any(|f| matches!(f, Some(Field::ReceivedAt) | Some(Field::DeviceTime)));
    if !has_time {
        return Err(PipelineError::Parse(
            "header has no time column (expected received_at/meta_time or device_time/timestamp)"
                .to_string(),
        ));
    }

    let mut points = Vec::new();
    let mut skipped_rows = 0usize;

    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("skipping unreadable row: {}", e);
                skipped_rows += 1;
                continue;
            }
        };
        if record.len() != headers.len() {
            skipped_rows += 1;
            continue;
        }
        match parse_row(&fields, &record) {
            Some(point) => points.push(point),
            None => skipped_rows += 1,
        }
    }

    if skipped_rows > 0 {
        warn!(
            skipped_rows,
            expected_columns = headers.len(),
            "skipped malformed rows while parsing upload"
        );
    }
    if points.is_empty() {
        return Err(PipelineError::Parse("no valid telemetry rows".to_string()));
    }

    Ok(ParsedUpload {
        points,
        skipped_rows,
    })
}

fn parse_row(fields: &[Option<Field>], record: &csv::StringRecord) -> Option<TelemetryPoint> {
    let mut point = TelemetryPoint::at(f64::NAN, 0);
    let mut received = None;

    for (field, cell) in fields.iter().zip(record.iter()) {
        let Some(field) = field else { continue };
        match field {
            Field::ReceivedAt => received = parse_time(cell),
            Field::DeviceTime => point.device_time = parse_time(cell),
            Field::Lap => point.lap = parse_number(cell).map(|v| v as u32).unwrap_or(0),
            Field::Channel(channel) => *point.value_mut(*channel) = parse_number(cell),
        }
    }

    point.received_at = received.or(point.device_time)?;
    Some(point)
}

/// Empty and "null" cells are absent readings
fn is_null_token(cell: &str) -> bool {
    cell.is_empty() || cell.eq_ignore_ascii_case("null") || cell.eq_ignore_ascii_case("nan")
}

fn parse_number(cell: &str) -> Option<f64> {
    if is_null_token(cell) {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Milliseconds since epoch, from a number or an RFC 3339 string
fn parse_time(cell: &str) -> Option<f64> {
    parse_number(cell).or_else(|| {
        DateTime::parse_from_rfc3339(cell)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64)
    })
}
