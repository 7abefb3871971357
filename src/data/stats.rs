use crate::constants::lap::SECTOR_COUNT;

use super::point::{LapMetadata, SectorTiming, TelemetryPoint};

/// Summary metadata for a point sequence.
///
/// Duration is the receipt-time delta between the first and last point.
/// Speed statistics skip points without a speed reading.
pub fn compute_metadata(points: &[TelemetryPoint]) -> LapMetadata {
    profiling::scope!("compute_metadata");

    let duration_ms = match (points.first(), points.last()) {
        (Some(first), Some(last)) => (last.received_at - first.received_at).max(0.0),
        _ => 0.0,
    };

    let mut max_speed: Option<f64> = None;
    let mut sum = 0.0;
    let mut count = 0usize;
    for speed in points.iter().filter_map(|p| p.speed) {
        max_speed = Some(max_speed.map_or(speed, |m| m.max(speed)));
        sum += speed;
        count += 1;
    }

    LapMetadata {
        duration_ms,
        max_speed,
        avg_speed: (count > 0).then(|| sum / count as f64),
        point_count: points.len(),
    }
}

/// Split a lap into equal sectors.
///
/// Boundaries follow lap distance when every point carries it, otherwise
/// the lap is cut by point index.
pub fn sector_timings(points: &[TelemetryPoint]) -> Vec<SectorTiming> {
    if points.len() < SECTOR_COUNT + 1 {
        return Vec::new();
    }

    let distances: Option<Vec<f64>> = points.iter().map(|p| p.lap_distance).collect();
    let boundaries: Vec<usize> = match distances {
        Some(d) => distance_boundaries(&d),
        None => index_boundaries(points.len()),
    };

    boundaries
        .windows(2)
        .enumerate()
        .map(|(i, w)| {
            let start_ms = points[w[0]].received_at;
            let end_ms = points[w[1]].received_at;
            SectorTiming {
                sector: i + 1,
                start_ms,
                end_ms,
                duration_ms: (end_ms - start_ms).max(0.0),
            }
        })
        .collect()
}

fn index_boundaries(len: usize) -> Vec<usize> {
    let last = len - 1;
    (0..=SECTOR_COUNT).map(|i| i * last / SECTOR_COUNT).collect()
}

fn distance_boundaries(distances: &[f64]) -> Vec<usize> {
    let start = distances[0];
    let total = distances[distances.len() - 1] - start;
    if total <= 0.0 {
        return index_boundaries(distances.len());
    }

    let mut boundaries = vec![0];
    for s in 1..SECTOR_COUNT {
        let target = start + total * s as f64 / SECTOR_COUNT as f64;
        let prev = *boundaries.last().unwrap_or(&0);
        let idx = distances[prev..]
            .iter()
            .position(|&d| d >= target)
            .map(|i| prev + i)
            .unwrap_or(distances.len() - 1);
        boundaries.push(idx);
    }
    boundaries.push(distances.len() - 1);
    boundaries
}
