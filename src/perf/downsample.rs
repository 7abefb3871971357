//! LTTB (Largest Triangle Three Buckets) downsampling
//!
//! Reduces an ordered series to a target length while keeping peaks and
//! valleys. Runs in O(n) and is deterministic: ties keep the earliest point.

use std::borrow::Cow;

use crate::data::{Channel, TelemetryPoint};

/// Downsample `data` to `threshold` points.
///
/// `x` and `y` pick the coordinates of each point. When `threshold < 3` or
/// the input already fits, the input is returned borrowed and untouched.
pub fn lttb<'a, T, X, Y>(data: &'a [T], threshold: usize, x: X, y: Y) -> Cow<'a, [T]>
where
    T: Clone,
    X: Fn(&T) -> f64,
    Y: Fn(&T) -> f64,
{
    profiling::scope!("lttb");

    let n = data.len();
    if threshold < 3 || n <= threshold {
        return Cow::Borrowed(data);
    }

    let mut sampled = Vec::with_capacity(threshold);
    sampled.push(data[0].clone());

    // Interior points split into threshold - 2 buckets
    let every = (n - 2) as f64 / (threshold - 2) as f64;
    let bucket_start = |i: usize| ((i as f64 * every).floor() as usize + 1).min(n - 1);

    let mut a = 0usize;
    for i in 0..threshold - 2 {
        let start = bucket_start(i);
        let end = bucket_start(i + 1);

        // Centroid of the next bucket; the last bucket looks at the final point
        let next_start = end;
        let next_end = if i + 1 >= threshold - 2 {
            n
        } else {
            bucket_start(i + 2)
        };
        let next_len = (next_end - next_start) as f64;
        let (avg_x, avg_y) = data[next_start..next_end]
            .iter()
            .fold((0.0, 0.0), |acc, p| (acc.0 + x(p), acc.1 + y(p)));
        let (avg_x, avg_y) = (avg_x / next_len, avg_y / next_len);

        let (ax, ay) = (x(&data[a]), y(&data[a]));
        let mut max_area = -1.0f64;
        let mut max_idx = start;
        for (j, p) in data.iter().enumerate().take(end).skip(start) {
            let (bx, by) = (x(p), y(p));
            let area = ((ax - avg_x) * (by - ay) - (ax - bx) * (avg_y - ay)).abs() * 0.5;
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        sampled.push(data[max_idx].clone());
        a = max_idx;
    }

    sampled.push(data[n - 1].clone());
    Cow::Owned(sampled)
}

/// LTTB over plain `(x, y)` pairs
pub fn lttb_xy(data: &[(f64, f64)], threshold: usize) -> Cow<'_, [(f64, f64)]> {
    lttb(data, threshold, |p| p.0, |p| p.1)
}

/// Downsample a lap using elapsed time as x and `channel` as y.
///
/// Missing readings count as zero.
pub fn downsample_lap(
    points: &[TelemetryPoint],
    threshold: usize,
    channel: Channel,
) -> Cow<'_, [TelemetryPoint]> {
    let t0 = points.first().map(|p| p.received_at).unwrap_or(0.0);
    lttb(
        points,
        threshold,
        |p| p.received_at - t0,
        |p| p.value(channel).unwrap_or(0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize) -> Vec<(f64, f64)> {
        (0..n).map(|i| (i as f64, (i as f64 * 0.1).sin())).collect()
    }

    #[test]
    fn test_lttb_bounds() {
        let data = sine(1000);
        for threshold in [3, 10, 100, 999] {
            let result = lttb_xy(&data, threshold);
            assert_eq!(result.len(), threshold);
            assert_eq!(result[0], data[0]);
            assert_eq!(result[threshold - 1], data[999]);
        }
    }

    #[test]
    fn test_lttb_passthrough() {
        let data = sine(50);
        assert!(matches!(lttb_xy(&data, 50), Cow::Borrowed(_)));
        assert!(matches!(lttb_xy(&data, 80), Cow::Borrowed(_)));
        assert!(matches!(lttb_xy(&data, 2), Cow::Borrowed(_)));
        assert_eq!(&*lttb_xy(&data, 0), data.as_slice());
    }

    #[test]
    fn test_lttb_output_is_ordered_subset() {
        let data = sine(5000);
        let result = lttb_xy(&data, 300);
        for w in result.windows(2) {
            assert!(w[0].0 < w[1].0);
        }
        for p in result.iter() {
            assert_eq!(data[p.0 as usize], *p);
        }
    }

    #[test]
    fn test_lttb_keeps_spike() {
        let mut data: Vec<(f64, f64)> = (0..1000).map(|i| (i as f64, 0.0)).collect();
        data[500].1 = 100.0;
        data[700].1 = -80.0;
        let result = lttb_xy(&data, 20);
        assert!(result.iter().any(|p| p.1 == 100.0));
        assert!(result.iter().any(|p| p.1 == -80.0));
    }

    #[test]
    fn test_lttb_ties_keep_earliest() {
        // Flat line: every candidate has zero area, so each bucket keeps its first point
        let data: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 1.0)).collect();
        let result = lttb_xy(&data, 4);
        let xs: Vec<f64> = result.iter().map(|p| p.0).collect();
        assert_eq!(xs, vec![0.0, 1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_lttb_is_deterministic() {
        let data = sine(2000);
        assert_eq!(lttb_xy(&data, 123), lttb_xy(&data, 123));
    }

    #[test]
    fn test_downsample_lap_by_channel() {
        let points: Vec<TelemetryPoint> = (0..500)
            .map(|i| {
                let mut p = TelemetryPoint::at(1_000_000.0 + i as f64 * 10.0, 1);
                p.speed = if i == 250 { Some(300.0) } else { Some(100.0) };
                p.throttle = if i % 7 == 0 { None } else { Some(50.0) };
                p
            })
            .collect();

        let by_speed = downsample_lap(&points, 10, Channel::Speed);
        assert_eq!(by_speed.len(), 10);
        assert!(by_speed.iter().any(|p| p.speed == Some(300.0)));
        assert_eq!(by_speed[0], points[0]);
        assert_eq!(by_speed[9], points[499]);

        let by_throttle = downsample_lap(&points, 10, Channel::Throttle);
        assert_eq!(by_throttle.len(), 10);
    }
}
