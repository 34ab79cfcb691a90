/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Elapsed time, throughput and per-half latency statistics.

use std::time::Duration;
use std::time::Instant;

/// Bytes moved by `iterations` full cycles of `size`-byte halves, or
/// `None` if that does not fit a `u64`.
pub fn total_bytes(size: usize, iterations: usize) -> Option<u64> {
    (iterations as u64)
        .checked_mul(2)?
        .checked_mul(size as u64)
}

/// Latency statistics over the per-half deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    /// `deltas[0]` is measured from the session start, every other entry
    /// from the previous timestamp.
    pub deltas: Vec<Duration>,
    pub min: Duration,
    pub min_index: usize,
    pub max: Duration,
    pub max_index: usize,
    pub avg: Duration,
}

impl LatencyReport {
    pub fn from_timestamps(start: Instant, latencies: &[Instant]) -> Option<Self> {
        let mut previous = start;
        let deltas: Vec<Duration> = latencies
            .iter()
            .map(|t| {
                let delta = t.saturating_duration_since(previous);
                previous = *t;
                delta
            })
            .collect();

        // Ties keep the earliest index.
        let (min_index, min) = deltas
            .iter()
            .copied()
            .enumerate()
            .reduce(|best, cur| if cur.1 < best.1 { cur } else { best })?;
        let (max_index, max) = deltas
            .iter()
            .copied()
            .enumerate()
            .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })?;
        let sum: f64 = deltas.iter().map(Duration::as_secs_f64).sum();
        let avg = Duration::from_secs_f64(sum / deltas.len() as f64);

        Some(Self {
            deltas,
            min,
            min_index,
            max,
            max_index,
            avg,
        })
    }
}

/// Result of [`summarize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub elapsed: Duration,
    pub total_bytes: u64,
    /// Bytes per second; zero when no time elapsed.
    pub throughput: f64,
    /// `None` for an empty timestamp series.
    pub latency: Option<LatencyReport>,
}

/// Pure function over a finished session's measurements.
pub fn summarize(start: Instant, end: Instant, total_bytes: u64, latencies: &[Instant]) -> Summary {
    let elapsed = end.saturating_duration_since(start);
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 {
        total_bytes as f64 / secs
    } else {
        0.0
    };
    Summary {
        elapsed,
        total_bytes,
        throughput,
        latency: LatencyReport::from_timestamps(start, latencies),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_formula() {
        let start = Instant::now();
        let end = start + Duration::from_secs(1);
        let bytes = total_bytes(4096, 512).unwrap();
        assert_eq!(bytes, 4_194_304);
        assert_eq!(total_bytes(usize::MAX, 2), None);
        let summary = summarize(start, end, bytes, &[]);
        assert_eq!(summary.elapsed, Duration::from_secs(1));
        assert!((summary.throughput - 4_194_304.0).abs() < 1e-6);
        assert!(summary.latency.is_none());
    }

    #[test]
    fn test_zero_elapsed_has_zero_throughput() {
        let start = Instant::now();
        let summary = summarize(start, start, 1024, &[start]);
        assert_eq!(summary.throughput, 0.0);
        let latency = summary.latency.unwrap();
        assert_eq!(latency.deltas, vec![Duration::ZERO]);
    }

    #[test]
    fn test_latency_indexing() {
        let start = Instant::now();
        let ms = Duration::from_millis;
        let stamps = [start + ms(5), start + ms(6), start + ms(10), start + ms(12)];
        let report = summarize(start, start + ms(12), 64, &stamps)
            .latency
            .unwrap();

        assert_eq!(report.deltas, vec![ms(5), ms(1), ms(4), ms(2)]);
        assert_eq!((report.min, report.min_index), (ms(1), 1));
        assert_eq!((report.max, report.max_index), (ms(5), 0));

        let mean = report.deltas.iter().map(Duration::as_secs_f64).sum::<f64>()
            / report.deltas.len() as f64;
        assert!((report.avg.as_secs_f64() - mean).abs() < 1e-9);
        assert!((report.avg.as_secs_f64() - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_ties_keep_first_index() {
        let start = Instant::now();
        let ms = Duration::from_millis;
        let stamps = [start + ms(2), start + ms(4), start + ms(6)];
        let report = LatencyReport::from_timestamps(start, &stamps).unwrap();
        assert_eq!(report.min_index, 0);
        assert_eq!(report.max_index, 0);
    }
}
