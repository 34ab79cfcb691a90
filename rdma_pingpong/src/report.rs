/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Human-readable rendering of a [`Summary`].

use std::fmt;
use std::time::Duration;

use crate::metrics::LatencyReport;
use crate::metrics::Summary;

const SI_SUFFIXES: &[(f64, &str)] = &[
    (1e18, "E"),
    (1e15, "P"),
    (1e12, "T"),
    (1e9, "G"),
    (1e6, "M"),
    (1e3, "k"),
    (1e0, ""),
    (1e-3, "m"),
    (1e-6, "u"),
    (1e-9, "n"),
    (1e-12, "p"),
    (1e-15, "f"),
];

const BINARY_SUFFIXES: &[(f64, &str)] = &[
    ((1u64 << 60) as f64, "Ei"),
    ((1u64 << 50) as f64, "Pi"),
    ((1u64 << 40) as f64, "Ti"),
    ((1u64 << 30) as f64, "Gi"),
    ((1u64 << 20) as f64, "Mi"),
    ((1u64 << 10) as f64, "Ki"),
];

/// Scales `value` into `[1, 1000)` and returns the SI prefix used.
pub fn si_suffix(value: f64) -> (f64, &'static str) {
    SI_SUFFIXES
        .iter()
        .find(|(magnitude, _)| value >= *magnitude)
        .map_or((value, ""), |(magnitude, suffix)| {
            (value / magnitude, *suffix)
        })
}

/// Scales `value` by powers of 1024; values below 1Ki are returned as-is.
pub fn binary_suffix(value: f64) -> (f64, &'static str) {
    BINARY_SUFFIXES
        .iter()
        .find(|(magnitude, _)| value >= *magnitude)
        .map_or((value, ""), |(magnitude, suffix)| {
            (value / magnitude, *suffix)
        })
}

/// Unit system for byte counts and rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Units {
    #[default]
    Si,
    Binary,
}

fn format_rate(elapsed: Duration, bytes: u64, units: Units) -> String {
    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
    let scale = match units {
        Units::Si => si_suffix,
        Units::Binary => binary_suffix,
    };
    let (bytes, b_suffix) = scale(bytes as f64);
    let (throughput, t_suffix) = scale(throughput);
    let (secs, e_suffix) = if secs < 1.0 {
        si_suffix(secs)
    } else {
        (secs, " ")
    };
    format!(
        "{:6.2}{}B in {:<6.1}{}s   {:6.2}{}B/s",
        bytes, b_suffix, secs, e_suffix, throughput, t_suffix
    )
}

/// `"  4.19MB in 1.0    s     4.19MB/s"`
pub fn transfer_rate(elapsed: Duration, bytes: u64) -> String {
    format_rate(elapsed, bytes, Units::Si)
}

/// Like [`transfer_rate`] with `Ki`/`Mi`/... byte suffixes.
pub fn transfer_bin_rate(elapsed: Duration, bytes: u64) -> String {
    format_rate(elapsed, bytes, Units::Binary)
}

fn seconds(d: Duration) -> String {
    let (value, suffix) = si_suffix(d.as_secs_f64());
    format!("{:.2}{}s", value, suffix)
}

/// `"min 1.00ms (#1)  avg 3.00ms  max 5.00ms (#0)"`
pub fn latency_line(report: &LatencyReport) -> String {
    format!(
        "min {} (#{})  avg {}  max {} (#{})",
        seconds(report.min),
        report.min_index,
        seconds(report.avg),
        seconds(report.max),
        report.max_index
    )
}

/// A summary ready for display.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    pub summary: &'a Summary,
    pub units: Units,
}

impl<'a> Report<'a> {
    pub fn new(summary: &'a Summary, units: Units) -> Self {
        Self { summary, units }
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            format_rate(self.summary.elapsed, self.summary.total_bytes, self.units)
        )?;
        if let Some(latency) = &self.summary.latency {
            write!(f, "\nlatency {}", latency_line(latency))?;
        }
        Ok(())
    }
}
