//! Per-request timing breakdowns.
//!
//! The transport reports cumulative marks measured from the start of a
//! transfer ([`Timings`]). [`TimingBreakdown`] turns them into per-phase
//! durations and their share of the total.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// Cumulative timing marks of a transfer, each measured from its start.
///
/// Every mark is at most `total`. Marks the transport cannot observe
/// coincide with the previous one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Timings {
    /// Name resolution finished
    pub namelookup: Duration,
    /// Connection established
    pub connect: Duration,
    /// TLS handshake finished, request about to be sent
    pub pretransfer: Duration,
    /// First response byte received
    pub starttransfer: Duration,
    /// Time spent on redirects before the final request
    pub redirect: Duration,
    /// Whole transfer including the body
    pub total: Duration,
}

impl Timings {
    /// Clamp every mark so the marks are monotonic and bounded by `total`
    #[must_use]
    pub fn normalized(self) -> Self {
        let total = self.total;
        let namelookup = self.namelookup.min(total);
        let connect = self.connect.clamp(namelookup, total);
        let pretransfer = self.pretransfer.clamp(connect, total);
        let starttransfer = self.starttransfer.clamp(pretransfer, total);
        Self {
            namelookup,
            connect,
            pretransfer,
            starttransfer,
            redirect: self.redirect.min(total),
            total,
        }
    }
}

/// Duration of a single phase and its share of the total
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseStat {
    /// Duration of the phase
    #[serde(with = "humantime_serde")]
    pub time: Duration,
    /// Share of the total duration in percent; `0.0` if the total is zero
    pub percent: f64,
}

impl PhaseStat {
    fn new(time: Duration, total: Duration) -> Self {
        let percent = if total.is_zero() {
            0.0
        } else {
            time.as_secs_f64() / total.as_secs_f64() * 100.0
        };
        Self { time, percent }
    }
}

/// Per-phase timing breakdown of a single request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingBreakdown {
    /// DNS resolution
    pub dns: PhaseStat,
    /// TCP connect
    pub connect: PhaseStat,
    /// TLS handshake
    pub tls: PhaseStat,
    /// Waiting for the first byte after sending the request
    pub wait: PhaseStat,
    /// Receiving the response body
    pub transfer: PhaseStat,
    /// Following redirects
    pub redirect: PhaseStat,
    /// Whole transfer
    #[serde(with = "humantime_serde")]
    pub total: Duration,
}

impl From<&Timings> for TimingBreakdown {
    fn from(timings: &Timings) -> Self {
        let t = timings.normalized();
        let total = t.total;
        Self {
            dns: PhaseStat::new(t.namelookup, total),
            connect: PhaseStat::new(t.connect - t.namelookup, total),
            tls: PhaseStat::new(t.pretransfer - t.connect, total),
            wait: PhaseStat::new(t.starttransfer - t.pretransfer, total),
            transfer: PhaseStat::new(t.total - t.starttransfer, total),
            redirect: PhaseStat::new(t.redirect, total),
            total,
        }
    }
}

/// Timing breakdowns of every recorded request, by key
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsCollector {
    by_key: HashMap<String, TimingBreakdown>,
}

impl StatsCollector {
    /// Create an empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the timings of a drained request, replacing earlier ones
    pub fn record(&mut self, key: &str, timings: &Timings) {
        self.by_key
            .insert(key.to_string(), TimingBreakdown::from(timings));
    }

    /// Breakdown of a single request
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TimingBreakdown> {
        self.by_key.get(key)
    }

    /// Iterate over all recorded breakdowns
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TimingBreakdown)> {
        self.by_key.iter()
    }

    /// Number of recorded requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Forget all recorded breakdowns
    pub fn clear(&mut self) {
        self.by_key.clear();
    }

    /// Get average total request time
    #[must_use]
    pub fn average_total(&self) -> Option<Duration> {
        if self.by_key.is_empty() {
            return None;
        }

        let total: Duration = self.by_key.values().map(|b| b.total).sum();
        #[allow(clippy::cast_possible_truncation)]
        Some(total / (self.by_key.len() as u32))
    }

    /// Get median total request time
    #[must_use]
    pub fn median_total(&self) -> Option<Duration> {
        if self.by_key.is_empty() {
            return None;
        }

        let mut times: Vec<_> = self.by_key.values().map(|b| b.total).collect();
        times.sort();
        let mid = times.len() / 2;

        if times.len().is_multiple_of(2) {
            // Average of two middle values
            Some((times[mid - 1] + times[mid]) / 2)
        } else {
            Some(times[mid])
        }
    }
}
