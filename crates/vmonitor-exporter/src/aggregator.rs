// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming statistics per (metric name, dimension set).
//!
//! Nothing here keeps raw history: every series is reduced to a fixed-size
//! [`RunningStats`] updated with Welford's algorithm, so memory grows with the
//! number of distinct series only.

use crate::errors::ParseStatError;
use derive_more::Display;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde::Deserialize;
use std::str::FromStr;
use ustr::Ustr;

/// A statistic derivable from [`RunningStats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    #[display("count")]
    Count,
    #[display("min")]
    Min,
    #[display("max")]
    Max,
    #[display("mean")]
    Mean,
    #[display("sum")]
    Sum,
    #[display("s2")]
    S2,
    #[display("stdev")]
    Stdev,
    #[display("diff")]
    Diff,
    #[display("rate")]
    Rate,
    #[display("non_negative_diff")]
    NonNegativeDiff,
    #[display("non_negative_rate")]
    NonNegativeRate,
    #[display("interval")]
    Interval,
}

impl FromStr for StatKind {
    type Err = ParseStatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "count" => Ok(StatKind::Count),
            "min" => Ok(StatKind::Min),
            "max" => Ok(StatKind::Max),
            "mean" => Ok(StatKind::Mean),
            "sum" => Ok(StatKind::Sum),
            "s2" => Ok(StatKind::S2),
            "stdev" => Ok(StatKind::Stdev),
            "diff" => Ok(StatKind::Diff),
            "rate" => Ok(StatKind::Rate),
            "non_negative_diff" => Ok(StatKind::NonNegativeDiff),
            "non_negative_rate" => Ok(StatKind::NonNegativeRate),
            "interval" => Ok(StatKind::Interval),
            other => Err(ParseStatError(other.to_string())),
        }
    }
}

/// Identity of a series: metric name plus canonical dimension string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub name: Ustr,
    pub dimensions: String,
}

impl AggregateKey {
    #[must_use]
    pub fn new(name: &str, dimensions: impl Into<String>) -> Self {
        AggregateKey {
            name: Ustr::from(name),
            dimensions: dimensions.into(),
        }
    }
}

/// Running statistics of one series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunningStats {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
    mean: f64,
    m2: f64,
    diff: f64,
    rate: f64,
    interval_ms: i64,
    last: f64,
    last_timestamp: i64,
}

impl RunningStats {
    fn new(value: f64, timestamp: i64) -> Self {
        RunningStats {
            count: 1,
            min: value,
            max: value,
            sum: value,
            mean: value,
            m2: 0.0,
            diff: 0.0,
            rate: 0.0,
            interval_ms: 0,
            last: value,
            last_timestamp: timestamp,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, value: f64, timestamp: i64) {
        self.count += 1;

        // https://en.wikipedia.org/wiki/Algorithms_for_calculating_variance
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        if value < self.min {
            self.min = value;
        } else if value > self.max {
            self.max = value;
        }

        self.sum += value;
        self.diff = value - self.last;
        self.interval_ms = timestamp - self.last_timestamp;
        if self.interval_ms != 0 {
            self.rate = self.diff / (self.interval_ms as f64 / 1_000.0);
        }
        self.last = value;
        self.last_timestamp = timestamp;
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Value of `stat`, or `None` while there are not enough observations for it.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self, stat: StatKind) -> Option<f64> {
        let has_pair = self.count > 1;
        match stat {
            StatKind::Count => Some(self.count as f64),
            StatKind::Min => Some(self.min),
            StatKind::Max => Some(self.max),
            StatKind::Mean => Some(self.mean),
            StatKind::Sum => Some(self.sum),
            StatKind::S2 => has_pair.then(|| self.m2 / (self.count - 1) as f64),
            StatKind::Stdev => has_pair.then(|| (self.m2 / (self.count - 1) as f64).sqrt()),
            StatKind::Diff => has_pair.then_some(self.diff),
            StatKind::Rate => has_pair.then_some(self.rate),
            StatKind::NonNegativeDiff => (has_pair && self.diff >= 0.0).then_some(self.diff),
            StatKind::NonNegativeRate => (has_pair && self.diff >= 0.0).then_some(self.rate),
            StatKind::Interval => {
                has_pair.then(|| self.interval_ms.saturating_mul(1_000_000) as f64)
            }
        }
    }
}

/// Owns one [`RunningStats`] per series. Callers serialize access.
#[derive(Debug, Default)]
pub struct Aggregator {
    series: HashMap<AggregateKey, RunningStats, FnvBuildHasher>,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one observation into the series identified by `key`, creating it on first sight.
    pub fn observe(&mut self, key: AggregateKey, value: f64, timestamp: i64) {
        match self.series.get_mut(&key) {
            Some(stats) => stats.push(value, timestamp),
            None => {
                self.series.insert(key, RunningStats::new(value, timestamp));
            }
        }
    }

    #[must_use]
    pub fn compute(&self, key: &AggregateKey, stat: StatKind) -> Option<f64> {
        self.series.get(key).and_then(|stats| stats.value(stat))
    }

    #[must_use]
    pub fn get(&self, key: &AggregateKey) -> Option<&RunningStats> {
        self.series.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn reset(&mut self) {
        self.series.clear();
    }
}

#[derive(Clone, Copy, Debug)]
struct CounterState {
    count: u64,
    last: f64,
    diff: f64,
}

/// Tracks monotonically non-decreasing counters and exposes only their diff.
///
/// A decrease is taken as a counter reset: the point is suppressed rather than
/// reported as a negative delta.
#[derive(Debug, Default)]
pub struct CounterDiff {
    series: HashMap<AggregateKey, CounterState, FnvBuildHasher>,
}

impl CounterDiff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` and returns the diff against the previous value of the series,
    /// or `None` on the first observation and on counter resets.
    pub fn observe(&mut self, key: AggregateKey, value: f64) -> Option<f64> {
        let state = self
            .series
            .entry(key)
            .and_modify(|state| {
                state.count += 1;
                state.diff = value - state.last;
                state.last = value;
            })
            .or_insert(CounterState {
                count: 1,
                last: value,
                diff: 0.0,
            });

        (state.count > 1 && state.diff >= 0.0).then_some(state.diff)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn reset(&mut self) {
        self.series.clear();
    }
}
