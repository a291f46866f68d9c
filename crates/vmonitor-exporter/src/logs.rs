// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logs-to-metrics: configured log attributes are read as monotonically increasing
//! counters and reported as `annd2_<key>_diff` records.

use crate::aggregator::{AggregateKey, CounterDiff};
use crate::config::{Config, LogsToMetricsConfig};
use crate::constants::{HOST_DIMENSION, LOG_METRIC_PREFIX, MISSING_DIMENSION_VALUE};
use crate::metric::{canonical_dimensions, Dimensions, LogEntry, Record};
use crate::output::Output;
use crate::pipeline::{Converter, Pipeline};
use std::sync::Arc;
use tracing::debug;

pub struct LogsConverter {
    hostname: String,
    dimension_keys: Vec<String>,
    value_keys: Vec<String>,
    counters: CounterDiff,
}

impl LogsConverter {
    #[must_use]
    pub fn new(hostname: impl Into<String>, config: &LogsToMetricsConfig) -> Self {
        LogsConverter {
            hostname: hostname.into(),
            dimension_keys: config.dimension_keys.clone(),
            value_keys: config.value_keys.clone(),
            counters: CounterDiff::new(),
        }
    }
}

impl Converter for LogsConverter {
    type Entry = LogEntry;

    fn convert(&mut self, entry: LogEntry, out: &mut Vec<Record>) {
        for value_key in &self.value_keys {
            let Some(value) = entry.attributes.get(value_key).and_then(|v| v.as_f64()) else {
                continue;
            };

            let mut dimensions: Dimensions = self
                .dimension_keys
                .iter()
                .map(|key| {
                    let value = entry
                        .attributes
                        .get(key)
                        .map(ToString::to_string)
                        .filter(|v| !v.is_empty())
                        .unwrap_or_else(|| MISSING_DIMENSION_VALUE.to_string());
                    (key.clone(), value)
                })
                .collect();

            let key = AggregateKey::new(value_key, canonical_dimensions(&dimensions));
            let Some(diff) = self.counters.observe(key, value) else {
                debug!("No diff yet for {} ({})", value_key, value);
                continue;
            };

            dimensions.insert(HOST_DIMENSION.to_string(), self.hostname.clone());
            out.push(Record::new(
                format!("{LOG_METRIC_PREFIX}{value_key}_diff"),
                dimensions,
                diff,
                entry.timestamp,
            ));
        }
    }

    fn reset(&mut self) {
        self.counters.reset();
    }
}

pub type LogsPipeline = Pipeline<LogsConverter>;

impl Pipeline<LogsConverter> {
    /// Logs pipeline reporting under the hostname resolved by `output`.
    #[must_use]
    pub fn for_logs(output: Arc<Output>, config: &Config) -> Self {
        let converter = LogsConverter::new(
            output.host_info().hostname.clone(),
            &config.logs_to_metrics,
        );
        Pipeline::new(converter, output, config)
    }
}
