// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::{AggregateKey, Aggregator, StatKind};
use crate::config::{AggregationConfig, Config};
use crate::constants::HOST_DIMENSION;
use crate::metric::{attributes_to_dimensions, canonical_dimensions, DataPoint, Record};
use crate::output::Output;
use crate::pipeline::{Converter, Pipeline};
use std::sync::Arc;
use tracing::debug;

struct StatsAggregation {
    aggregator: Aggregator,
    stats: Vec<StatKind>,
    drop_original: bool,
}

/// Converts gauge and sum data points into records, optionally adding `<name>_<stat>`
/// records derived from the running statistics of each series.
pub struct MetricsConverter {
    hostname: String,
    aggregation: Option<StatsAggregation>,
}

impl MetricsConverter {
    #[must_use]
    pub fn new(hostname: impl Into<String>, aggregation: Option<&AggregationConfig>) -> Self {
        MetricsConverter {
            hostname: hostname.into(),
            aggregation: aggregation.map(|config| StatsAggregation {
                aggregator: Aggregator::new(),
                stats: config.stats.clone(),
                drop_original: config.drop_original,
            }),
        }
    }
}

impl Converter for MetricsConverter {
    type Entry = DataPoint;

    fn convert(&mut self, point: DataPoint, out: &mut Vec<Record>) {
        if point.name.is_empty() {
            debug!("Skipping data point: metric name is empty");
            return;
        }
        let Some(value) = point.value.as_f64() else {
            debug!(
                "Skipping data point of {}: value {} is not numeric",
                point.name, point.value
            );
            return;
        };

        let mut dimensions = attributes_to_dimensions(&point.attributes);

        let mut emit_original = true;
        if let Some(aggregation) = self.aggregation.as_mut() {
            let key = AggregateKey::new(&point.name, canonical_dimensions(&dimensions));
            aggregation
                .aggregator
                .observe(key.clone(), value, point.timestamp);

            dimensions.insert(HOST_DIMENSION.to_string(), self.hostname.clone());
            for stat in &aggregation.stats {
                if let Some(stat_value) = aggregation.aggregator.compute(&key, *stat) {
                    out.push(Record::new(
                        format!("{}_{}", point.name, stat),
                        dimensions.clone(),
                        stat_value,
                        point.timestamp,
                    ));
                }
            }
            emit_original = !aggregation.drop_original;
        } else {
            dimensions.insert(HOST_DIMENSION.to_string(), self.hostname.clone());
        }

        if emit_original {
            out.push(Record::new(point.name, dimensions, value, point.timestamp));
        }
    }

    fn reset(&mut self) {
        if let Some(aggregation) = self.aggregation.as_mut() {
            aggregation.aggregator.reset();
        }
    }
}

pub type MetricsPipeline = Pipeline<MetricsConverter>;

impl Pipeline<MetricsConverter> {
    /// Metrics pipeline reporting under the hostname resolved by `output`.
    #[must_use]
    pub fn for_metrics(output: Arc<Output>, config: &Config) -> Self {
        let converter = MetricsConverter::new(
            output.host_info().hostname.clone(),
            config.aggregation.as_ref(),
        );
        Pipeline::new(converter, output, config)
    }
}
