// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::StatKind;
use crate::constants;
use crate::errors::ConfigError;
use serde::{Deserialize, Deserializer};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Compression applied to series payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    #[serde(alias = "")]
    Identity,
    Gzip,
    Zstd,
}

impl ContentEncoding {
    /// Value of the `Content-Encoding` header, if one is sent.
    #[must_use]
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            ContentEncoding::Identity => None,
            ContentEncoding::Gzip => Some("gzip"),
            ContentEncoding::Zstd => Some("zstd"),
        }
    }
}

impl FromStr for ContentEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "identity" => Ok(ContentEncoding::Identity),
            "gzip" => Ok(ContentEncoding::Gzip),
            "zstd" => Ok(ContentEncoding::Zstd),
            _ => Err(ConfigError::ContentEncoding(s.to_string())),
        }
    }
}

/// Outbound proxy selection. The system proxy wins over an explicit URL; with neither set
/// the client connects directly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub use_system_proxy: bool,
    pub http_proxy_url: Option<String>,
}

impl ProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.use_system_proxy {
            return Ok(());
        }
        if let Some(proxy_url) = self.http_proxy_url.as_deref().filter(|u| !u.is_empty()) {
            Url::parse(proxy_url).map_err(|source| ConfigError::Proxy {
                url: proxy_url.to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Derived statistics emitted next to (or instead of) raw data points.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub stats: Vec<StatKind>,
    pub drop_original: bool,
}

/// Which log attributes become dimensions and which become counter values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogsToMetricsConfig {
    pub dimension_keys: Vec<String>,
    pub value_keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: String,
    pub iam_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Overrides the system hostname in the `host` dimension and the host fingerprint.
    pub hostname: Option<String>,
    pub content_encoding: ContentEncoding,
    pub metric_batch_size: usize,
    pub metric_buffer_limit: usize,
    /// Pause between two batches of the same drain cycle.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub flush_interval: Duration,
    #[serde(deserialize_with = "deserialize_seconds")]
    pub timeout: Duration,
    /// Base unit of the backoff window after a quota conflict.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub quota_retry_interval: Duration,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
    pub aggregation: Option<AggregationConfig>,
    pub logs_to_metrics: LogsToMetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: constants::DEFAULT_ENDPOINT.to_string(),
            iam_url: constants::DEFAULT_IAM_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            hostname: None,
            content_encoding: ContentEncoding::Identity,
            metric_batch_size: constants::DEFAULT_METRIC_BATCH_SIZE,
            metric_buffer_limit: constants::DEFAULT_METRIC_BUFFER_LIMIT,
            flush_interval: Duration::ZERO,
            timeout: constants::DEFAULT_TIMEOUT,
            quota_retry_interval: constants::DEFAULT_QUOTA_RETRY_INTERVAL,
            proxy: ProxyConfig::default(),
            aggregation: None,
            logs_to_metrics: LogsToMetricsConfig::default(),
        }
    }
}

fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_value(key, value)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Builds the configuration from `VMONITOR_*` environment variables, then finalizes it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(v) = lookup("VMONITOR_ENDPOINT") {
            config.endpoint = v;
        }
        if let Some(v) = lookup("VMONITOR_IAM_URL") {
            config.iam_url = v;
        }
        if let Some(v) = lookup("VMONITOR_CLIENT_ID") {
            config.client_id = v;
        }
        if let Some(v) = lookup("VMONITOR_CLIENT_SECRET") {
            config.client_secret = v;
        }
        config.hostname = lookup("VMONITOR_HOSTNAME").filter(|h| !h.trim().is_empty());
        if let Some(v) = lookup("VMONITOR_CONTENT_ENCODING") {
            config.content_encoding = v.parse()?;
        }
        if let Some(v) = lookup("VMONITOR_METRIC_BATCH_SIZE") {
            config.metric_batch_size = parse_value("VMONITOR_METRIC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("VMONITOR_METRIC_BUFFER_LIMIT") {
            config.metric_buffer_limit = parse_value("VMONITOR_METRIC_BUFFER_LIMIT", &v)?;
        }
        if let Some(v) = lookup("VMONITOR_FLUSH_INTERVAL") {
            config.flush_interval = parse_seconds("VMONITOR_FLUSH_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("VMONITOR_TIMEOUT") {
            config.timeout = parse_seconds("VMONITOR_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("VMONITOR_QUOTA_RETRY_INTERVAL") {
            config.quota_retry_interval = parse_seconds("VMONITOR_QUOTA_RETRY_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("VMONITOR_USE_SYSTEM_PROXY") {
            config.proxy.use_system_proxy = parse_bool("VMONITOR_USE_SYSTEM_PROXY", &v)?;
        }
        config.proxy.http_proxy_url =
            lookup("VMONITOR_HTTP_PROXY_URL").filter(|u| !u.trim().is_empty());

        if let Some(v) = lookup("VMONITOR_AGGREGATION_STATS") {
            let stats = parse_list(&v)
                .iter()
                .map(|s| s.parse::<StatKind>())
                .collect::<Result<Vec<_>, _>>()?;
            let drop_original = match lookup("VMONITOR_DROP_ORIGINAL") {
                Some(d) => parse_bool("VMONITOR_DROP_ORIGINAL", &d)?,
                None => false,
            };
            config.aggregation = Some(AggregationConfig {
                stats,
                drop_original,
            });
        }

        if let Some(v) = lookup("VMONITOR_LOGS_DIMENSION_KEYS") {
            config.logs_to_metrics.dimension_keys = parse_list(&v);
        }
        if let Some(v) = lookup("VMONITOR_LOGS_VALUE_KEYS") {
            config.logs_to_metrics.value_keys = parse_list(&v);
        }

        config.finalize()
    }

    /// Fills empty URLs with their defaults and validates the result.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.endpoint.trim().is_empty() {
            warn!(
                "Invalid endpoint, set to default: {}",
                constants::DEFAULT_ENDPOINT
            );
            self.endpoint = constants::DEFAULT_ENDPOINT.to_string();
        }
        if self.iam_url.trim().is_empty() {
            warn!(
                "Invalid iam_url, set to default: {}",
                constants::DEFAULT_IAM_URL
            );
            self.iam_url = constants::DEFAULT_IAM_URL.to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        parse_endpoint(&self.endpoint)?;
        parse_endpoint(&self.iam_url)?;

        if self.metric_batch_size == 0 {
            return Err(ConfigError::NotPositive("metric_batch_size"));
        }
        if self.metric_buffer_limit == 0 {
            return Err(ConfigError::NotPositive("metric_buffer_limit"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NotPositive("timeout"));
        }
        if self.quota_retry_interval > constants::MAX_QUOTA_RETRY_INTERVAL {
            return Err(ConfigError::TooLarge {
                key: "quota_retry_interval",
                max: constants::MAX_QUOTA_RETRY_INTERVAL,
            });
        }
        if let Some(aggregation) = &self.aggregation {
            if aggregation.stats.is_empty() {
                return Err(ConfigError::EmptyStats);
            }
        }
        self.proxy.validate()
    }
}

/// Parses `raw` and requires both a scheme and a host.
pub(crate) fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;
    if url.scheme().is_empty() || url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> Config {
        Config {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            ..Default::default()
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_requires_credentials() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingCredentials)
        ));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_urls_fall_back_to_defaults() {
        let config = Config {
            endpoint: String::new(),
            iam_url: "  ".to_string(),
            ..valid()
        }
        .finalize()
        .unwrap();
        assert_eq!(config.endpoint, constants::DEFAULT_ENDPOINT);
        assert_eq!(config.iam_url, constants::DEFAULT_IAM_URL);
    }

    #[test]
    fn test_invalid_urls() {
        for endpoint in ["localhost", "not a url", "file:///tmp/x"] {
            let config = Config {
                endpoint: endpoint.to_string(),
                ..valid()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidUrl(_))),
                "{endpoint} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = Config {
            metric_batch_size: 0,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("metric_batch_size"))
        ));

        let config = Config {
            metric_buffer_limit: 0,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("metric_buffer_limit"))
        ));
    }

    #[test]
    fn test_oversized_quota_retry_interval_rejected() {
        let config = Config {
            quota_retry_interval: Duration::from_secs_f64(1e17),
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge {
                key: "quota_retry_interval",
                ..
            })
        ));

        let err = Config::from_lookup(lookup(&[
            ("VMONITOR_CLIENT_ID", "id"),
            ("VMONITOR_CLIENT_SECRET", "secret"),
            ("VMONITOR_QUOTA_RETRY_INTERVAL", "1e17"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge { .. }));

        let config = Config {
            quota_retry_interval: constants::MAX_QUOTA_RETRY_INTERVAL,
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_stats_rejected() {
        let config = Config {
            aggregation: Some(AggregationConfig::default()),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyStats)));
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let config = Config {
            proxy: ProxyConfig {
                use_system_proxy: false,
                http_proxy_url: Some("::bad::".to_string()),
            },
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Proxy { .. })));
    }

    #[test]
    fn test_content_encoding_parse() {
        assert_eq!(
            "".parse::<ContentEncoding>().unwrap(),
            ContentEncoding::Identity
        );
        assert_eq!(
            "GZIP".parse::<ContentEncoding>().unwrap(),
            ContentEncoding::Gzip
        );
        assert_eq!(ContentEncoding::Zstd.header_value(), Some("zstd"));
        assert!("br".parse::<ContentEncoding>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("VMONITOR_CLIENT_ID", "id"),
            ("VMONITOR_CLIENT_SECRET", "secret"),
            ("VMONITOR_ENDPOINT", "http://127.0.0.1:8080"),
            ("VMONITOR_HOSTNAME", "node-1"),
            ("VMONITOR_CONTENT_ENCODING", "gzip"),
            ("VMONITOR_METRIC_BATCH_SIZE", "50"),
            ("VMONITOR_FLUSH_INTERVAL", "2"),
            ("VMONITOR_AGGREGATION_STATS", "mean, max,non_negative_rate"),
            ("VMONITOR_DROP_ORIGINAL", "true"),
            ("VMONITOR_LOGS_VALUE_KEYS", "bytes_in,bytes_out"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "http://127.0.0.1:8080");
        assert_eq!(config.iam_url, constants::DEFAULT_IAM_URL);
        assert_eq!(config.hostname.as_deref(), Some("node-1"));
        assert_eq!(config.content_encoding, ContentEncoding::Gzip);
        assert_eq!(config.metric_batch_size, 50);
        assert_eq!(config.metric_buffer_limit, constants::DEFAULT_METRIC_BUFFER_LIMIT);
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(
            config.aggregation,
            Some(AggregationConfig {
                stats: vec![StatKind::Mean, StatKind::Max, StatKind::NonNegativeRate],
                drop_original: true,
            })
        );
        assert_eq!(
            config.logs_to_metrics.value_keys,
            vec!["bytes_in".to_string(), "bytes_out".to_string()]
        );
    }

    #[test]
    fn test_from_lookup_rejects_unknown_stat() {
        let result = Config::from_lookup(lookup(&[
            ("VMONITOR_CLIENT_ID", "id"),
            ("VMONITOR_CLIENT_SECRET", "secret"),
            ("VMONITOR_AGGREGATION_STATS", "mean,p99"),
        ]));
        assert!(matches!(result, Err(ConfigError::Stat(_))));
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let result = Config::from_lookup(lookup(&[
            ("VMONITOR_CLIENT_ID", "id"),
            ("VMONITOR_CLIENT_SECRET", "secret"),
            ("VMONITOR_METRIC_BUFFER_LIMIT", "lots"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "client_id": "id",
                "client_secret": "secret",
                "content_encoding": "zstd",
                "flush_interval": 1.5,
                "use_system_proxy": true,
                "aggregation": {"stats": ["count", "stdev"]},
                "logs_to_metrics": {"dimension_keys": ["app"]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoint, constants::DEFAULT_ENDPOINT);
        assert_eq!(config.content_encoding, ContentEncoding::Zstd);
        assert_eq!(config.flush_interval, Duration::from_millis(1_500));
        assert_eq!(config.timeout, constants::DEFAULT_TIMEOUT);
        assert!(config.proxy.use_system_proxy);
        assert_eq!(
            config.aggregation.map(|a| a.stats),
            Some(vec![StatKind::Count, StatKind::Stdev])
        );
        assert_eq!(config.logs_to_metrics.dimension_keys, vec!["app".to_string()]);
        assert!(config.logs_to_metrics.value_keys.is_empty());

        let unknown = serde_json::from_str::<Config>(r#"{"aggregation": {"stats": ["p50"]}}"#);
        assert!(unknown.is_err());
    }
}
