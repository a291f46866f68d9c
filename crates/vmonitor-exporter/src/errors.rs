// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;
use std::time::Duration;

/// Errors raised while building or validating a [`crate::config::Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid client_id and client_secret in config")]
    MissingCredentials,

    #[error("URL Invalid {0}")]
    InvalidUrl(String),

    #[error("{0} must be greater than 0")]
    NotPositive(&'static str),

    #[error("{key} must be at most {max:?}")]
    TooLarge { key: &'static str, max: Duration },

    #[error("aggregation requires at least one statistic")]
    EmptyStats,

    #[error("invalid content encoding '{0}', expected one of: gzip, zstd, identity")]
    ContentEncoding(String),

    #[error("error parsing proxy url {url:?}: {source}")]
    Proxy {
        url: String,
        source: url::ParseError,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Stat(#[from] ParseStatError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown statistic '{0}'")]
pub struct ParseStatError(pub String);

/// Failures of the OAuth2 client-credentials exchange.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to get token: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to get token: {status} {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("failed to decode token response: {0}")]
    Decode(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HostInfoError {
    #[error("error getting host facts: {0} unavailable")]
    MissingFact(&'static str),

    #[error("err getting ip address: no usable local address to reach {0}")]
    NoAddress(String),
}

/// Fatal errors of [`crate::output::Output::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    HostInfo(#[from] HostInfoError),
}

/// Retryable delivery failures. The batch that produced one stays buffered.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("IAM request fail: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("status Code: {status}, message: {body}")]
    Status { status: StatusCode, body: String },

    #[error("can not check quota: {0}")]
    Quota(String),

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to compress batch: {0}")]
    Compress(#[from] std::io::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Reasons a batch was deliberately discarded instead of retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    #[error("backoff window active for another {remaining:?}")]
    Backoff { remaining: Duration },

    #[error("IAM Unauthorized. Please check your service account")]
    Unauthorized,

    #[error("IAM Forbidden. Please check your permission")]
    Forbidden,

    #[error("CONFLICT. Please check your quota again")]
    QuotaConflict,

    #[error("checking quota fail ({status})")]
    QuotaDenied { status: StatusCode },

    #[error("can't init IAM: {0}")]
    Credentials(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidUrl("localhost".to_string());
        assert_eq!(error.to_string(), "URL Invalid localhost");

        let error = ConfigError::NotPositive("metric_batch_size");
        assert_eq!(error.to_string(), "metric_batch_size must be greater than 0");
    }

    #[test]
    fn test_stat_error_converts() {
        let error: ConfigError = ParseStatError("p99".to_string()).into();
        assert_eq!(error.to_string(), "unknown statistic 'p99'");
    }

    #[test]
    fn test_drop_reason_display() {
        assert_eq!(
            DropReason::QuotaConflict.to_string(),
            "CONFLICT. Please check your quota again"
        );
        assert_eq!(
            DropReason::QuotaDenied {
                status: StatusCode::FORBIDDEN
            }
            .to_string(),
            "checking quota fail (403 Forbidden)"
        );
    }
}
