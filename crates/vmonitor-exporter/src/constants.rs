// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Path of the series intake, appended to the configured endpoint.
pub const METRIC_PATH: &str = "/intake/v2/series";
/// Path of the quota check, appended to the configured endpoint.
pub const QUOTA_PATH: &str = "/intake/v2/check";

pub const CONTENT_TYPE: &str = "application/json";
pub const CHECKSUM_HEADER: &str = "checksum";
pub const REQUEST_ID_HEADER: &str = "Api-Request-ID";

pub const AGENT_NAME: &str = "vMonitorAgent";
pub const AGENT_VERSION: &str = "1.26.0-2.0.0";

/// Ceiling of the backoff multiplier: 2^7, i.e. at most 128 retry intervals.
pub const MAX_DROP_MULTIPLIER: u32 = 128;
/// Longest backoff window after a quota conflict, whatever the retry interval.
pub const MAX_BACKOFF_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Largest accepted `quota_retry_interval`.
pub const MAX_QUOTA_RETRY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_ENDPOINT: &str = "https://monitoring-agent.vngcloud.vn:443";
pub const DEFAULT_IAM_URL: &str = "https://iamapis.vngcloud.vn/accounts-api/v2/auth/token";
pub const DEFAULT_METRIC_BATCH_SIZE: usize = 1_000;
pub const DEFAULT_METRIC_BUFFER_LIMIT: usize = 15_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUOTA_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Tokens are refreshed this long before the server-side expiry.
pub const TOKEN_EXPIRY_DELTA: Duration = Duration::from_secs(10);

pub const HOST_DIMENSION: &str = "host";
/// Prefix of metric names derived from log attributes.
pub const LOG_METRIC_PREFIX: &str = "annd2_";
/// Dimension value used when a log lacks a configured dimension key.
pub const MISSING_DIMENSION_VALUE: &str = "N/A";
