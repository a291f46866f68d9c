// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery engine: one authenticated POST per batch, guarded by the quota protocol.
//!
//! The intake answers `201` on success. `409` means the host is over quota and opens a
//! backoff window that doubles on every conflict. `428` asks the agent to register the
//! host through the quota check before sending again. All of this state sits behind one
//! async mutex so a batch never observes a half-updated backoff window.

use crate::auth::TokenSource;
use crate::config::{parse_endpoint, Config, ContentEncoding};
use crate::constants::{
    CHECKSUM_HEADER, CONTENT_TYPE, MAX_BACKOFF_WINDOW, MAX_DROP_MULTIPLIER, METRIC_PATH,
    QUOTA_PATH, REQUEST_ID_HEADER,
};
use crate::errors::{ConnectError, DeliveryError, DropReason};
use crate::host::HostInfo;
use crate::http::get_client;
use crate::metric::Record;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE as CONTENT_TYPE_HEADER, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

const ZSTD_LEVEL: i32 = 3;

/// Result of handing one batch to [`Output::write_batch`].
#[derive(Debug)]
pub enum SendOutcome {
    /// Accepted by the intake.
    Committed,
    /// Deliberately dropped; the batch must not be retried.
    Discarded(DropReason),
    /// Not delivered; the batch stays buffered.
    Retry(DeliveryError),
}

/// Backoff and quota bookkeeping of the delivery engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryState {
    pub drop_count: u32,
    pub drop_until: Instant,
    pub quota_check_required: bool,
}

impl DeliveryState {
    fn new(now: Instant) -> Self {
        DeliveryState {
            drop_count: 1,
            drop_until: now,
            quota_check_required: false,
        }
    }

    #[must_use]
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.drop_count > 1 && now < self.drop_until
    }

    fn escalate(&mut self, retry_interval: Duration, now: Instant) {
        if self.drop_count < MAX_DROP_MULTIPLIER {
            self.drop_count *= 2;
        }
        let window = retry_interval
            .saturating_mul(self.drop_count)
            .min(MAX_BACKOFF_WINDOW);
        self.drop_until = now + window;
    }

    fn reset(&mut self, now: Instant) {
        self.drop_count = 1;
        self.drop_until = now;
        self.quota_check_required = false;
    }
}

enum QuotaOutcome {
    Passed,
    Drop(DropReason),
    Failed(DeliveryError),
}

#[derive(Serialize)]
struct QuotaRequest<'a> {
    checksum: &'a str,
    data: &'a HostInfo,
}

pub struct Output {
    config: Arc<Config>,
    series_url: String,
    quota_url: String,
    client: reqwest::Client,
    tokens: TokenSource,
    host: HostInfo,
    state: Mutex<DeliveryState>,
}

impl Output {
    /// Validates the endpoint, builds the HTTP client, fetches the first token and
    /// resolves the host identity. Any failure is fatal.
    pub async fn connect(config: Arc<Config>) -> Result<Self, ConnectError> {
        let endpoint = parse_endpoint(&config.endpoint)?;
        let (client, tokens) = Self::authenticate(&config).await?;
        let host = HostInfo::detect(config.hostname.as_deref(), &endpoint)?;
        info!(
            "Connected to {} as {} ({})",
            config.endpoint, host.hostname, host.hash_id
        );
        Ok(Self::assemble(config, client, tokens, host))
    }

    /// Same as [`Output::connect`] with an already resolved host identity.
    pub async fn connect_with_host_info(
        config: Arc<Config>,
        host: HostInfo,
    ) -> Result<Self, ConnectError> {
        parse_endpoint(&config.endpoint)?;
        let (client, tokens) = Self::authenticate(&config).await?;
        Ok(Self::assemble(config, client, tokens, host))
    }

    async fn authenticate(config: &Config) -> Result<(reqwest::Client, TokenSource), ConnectError> {
        let client = get_client(config).map_err(ConnectError::Client)?;
        let tokens = TokenSource::new(
            client.clone(),
            config.iam_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        );
        tokens.refresh().await?;
        Ok((client, tokens))
    }

    fn assemble(
        config: Arc<Config>,
        client: reqwest::Client,
        tokens: TokenSource,
        host: HostInfo,
    ) -> Self {
        let base = config.endpoint.trim_end_matches('/').to_string();
        Output {
            series_url: format!("{base}{METRIC_PATH}"),
            quota_url: format!("{base}{QUOTA_PATH}"),
            config,
            client,
            tokens,
            host,
            state: Mutex::new(DeliveryState::new(Instant::now())),
        }
    }

    #[must_use]
    pub fn host_info(&self) -> &HostInfo {
        &self.host
    }

    pub async fn delivery_state(&self) -> DeliveryState {
        *self.state.lock().await
    }

    /// Sends one batch and classifies the result.
    pub async fn write_batch(&self, records: &[Record]) -> SendOutcome {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        if state.in_backoff(now) {
            let remaining = state.drop_until - now;
            info!(
                "Drop {} metrics. Send request again in {:?}",
                records.len(),
                remaining
            );
            return SendOutcome::Discarded(DropReason::Backoff { remaining });
        }

        if state.quota_check_required {
            match self.check_quota(&mut state).await {
                QuotaOutcome::Passed => {}
                QuotaOutcome::Drop(reason) => {
                    info!("Drop metrics because of {}", reason);
                    return SendOutcome::Discarded(reason);
                }
                QuotaOutcome::Failed(e) => {
                    error!("{}", e);
                    return SendOutcome::Retry(e);
                }
            }
        }

        let (body, raw_len) = match self.encode(records) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode {} metrics: {}", records.len(), e);
                return SendOutcome::Retry(e);
            }
        };

        let response = match self.send_series(body).await {
            Ok(response) => response,
            Err(e) => return self.reinit_after_failure(e).await,
        };

        let status = response.status();
        let request_id = request_id(&response);
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to read response body: {}", e);
                return SendOutcome::Retry(DeliveryError::Transport(e));
            }
        };
        info!(
            "Request-ID: {} with body length {} byte and response body {}",
            request_id, raw_len, text
        );

        let outcome = self.handle_response(&mut state, status, text).await;
        match &outcome {
            SendOutcome::Committed => debug!("Committed {} metrics", records.len()),
            SendOutcome::Discarded(reason) => info!("Drop metrics because of {}", reason),
            SendOutcome::Retry(e) => error!("{}", e),
        }
        outcome
    }

    async fn handle_response(
        &self,
        state: &mut DeliveryState,
        status: StatusCode,
        body: String,
    ) -> SendOutcome {
        match status {
            StatusCode::CREATED => SendOutcome::Committed,
            StatusCode::UNAUTHORIZED => SendOutcome::Discarded(DropReason::Unauthorized),
            StatusCode::FORBIDDEN => SendOutcome::Discarded(DropReason::Forbidden),
            StatusCode::PRECONDITION_REQUIRED => match self.check_quota(state).await {
                QuotaOutcome::Drop(reason) => SendOutcome::Discarded(reason),
                QuotaOutcome::Failed(e) => SendOutcome::Retry(e),
                // the host is registered now but this batch was never accepted
                QuotaOutcome::Passed => SendOutcome::Retry(DeliveryError::Status { status, body }),
            },
            StatusCode::CONFLICT => {
                state.escalate(self.config.quota_retry_interval, Instant::now());
                SendOutcome::Discarded(DropReason::QuotaConflict)
            }
            _ => SendOutcome::Retry(DeliveryError::Status { status, body }),
        }
    }

    /// Re-initialises the token source after a transport failure. The batch is dropped
    /// only when the credentials themselves can no longer be used.
    async fn reinit_after_failure(&self, e: DeliveryError) -> SendOutcome {
        match self.tokens.refresh().await {
            Ok(_) => {
                error!("{}", e);
                SendOutcome::Retry(e)
            }
            Err(auth) => {
                let reason = DropReason::Credentials(auth.to_string());
                info!("Drop metrics because {}", reason);
                SendOutcome::Discarded(reason)
            }
        }
    }

    async fn send_series(&self, body: Vec<u8>) -> Result<Response, DeliveryError> {
        let token = self.tokens.token().await?;
        let mut request = self
            .client
            .post(&self.series_url)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .header(CHECKSUM_HEADER, &self.host.hash_id)
            .header(USER_AGENT, &self.host.user_agent)
            .bearer_auth(token)
            .body(body);
        if let Some(encoding) = self.config.content_encoding.header_value() {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        request.send().await.map_err(DeliveryError::Transport)
    }

    async fn check_quota(&self, state: &mut DeliveryState) -> QuotaOutcome {
        debug!("Start check quota ...");
        state.quota_check_required = true;

        let token = match self.tokens.token().await {
            Ok(token) => token,
            Err(e) => return QuotaOutcome::Failed(e.into()),
        };
        let payload = QuotaRequest {
            checksum: &self.host.hash_id,
            data: &self.host,
        };
        let response = match self
            .client
            .post(&self.quota_url)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .header(CHECKSUM_HEADER, &self.host.hash_id)
            .header(USER_AGENT, &self.host.user_agent)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return QuotaOutcome::Failed(DeliveryError::Quota(format!(
                    "send request checking quota failed: ({e})"
                )))
            }
        };

        let status = response.status();
        let request_id = request_id(&response);
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return QuotaOutcome::Failed(DeliveryError::Quota(format!(
                    "error occurred when reading response body: ({e})"
                )))
            }
        };

        match status {
            StatusCode::OK => {
                info!(
                    "Request-ID: {}. Checking quota success. Continue send metric.",
                    request_id
                );
                state.reset(Instant::now());
                QuotaOutcome::Passed
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                info!("Request-ID: {}. Checking quota fail ({} - {})", request_id, status, body);
                QuotaOutcome::Drop(DropReason::QuotaDenied { status })
            }
            StatusCode::CONFLICT => {
                info!("Request-ID: {}. Checking quota fail ({} - {})", request_id, status, body);
                state.escalate(self.config.quota_retry_interval, Instant::now());
                QuotaOutcome::Drop(DropReason::QuotaConflict)
            }
            _ => QuotaOutcome::Failed(DeliveryError::Quota(format!(
                "Request-ID: {request_id}. Checking quota fail ({status} - {body})"
            ))),
        }
    }

    /// JSON array of `records`, compressed per configuration. Also returns the raw length.
    fn encode(&self, records: &[Record]) -> Result<(Vec<u8>, usize), DeliveryError> {
        let json = serde_json::to_vec(records)?;
        let raw_len = json.len();
        let body = match self.config.content_encoding {
            ContentEncoding::Identity => json,
            ContentEncoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&json)?;
                encoder.finish()?
            }
            ContentEncoding::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
                encoder.write_all(&json)?;
                encoder.finish()?
            }
        };
        Ok((body, raw_len))
    }
}

fn request_id(response: &Response) -> String {
    response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("series_url", &self.series_url)
            .field("host", &self.host.hostname)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Dimensions;
    use std::io::Read;
    use tracing_test::traced_test;

    #[test]
    fn test_escalation_doubles_up_to_ceiling() {
        let now = Instant::now();
        let mut state = DeliveryState::new(now);
        assert!(!state.in_backoff(now));

        let interval = Duration::from_secs(30);
        let mut counts = Vec::new();
        for _ in 0..9 {
            state.escalate(interval, now);
            counts.push(state.drop_count);
        }
        assert_eq!(counts, vec![2, 4, 8, 16, 32, 64, 128, 128, 128]);
        assert_eq!(state.drop_until, now + interval * 128);
        assert!(state.in_backoff(now));
        assert!(!state.in_backoff(now + interval * 128));
    }

    #[test]
    fn test_escalation_window_is_capped() {
        let now = Instant::now();
        let mut state = DeliveryState::new(now);
        state.escalate(Duration::from_secs_f64(1e17), now);
        assert_eq!(state.drop_count, 2);
        assert_eq!(state.drop_until, now + MAX_BACKOFF_WINDOW);

        state.escalate(Duration::MAX, now);
        assert_eq!(state.drop_until, now + MAX_BACKOFF_WINDOW);
        assert!(state.in_backoff(now));
    }

    #[test]
    fn test_reset_clears_backoff() {
        let now = Instant::now();
        let mut state = DeliveryState::new(now);
        state.escalate(Duration::from_secs(30), now);
        state.quota_check_required = true;

        state.reset(now);
        assert_eq!(state, DeliveryState::new(now));
    }

    fn output(content_encoding: ContentEncoding) -> Output {
        let config = Arc::new(Config {
            content_encoding,
            ..Default::default()
        });
        let client = reqwest::Client::new();
        let tokens = TokenSource::new(client.clone(), config.iam_url.clone(), "id", "secret");
        let host = crate::host::HostInfo::from_facts(
            "node-1",
            crate::host::HostFacts {
                kernel: "Linux".to_string(),
                core: "6.1.0".to_string(),
                platform: "x86_64".to_string(),
                os: "GNU/Linux".to_string(),
                cpus: 1,
                model_name_cpu: "cpu".to_string(),
                mem: 0,
                ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            },
        );
        Output::assemble(config, client, tokens, host)
    }

    #[test]
    fn test_urls_joined_with_endpoint() {
        let output = output(ContentEncoding::Identity);
        assert_eq!(
            output.series_url,
            "https://monitoring-agent.vngcloud.vn:443/intake/v2/series"
        );
        assert_eq!(
            output.quota_url,
            "https://monitoring-agent.vngcloud.vn:443/intake/v2/check"
        );
    }

    #[test]
    fn test_encode_compresses() {
        let records = vec![Record::new("cpu", Dimensions::new(), 1.0, 1)];
        let expected = serde_json::to_vec(&records).unwrap();

        let (plain, raw_len) = output(ContentEncoding::Identity).encode(&records).unwrap();
        assert_eq!(plain, expected);
        assert_eq!(raw_len, expected.len());

        let (gzipped, _) = output(ContentEncoding::Gzip).encode(&records).unwrap();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(gzipped.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, expected);

        let (zstd_body, _) = output(ContentEncoding::Zstd).encode(&records).unwrap();
        assert_eq!(zstd::decode_all(zstd_body.as_slice()).unwrap(), expected);
    }

    async fn connect_mock(server: &mut mockito::Server) -> (Output, mockito::Mock) {
        let token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"t","expires_in":3600}"#)
            .create_async()
            .await;
        let config = Config {
            endpoint: server.url(),
            iam_url: format!("{}/token", server.url()),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            ..Default::default()
        };
        let host = output(ContentEncoding::Identity).host.clone();
        let output = Output::connect_with_host_info(Arc::new(config), host)
            .await
            .unwrap();
        (output, token)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_classified_drop_is_logged() {
        let mut server = mockito::Server::new_async().await;
        let (output, _token) = connect_mock(&mut server).await;
        let _series = server
            .mock("POST", "/intake/v2/series")
            .with_status(401)
            .with_header("Api-Request-ID", "abc-123")
            .create_async()
            .await;

        let outcome = output
            .write_batch(&[Record::new("cpu", Dimensions::new(), 1.0, 1)])
            .await;

        assert!(matches!(
            outcome,
            SendOutcome::Discarded(DropReason::Unauthorized)
        ));
        assert!(logs_contain("Request-ID: abc-123"));
        assert!(logs_contain(
            "Drop metrics because of IAM Unauthorized. Please check your service account"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_backoff_drop_is_logged() {
        let mut server = mockito::Server::new_async().await;
        let (output, _token) = connect_mock(&mut server).await;
        let _series = server
            .mock("POST", "/intake/v2/series")
            .with_status(409)
            .create_async()
            .await;

        let batch = [Record::new("cpu", Dimensions::new(), 1.0, 1)];
        output.write_batch(&batch).await;
        output.write_batch(&batch).await;

        assert!(logs_contain("CONFLICT. Please check your quota again"));
        assert!(logs_contain("Drop 1 metrics. Send request again in"));
    }
}
