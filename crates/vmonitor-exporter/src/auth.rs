// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OAuth2 client-credentials token source for the vMonitor IAM service.

use crate::constants::TOKEN_EXPIRY_DELTA;
use crate::errors::AuthError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt::Debug;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    fn is_valid(&self, now: Instant) -> bool {
        self.expires_at
            .map_or(true, |expires_at| now + TOKEN_EXPIRY_DELTA < expires_at)
    }
}

/// Hands out bearer tokens, fetching a new one when the cached token is about to expire.
pub struct TokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        TokenSource {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    /// Current access token, fetched on first use or when the cached one expired.
    pub async fn token(&self) -> Result<String, AuthError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_valid(Instant::now())) {
            return Ok(token.value.clone());
        }
        let token = self.fetch().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Discards the cached token and fetches a new one.
    pub async fn refresh(&self) -> Result<String, AuthError> {
        info!("Init client-iam ...");
        let mut guard = self.token.lock().await;
        *guard = None;
        let token = self.fetch().await?;
        let value = token.value.clone();
        *guard = Some(token);
        info!("Init client-iam successfully");
        Ok(value)
    }

    async fn fetch(&self) -> Result<AccessToken, AuthError> {
        // Credentials go in the Authorization header first; some IAM deployments only
        // accept them in the form body.
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(AuthError::Transport)?;

        let response = match response.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                debug!(
                    "Token endpoint rejected basic auth with {}, retrying with credentials in body",
                    response.status()
                );
                self.client
                    .post(&self.token_url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(AuthError::Transport)?
            }
            _ => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }

        let token: TokenResponse = response.json().await.map_err(AuthError::Decode)?;
        debug!(
            "Received {} token, expires in {:?}s",
            token.token_type.as_deref().unwrap_or("bearer"),
            token.expires_in
        );
        Ok(AccessToken {
            value: token.access_token,
            expires_at: token
                .expires_in
                .map(|secs| Instant::now() + std::time::Duration::from_secs(secs)),
        })
    }
}

impl Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenSource({})", self.token_url)
    }
}
