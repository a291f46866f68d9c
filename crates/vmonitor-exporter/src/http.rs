// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use core::time::Duration;
use std::error::Error;
use tracing::{debug, error};

/// Builds the client shared by the token source and the delivery engine.
///
/// A proxy that cannot be applied is logged and the client falls back to a direct connection.
pub fn get_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    match build_client_inner(config) {
        Ok(client) => Ok(client),
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            build_client_without_proxy(config)
        }
    }
}

fn build_client_without_proxy(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .no_proxy()
        .build()
}

fn build_client_inner(config: &Config) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    // reqwest reads HTTP(S)_PROXY/NO_PROXY on its own unless told otherwise
    if config.proxy.use_system_proxy {
        debug!("Using system proxy settings");
    } else if let Some(proxy_url) = config
        .proxy
        .http_proxy_url
        .as_deref()
        .filter(|u| !u.is_empty())
    {
        debug!("Using proxy {}", proxy_url);
        client = client.proxy(reqwest::Proxy::all(proxy_url)?);
    } else {
        client = client.no_proxy();
    }

    Ok(client.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    #[test]
    fn test_get_client_direct() {
        assert!(get_client(&Config::default()).is_ok());
    }

    #[test]
    fn test_get_client_with_proxy() {
        let config = Config {
            proxy: ProxyConfig {
                use_system_proxy: false,
                http_proxy_url: Some("http://proxy.local:3128".to_string()),
            },
            ..Default::default()
        };
        assert!(build_client_inner(&config).is_ok());
    }

    #[test]
    fn test_get_client_falls_back_on_bad_proxy() {
        let config = Config {
            proxy: ProxyConfig {
                use_system_proxy: false,
                http_proxy_url: Some("http://[::1".to_string()),
            },
            ..Default::default()
        };
        assert!(build_client_inner(&config).is_err());
        assert!(get_client(&config).is_ok());
    }
}
