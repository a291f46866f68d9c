// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host identity sent with every request and as the body of quota checks.

use crate::constants::{AGENT_NAME, AGENT_VERSION};
use crate::errors::HostInfoError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Networks, RefreshKind, System};
use tracing::debug;
use url::{Host, Url};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Plugin {
    pub name: String,
    pub status: i32,
    pub message: String,
}

/// Platform facts gathered once per process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostFacts {
    pub kernel: String,
    pub core: String,
    pub platform: String,
    pub os: String,
    pub cpus: usize,
    pub model_name_cpu: String,
    /// Total memory in bytes.
    pub mem: u64,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub plugins: Vec<Plugin>,
    pub hash_id: String,
    pub kernel: String,
    pub core: String,
    pub platform: String,
    pub os: String,
    #[serde(rename = "host_name")]
    pub hostname: String,
    pub cpus: usize,
    pub model_name_cpu: String,
    pub mem: u64,
    pub ip: String,
    pub agent_version: String,
    #[serde(skip)]
    pub user_agent: String,
}

/// Hex encoded sha256 of the hostname.
#[must_use]
pub fn fingerprint(hostname: &str) -> String {
    hex::encode(Sha256::digest(hostname.as_bytes()))
}

impl HostInfo {
    #[must_use]
    pub fn from_facts(hostname: &str, facts: HostFacts) -> Self {
        HostInfo {
            plugins: Vec::new(),
            hash_id: fingerprint(hostname),
            user_agent: format!("{AGENT_NAME}/{AGENT_VERSION} ({})", facts.os),
            kernel: facts.kernel,
            core: facts.core,
            platform: facts.platform,
            os: facts.os,
            hostname: hostname.to_string(),
            cpus: facts.cpus,
            model_name_cpu: facts.model_name_cpu,
            mem: facts.mem,
            ip: facts.ip.to_string(),
            agent_version: AGENT_VERSION.to_string(),
        }
    }

    /// Collects the local host identity. `target` is the intake endpoint, used to decide
    /// whether a loopback address is an acceptable source address.
    pub fn detect(configured_hostname: Option<&str>, target: &Url) -> Result<Self, HostInfoError> {
        let hostname = match configured_hostname.filter(|h| !h.is_empty()) {
            Some(hostname) => hostname.to_string(),
            None => System::host_name().ok_or(HostInfoError::MissingFact("hostname"))?,
        };

        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        let model_name_cpu = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .ok_or(HostInfoError::MissingFact("cpu model name"))?;
        let core = System::kernel_version().ok_or(HostInfoError::MissingFact("kernel version"))?;
        let os = System::long_os_version()
            .or_else(System::name)
            .ok_or(HostInfoError::MissingFact("os name"))?;

        let ip = local_ip(target)?;
        debug!("Using local address {} to reach {}", ip, target);

        let facts = HostFacts {
            kernel: kernel_name(std::env::consts::OS),
            core,
            platform: std::env::consts::ARCH.to_string(),
            os,
            cpus: sys.cpus().len(),
            model_name_cpu,
            mem: sys.total_memory(),
            ip,
        };
        Ok(Self::from_facts(&hostname, facts))
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.hash_id
    }
}

fn kernel_name(os: &str) -> String {
    match os {
        "linux" => "Linux".to_string(),
        "macos" => "Darwin".to_string(),
        "windows" => "Windows".to_string(),
        other => other.to_string(),
    }
}

fn targets_loopback(target: &Url) -> bool {
    match target.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

fn local_ip(target: &Url) -> Result<IpAddr, HostInfoError> {
    let networks = Networks::new_with_refreshed_list();
    let candidates = networks
        .iter()
        .flat_map(|(_, data)| data.ip_networks().iter().map(|network| network.addr));
    select_ip(candidates, targets_loopback(target))
        .ok_or_else(|| HostInfoError::NoAddress(target.to_string()))
}

/// Picks the interface address reported to the intake: IPv4 over IPv6, and loopback
/// only when the intake itself is on loopback.
fn select_ip(candidates: impl IntoIterator<Item = IpAddr>, allow_loopback: bool) -> Option<IpAddr> {
    let mut v4 = None;
    let mut v6 = None;
    let mut loopback = None;
    for ip in candidates {
        if ip.is_unspecified() || ip.is_multicast() {
            continue;
        }
        if ip.is_loopback() {
            loopback.get_or_insert(ip);
            continue;
        }
        match ip {
            IpAddr::V4(_) => {
                v4.get_or_insert(ip);
            }
            IpAddr::V6(v6_addr) => {
                // link-local
                if v6_addr.segments()[0] & 0xffc0 != 0xfe80 {
                    v6.get_or_insert(ip);
                }
            }
        }
    }
    v4.or(v6).or(if allow_loopback { loopback } else { None })
}
