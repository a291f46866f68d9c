// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry exporter for vMonitor.
//!
//! Incoming metric data points and log entries are reduced into [`metric::Record`]s
//! (optionally through streaming statistics), staged in a bounded [`buffer::Buffer`]
//! and shipped in size-capped batches by [`output::Output`], which owns the OAuth2
//! session, the host fingerprint and the quota/backoff state machine.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod auth;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod errors;
pub mod host;
pub mod http;
pub mod logs;
pub mod metric;
pub mod metrics;
pub mod output;
pub mod pipeline;
