// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives one ingestion path: convert, buffer, then drain in size-capped batches.

use crate::buffer::Buffer;
use crate::config::Config;
use crate::errors::DeliveryError;
use crate::metric::Record;
use crate::output::{Output, SendOutcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Turns incoming entries into output records. Implementations own their aggregation state.
pub trait Converter: Send {
    type Entry;

    /// Appends the records derived from `entry` to `out`. Entries that yield no valid
    /// record are skipped.
    fn convert(&mut self, entry: Self::Entry, out: &mut Vec<Record>);

    /// Forgets all aggregation state.
    fn reset(&mut self);
}

pub struct Pipeline<C: Converter> {
    converter: Mutex<C>,
    buffer: Mutex<Buffer>,
    output: Arc<Output>,
    batch_size: usize,
    batch_delay: Duration,
    // serializes drain cycles; never held by ingest
    draining: tokio::sync::Mutex<()>,
}

impl<C: Converter> Pipeline<C> {
    #[must_use]
    pub fn new(converter: C, output: Arc<Output>, config: &Config) -> Self {
        Pipeline {
            converter: Mutex::new(converter),
            buffer: Mutex::new(Buffer::new(config.metric_buffer_limit)),
            output,
            batch_size: config.metric_batch_size.max(1),
            batch_delay: config.flush_interval,
            draining: tokio::sync::Mutex::new(()),
        }
    }

    /// Converts `entries` and appends the resulting records to the buffer.
    /// Returns the number of records buffered.
    pub fn ingest(&self, entries: impl IntoIterator<Item = C::Entry>) -> usize {
        let mut records = Vec::new();
        {
            #[allow(clippy::expect_used)]
            let mut converter = self.converter.lock().expect("lock poisoned");
            for entry in entries {
                converter.convert(entry, &mut records);
            }
        }
        let count = records.len();
        #[allow(clippy::expect_used)]
        self.buffer.lock().expect("lock poisoned").add(records);
        count
    }

    /// Ingests `entries` and immediately drains the buffer.
    pub async fn push(
        &self,
        entries: impl IntoIterator<Item = C::Entry>,
    ) -> Result<usize, DeliveryError> {
        self.ingest(entries);
        self.drain(None).await
    }

    /// Sends buffered records in batches of `metric_batch_size`.
    ///
    /// At most `len / batch_size + 1` batches are attempted, so records ingested during
    /// the cycle wait for the next one. `cancel` is checked between batches, never in the
    /// middle of one. A retryable failure stops the cycle and leaves the failed batch at
    /// the head of the buffer. Returns the number of records removed from the buffer
    /// (delivered or deliberately dropped).
    pub async fn drain(&self, cancel: Option<&CancellationToken>) -> Result<usize, DeliveryError> {
        self.drain_cycle(cancel, self.batch_delay).await
    }

    async fn drain_cycle(
        &self,
        cancel: Option<&CancellationToken>,
        batch_delay: Duration,
    ) -> Result<usize, DeliveryError> {
        let _draining = self.draining.lock().await;

        let pending = self.buffered();
        let n_batches = pending / self.batch_size + 1;
        info!("Writing {} metric(s) in {} batch(es)", pending, n_batches);

        let mut removed = 0;
        for i in 0..n_batches {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                debug!("Drain cancelled after {} batch(es)", i);
                break;
            }
            if i != 0 && self.buffered() == 0 {
                break;
            }
            if i != 0 && !batch_delay.is_zero() {
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            () = tokio::time::sleep(batch_delay) => {}
                            () = token.cancelled() => {
                                debug!("Drain cancelled after {} batch(es)", i);
                                break;
                            }
                        }
                    }
                    None => tokio::time::sleep(batch_delay).await,
                }
            }

            #[allow(clippy::expect_used)]
            let batch = self.buffer.lock().expect("lock poisoned").batch(self.batch_size);
            if batch.is_empty() {
                break;
            }

            match self.output.write_batch(batch.records()).await {
                SendOutcome::Retry(e) => {
                    #[allow(clippy::expect_used)]
                    self.buffer.lock().expect("lock poisoned").reject(&batch);
                    return Err(e);
                }
                outcome => {
                    if let SendOutcome::Committed = outcome {
                        info!("Wrote batch {} metric(s)", batch.len());
                    }
                    #[allow(clippy::expect_used)]
                    self.buffer.lock().expect("lock poisoned").accept(&batch);
                    removed += batch.len();
                }
            }
        }
        Ok(removed)
    }

    /// Drains every `interval` until `cancel` fires, then runs one last cycle without
    /// the inter-batch delay.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Pipeline shutting down, performing final flush");
                    if let Err(e) = self.drain_cycle(None, Duration::ZERO).await {
                        error!("Final flush failed: {}", e);
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drain(Some(&cancel)).await {
                        error!("Failed to write metrics, will retry on next flush: {}", e);
                    }
                }
            }
        }
    }

    /// Number of records waiting in the buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.buffer.lock().expect("lock poisoned").len()
    }

    /// Records evicted so far because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        #[allow(clippy::expect_used)]
        self.buffer.lock().expect("lock poisoned").dropped()
    }

    pub fn reset(&self) {
        #[allow(clippy::expect_used)]
        self.converter.lock().expect("lock poisoned").reset();
    }

    #[must_use]
    pub fn output(&self) -> &Arc<Output> {
        &self.output
    }
}
