// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO staging area between the converters and the delivery engine.
//!
//! Every record gets a monotonically increasing sequence number when it is added.
//! A [`Batch`] remembers the sequence range it covers, so [`Buffer::accept`]
//! removes exactly those records even if newer records were appended or older
//! ones evicted since the batch was taken.

use crate::metric::Record;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Read-only snapshot of the oldest records of a [`Buffer`].
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    start: u64,
    end: u64,
    records: Vec<Record>,
}

impl Batch {
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub struct Buffer {
    records: VecDeque<Record>,
    /// Sequence number of the record at the front of `records`.
    head_seq: u64,
    capacity: usize,
    dropped: u64,
}

impl Buffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Buffer {
            records: VecDeque::with_capacity(capacity.min(1_024)),
            head_seq: 0,
            capacity,
            dropped: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of records evicted because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Appends `records` in order, evicting the oldest entries once over capacity.
    pub fn add(&mut self, records: impl IntoIterator<Item = Record>) {
        self.records.extend(records);

        let overflow = self.records.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.records.drain(..overflow);
            self.head_seq += overflow as u64;
            self.dropped += overflow as u64;
            warn!(
                "Metric buffer overflow; {} metrics have been dropped (total dropped: {})",
                overflow, self.dropped
            );
        }
    }

    /// Oldest `min(n, len)` records. Does not mutate the buffer.
    #[must_use]
    pub fn batch(&self, n: usize) -> Batch {
        let take = n.min(self.records.len());
        Batch {
            start: self.head_seq,
            end: self.head_seq + take as u64,
            records: self.records.iter().take(take).cloned().collect(),
        }
    }

    /// Removes the records covered by `batch`. Accepting the same batch twice is a no-op.
    pub fn accept(&mut self, batch: &Batch) {
        let remove = usize::try_from(batch.end.saturating_sub(self.head_seq))
            .unwrap_or(usize::MAX)
            .min(self.records.len());
        self.records.drain(..remove);
        self.head_seq += remove as u64;
    }

    /// Leaves the batch's records in place for the next drain cycle.
    pub fn reject(&self, batch: &Batch) {
        debug!(
            "Keeping {} metrics starting at #{} for the next flush",
            batch.len(),
            batch.start
        );
    }
}
