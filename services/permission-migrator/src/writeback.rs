// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Batched write-back of object outcomes
//!
//! Outcomes are buffered per identity and appended to the tracking store in
//! batches. A failed batch is put back at the head of its buffer so FIFO
//! order is kept; buffers are bounded, and anything past the bound is
//! dropped with a warning rather than retried forever.
//!
//! All buffers share one lock, which is never held across a sink write:
//! a batch is taken out of its buffer first and put back on failure.
//! Sink writes are serialized by a separate gate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use migration_types::{FileOutcome, Identity};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::store::StoreError;

pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 100;
pub const DEFAULT_AUTO_FLUSH_THRESHOLD: usize = 200;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_FLUSH_PAUSE: Duration = Duration::from_secs(2);

/// Durable destination for a batch of outcomes
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Append `batch` for `identity`, in order. Either the whole batch is
    /// stored or an error is returned.
    async fn append_batch(&self, identity: &str, batch: &[FileOutcome]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct WriteBackConfig {
    /// Entries written per batch
    pub batch_size: usize,
    /// Buffer length that triggers a flush from `enqueue`
    pub auto_flush_threshold: usize,
    /// Hard bound on a single identity's buffer
    pub capacity: usize,
    /// Pause between repeated flushes of one identity in `flush_all`
    pub flush_pause: Duration,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            auto_flush_threshold: DEFAULT_AUTO_FLUSH_THRESHOLD,
            capacity: DEFAULT_QUEUE_CAPACITY,
            flush_pause: DEFAULT_FLUSH_PAUSE,
        }
    }
}

/// What a single flush attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    /// A batch of this size was written
    Flushed(usize),
    /// The write failed; entries were restored to the buffer, minus any
    /// that no longer fit
    Requeued { restored: usize, dropped: usize },
}

pub struct WriteBackQueue {
    sink: Arc<dyn BatchSink>,
    config: WriteBackConfig,
    buffers: Mutex<HashMap<Identity, VecDeque<FileOutcome>>>,
    /// Held for the duration of every sink write, so batches reach the
    /// sink one at a time and in buffer order.
    flush_gate: Mutex<()>,
}

impl WriteBackQueue {
    pub fn new(sink: Arc<dyn BatchSink>, config: WriteBackConfig) -> Self {
        Self {
            sink,
            config,
            buffers: Mutex::new(HashMap::new()),
            flush_gate: Mutex::new(()),
        }
    }

    /// Create the buffer for an identity whose run is starting.
    pub async fn open(&self, identity: &str) {
        self.buffers
            .lock()
            .await
            .entry(identity.to_string())
            .or_default();
    }

    /// Discard an identity's buffer if it is empty. Returns how many
    /// entries are still waiting (the buffer is kept for `flush_all`).
    pub async fn close(&self, identity: &str) -> usize {
        let mut buffers = self.buffers.lock().await;
        let remaining = buffers.get(identity).map_or(0, VecDeque::len);
        if remaining == 0 {
            buffers.remove(identity);
        }
        remaining
    }

    /// Buffer one outcome, flushing a batch once the threshold is reached.
    ///
    /// The auto-flush is skipped while another flush is writing; the
    /// entries stay buffered for the next one.
    pub async fn enqueue(&self, identity: &str, outcome: FileOutcome) {
        {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(identity.to_string()).or_default();

            if buffer.len() >= self.config.capacity {
                warn!(
                    identity = %identity,
                    object_id = %outcome.object_id,
                    capacity = self.config.capacity,
                    "Write-back buffer full, dropping outcome"
                );
                metrics::record_rows_dropped(1);
                return;
            }

            buffer.push_back(outcome);
            if buffer.len() < self.config.auto_flush_threshold {
                return;
            }
            debug!(
                identity = %identity,
                buffered = buffer.len(),
                "Auto-flush threshold reached"
            );
        }

        match self.flush_gate.try_lock() {
            Ok(_gate) => {
                self.flush_batch(identity).await;
            }
            Err(_) => debug!(identity = %identity, "Flush in progress, deferring auto-flush"),
        }
    }

    /// Write at most one batch from the head of an identity's buffer.
    pub async fn flush(&self, identity: &str) -> FlushOutcome {
        let _gate = self.flush_gate.lock().await;
        self.flush_batch(identity).await
    }

    /// Take one batch out of the buffer and write it without holding the
    /// buffer lock. Callers hold `flush_gate`.
    async fn flush_batch(&self, identity: &str) -> FlushOutcome {
        let batch: Vec<FileOutcome> = {
            let mut buffers = self.buffers.lock().await;
            let Some(buffer) = buffers.get_mut(identity) else {
                return FlushOutcome::Empty;
            };
            if buffer.is_empty() {
                return FlushOutcome::Empty;
            }
            let take = self.config.batch_size.max(1).min(buffer.len());
            buffer.drain(..take).collect()
        };

        let result = self.sink.append_batch(identity, &batch).await;

        let mut buffers = self.buffers.lock().await;
        match result {
            Ok(()) => {
                metrics::record_rows_flushed(batch.len());
                info!(
                    identity = %identity,
                    rows = batch.len(),
                    remaining = buffers.get(identity).map_or(0, VecDeque::len),
                    "Flushed outcomes"
                );
                FlushOutcome::Flushed(batch.len())
            }
            Err(e) => {
                let buffer = buffers.entry(identity.to_string()).or_default();
                let room = self.config.capacity.saturating_sub(buffer.len());
                let restored = room.min(batch.len());
                let dropped = batch.len() - restored;

                // Oldest entries go back first, ahead of anything newer.
                for outcome in batch.into_iter().take(restored).rev() {
                    buffer.push_front(outcome);
                }

                warn!(
                    identity = %identity,
                    error = %e,
                    restored,
                    dropped,
                    "Flush failed, re-queued batch"
                );
                if dropped > 0 {
                    metrics::record_rows_dropped(dropped);
                }
                FlushOutcome::Requeued { restored, dropped }
            }
        }
    }

    /// Drain every buffer, pausing between batches of the same identity.
    ///
    /// An identity whose flush fails is left buffered for this pass rather
    /// than retried in a loop. Returns how many entries remain buffered.
    pub async fn flush_all(&self) -> usize {
        let _gate = self.flush_gate.lock().await;
        let identities: Vec<Identity> = self.buffers.lock().await.keys().cloned().collect();

        info!(identities = identities.len(), "Final flush starting");

        for identity in &identities {
            loop {
                match self.flush_batch(identity).await {
                    FlushOutcome::Empty => break,
                    FlushOutcome::Flushed(_) => {
                        if self.pending(identity).await == 0 {
                            break;
                        }
                        tokio::time::sleep(self.config.flush_pause).await;
                    }
                    FlushOutcome::Requeued { .. } => {
                        warn!(identity = %identity, "Final flush failed, entries remain buffered");
                        break;
                    }
                }
            }

            let mut buffers = self.buffers.lock().await;
            if buffers.get(identity).is_some_and(VecDeque::is_empty) {
                buffers.remove(identity);
            }
        }

        let remaining: usize = self.buffers.lock().await.values().map(VecDeque::len).sum();
        info!(remaining, "Final flush complete");
        remaining
    }

    /// Entries currently buffered for `identity`
    pub async fn pending(&self, identity: &str) -> usize {
        self.buffers
            .lock()
            .await
            .get(identity)
            .map_or(0, VecDeque::len)
    }

    /// Whether a buffer exists for `identity`
    pub async fn is_open(&self, identity: &str) -> bool {
        self.buffers.lock().await.contains_key(identity)
    }
}
