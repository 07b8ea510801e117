// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Run driver
//!
//! Loads the roster and identity mapping from the tracking store, then runs
//! one migration job per pending identity on a bounded outer pool. Each
//! identity's outcomes are streamed into the write-back queue while its job
//! runs, and its roster row is moved through In Progress to Completed or
//! Failed.

use std::sync::Arc;

use async_trait::async_trait;
use migration_types::{
    FileOutcome, IdentityMapping, IdentityRecord, IdentityStatus, MigrationResult, MigrationStats,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::control::RunControl;
use crate::drive::DriveClient;
use crate::executor::ApiError;
use crate::jobs::migrate::{MigrationOrchestrator, ProgressListener};
use crate::store::{SheetsStore, StoreError};
use crate::writeback::{FlushOutcome, WriteBackQueue};

pub const DEFAULT_OUTER_POOL_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to read roster: {0}")]
    Roster(#[source] StoreError),

    #[error("Failed to read identity mapping: {0}")]
    Mapping(#[source] StoreError),

    #[error("Roster has no identities")]
    EmptyRoster,

    #[error("Connection check failed for {identity}: {source}")]
    Probe {
        identity: String,
        #[source]
        source: ApiError,
    },
}

/// How one identity's run ended
#[derive(Debug)]
enum IdentityRun {
    Completed(MigrationResult),
    Failed(MigrationResult),
    /// Stopped while its objects were being processed
    Interrupted(MigrationResult),
    /// Stopped before it started
    NotStarted,
}

/// Totals for a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Pending identities selected from the roster
    pub identities: usize,
    pub completed: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub not_started: usize,
    /// Object counts across all identities that ran
    pub stats: MigrationStats,
    /// Outcomes still buffered after the final flush
    pub unflushed: usize,
}

impl RunSummary {
    fn absorb(&mut self, stats: &MigrationStats) {
        self.stats.total += stats.total;
        self.stats.success += stats.success;
        self.stats.failed += stats.failed;
        self.stats.restricted += stats.restricted;
        self.stats.skipped += stats.skipped;
    }

    fn record(&mut self, run: &IdentityRun) {
        match run {
            IdentityRun::Completed(result) => {
                self.completed += 1;
                self.absorb(&result.stats);
            }
            IdentityRun::Failed(result) => {
                self.failed += 1;
                self.absorb(&result.stats);
            }
            IdentityRun::Interrupted(result) => {
                self.interrupted += 1;
                self.absorb(&result.stats);
            }
            IdentityRun::NotStarted => self.not_started += 1,
        }
    }
}

/// Sends each outcome to the write-back queue, then to the caller's listener.
struct RecordingListener<'a> {
    queue: &'a WriteBackQueue,
    inner: &'a dyn ProgressListener,
}

#[async_trait]
impl<'a> ProgressListener for RecordingListener<'a> {
    async fn on_progress(
        &self,
        identity: &str,
        processed: usize,
        total: usize,
        outcome: &FileOutcome,
    ) {
        self.queue.enqueue(identity, outcome.clone()).await;
        self.inner
            .on_progress(identity, processed, total, outcome)
            .await;
    }
}

pub struct Runner {
    store: Arc<SheetsStore>,
    queue: Arc<WriteBackQueue>,
    drive: Arc<DriveClient>,
    orchestrator: Arc<MigrationOrchestrator>,
    control: RunControl,
    outer_pool_size: usize,
}

impl Runner {
    pub fn new(
        store: Arc<SheetsStore>,
        queue: Arc<WriteBackQueue>,
        drive: Arc<DriveClient>,
        orchestrator: Arc<MigrationOrchestrator>,
        control: RunControl,
        outer_pool_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            drive,
            orchestrator,
            control,
            outer_pool_size,
        }
    }

    /// Probe the object store as the first roster identity.
    pub async fn check(&self) -> Result<(String, Option<String>), RunError> {
        let roster = self.store.read_roster().await.map_err(RunError::Roster)?;
        let first = roster.into_iter().next().ok_or(RunError::EmptyRoster)?;

        let reported = self
            .drive
            .test_connection(&first.identity)
            .await
            .map_err(|source| RunError::Probe {
                identity: first.identity.clone(),
                source,
            })?;

        info!(
            identity = %first.identity,
            reported = reported.as_deref().unwrap_or("unknown"),
            "Connection check succeeded"
        );
        Ok((first.identity, reported))
    }

    /// Migrate every pending identity in the roster.
    pub async fn run(
        self: &Arc<Self>,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<RunSummary, RunError> {
        let roster = self.store.read_roster().await.map_err(RunError::Roster)?;
        let mapping = Arc::new(self.store.read_mapping().await.map_err(RunError::Mapping)?);

        let pending: Vec<IdentityRecord> = roster
            .into_iter()
            .filter(|r| r.status.is_pending())
            .collect();

        let mut summary = RunSummary {
            identities: pending.len(),
            ..Default::default()
        };

        info!(
            identities = summary.identities,
            mappings = mapping.len(),
            outer_pool_size = self.outer_pool_size,
            "Starting run"
        );

        let permits = Arc::new(Semaphore::new(self.outer_pool_size.max(1)));
        let mut tasks: JoinSet<IdentityRun> = JoinSet::new();

        for record in pending {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let runner = Arc::clone(self);
            let mapping = Arc::clone(&mapping);
            let listener = Arc::clone(&listener);

            tasks.spawn(async move {
                let _permit = permit;
                runner
                    .run_identity(record, mapping, listener.as_ref())
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => summary.record(&run),
                Err(e) => {
                    error!(error = %e, "Identity task did not complete");
                    summary.failed += 1;
                }
            }
        }

        summary.unflushed = self.queue.flush_all().await;

        info!(
            completed = summary.completed,
            failed = summary.failed,
            interrupted = summary.interrupted,
            not_started = summary.not_started,
            objects = summary.stats.total,
            unflushed = summary.unflushed,
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_identity(
        &self,
        record: IdentityRecord,
        mapping: Arc<IdentityMapping>,
        listener: &dyn ProgressListener,
    ) -> IdentityRun {
        let identity = record.identity.as_str();

        self.control.wait_while_paused().await;
        if self.control.is_stopped() {
            info!(identity = %identity, "Stop requested, not starting identity");
            return IdentityRun::NotStarted;
        }

        if let Err(e) = self.store.ensure_detail_sheet(identity).await {
            error!(identity = %identity, error = %e, "Failed to prepare detail sheet");
            let mut result = MigrationResult::start(identity);
            result.finish(false, Some(e.to_string()));
            self.mark(&record, &IdentityStatus::Failed, &result.stats)
                .await;
            self.store
                .write_log(
                    "ERROR",
                    &format!("Failed to prepare detail sheet for {identity}"),
                    Some(&e.to_string()),
                )
                .await;
            listener.on_identity_complete(&result).await;
            return IdentityRun::Failed(result);
        }

        if let Err(e) = self
            .store
            .update_identity_status(identity, record.row_index, &IdentityStatus::InProgress, None)
            .await
        {
            warn!(identity = %identity, error = %e, "Failed to mark identity in progress");
        }

        self.queue.open(identity).await;
        let recording = RecordingListener {
            queue: &self.queue,
            inner: listener,
        };

        let run = match self
            .orchestrator
            .run(identity, mapping, &recording)
            .await
        {
            Ok(result) if result.interrupted => {
                // Left In Progress so the next run picks it up again.
                warn!(identity = %identity, "Identity interrupted by stop");
                IdentityRun::Interrupted(result)
            }
            Ok(result) => {
                self.mark(&record, &IdentityStatus::Completed, &result.stats)
                    .await;
                IdentityRun::Completed(result)
            }
            Err(e) => {
                let result = e.result().clone();
                self.mark(&record, &IdentityStatus::Failed, &result.stats)
                    .await;
                self.store
                    .write_log(
                        "ERROR",
                        &format!("Failed to list files for {identity}"),
                        Some(&e.to_string()),
                    )
                    .await;
                IdentityRun::Failed(result)
            }
        };

        self.drain(identity).await;

        let result = match &run {
            IdentityRun::Completed(r) | IdentityRun::Failed(r) | IdentityRun::Interrupted(r) => r,
            IdentityRun::NotStarted => return run,
        };
        listener.on_identity_complete(result).await;
        run
    }

    async fn mark(&self, record: &IdentityRecord, status: &IdentityStatus, stats: &MigrationStats) {
        if let Err(e) = self
            .store
            .update_identity_status(&record.identity, record.row_index, status, Some(stats))
            .await
        {
            warn!(
                identity = %record.identity,
                status = %status,
                error = %e,
                "Failed to update identity status"
            );
        }
    }

    /// Flush the identity's buffer until it is empty or a flush fails,
    /// then release it.
    async fn drain(&self, identity: &str) {
        loop {
            match self.queue.flush(identity).await {
                FlushOutcome::Flushed(_) => continue,
                FlushOutcome::Empty => break,
                FlushOutcome::Requeued { .. } => {
                    warn!(identity = %identity, "Leaving outcomes for the final flush");
                    break;
                }
            }
        }

        let remaining = self.queue.close(identity).await;
        if remaining > 0 {
            warn!(identity = %identity, remaining, "Outcomes still buffered");
        }
    }
}
