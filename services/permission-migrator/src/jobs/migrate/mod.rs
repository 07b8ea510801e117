// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-identity migration job
//!
//! Runs the permission rewrite over every object of one identity:
//!
//! 1. List all objects (the identity fails as a whole if this fails)
//! 2. Submit one task per object to a bounded inner worker pool
//! 3. Await each task with a per-object timeout; timeouts and task
//!    failures become ERROR outcomes without disturbing the others
//! 4. Report every outcome to the progress listener as it completes
//!
//! A stop request halts dispatch. Tasks already running are given a bounded
//! grace period and then aborted; objects that never started are reported
//! as SKIPPED so that every listed object still yields exactly one outcome.

pub mod permissions;

pub use permissions::{PermissionMigrator, migratable_principal};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use migration_types::{
    FileOutcome, IdentityMapping, MigrationPhase, MigrationResult, OutcomeStatus, RemoteObject,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use super::MigrationError;
use crate::control::RunControl;
use crate::drive::DriveClient;
use crate::metrics;

pub const DEFAULT_INNER_POOL_SIZE: usize = 3;
pub const DEFAULT_OBJECT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(300);

const STOPPED_BEFORE_PROCESSING: &str = "Stopped before processing";

/// Receives per-object and per-identity progress.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    /// Called once per completed object, in completion order.
    async fn on_progress(
        &self,
        identity: &str,
        processed: usize,
        total: usize,
        outcome: &FileOutcome,
    );

    /// Called once an identity's run has been fully recorded.
    async fn on_identity_complete(&self, _result: &MigrationResult) {}
}

/// Listener that ignores everything
pub struct NoopListener;

#[async_trait]
impl ProgressListener for NoopListener {
    async fn on_progress(&self, _: &str, _: usize, _: usize, _: &FileOutcome) {}
}

/// Inner pool settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Objects migrated concurrently for one identity
    pub inner_pool_size: usize,
    /// Longest a single object's migration may take
    pub object_timeout: Duration,
    /// How long running tasks may continue after a stop request
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inner_pool_size: DEFAULT_INNER_POOL_SIZE,
            object_timeout: DEFAULT_OBJECT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

fn advance(phase: &mut MigrationPhase, next: MigrationPhase, identity: &str) {
    debug_assert!(
        phase.can_transition_to(next),
        "illegal transition {phase} -> {next}"
    );
    debug!(identity = %identity, from = %phase, to = %next, "Migration phase");
    *phase = next;
}

fn object_error(object: &RemoteObject, detail: impl Into<String>) -> FileOutcome {
    FileOutcome::for_object(object, OutcomeStatus::Error).with_error(detail)
}

/// Runs the migration for one identity at a time.
pub struct MigrationOrchestrator {
    drive: Arc<DriveClient>,
    migrator: Arc<PermissionMigrator>,
    config: OrchestratorConfig,
    control: RunControl,
}

impl MigrationOrchestrator {
    pub fn new(
        drive: Arc<DriveClient>,
        migrator: Arc<PermissionMigrator>,
        config: OrchestratorConfig,
        control: RunControl,
    ) -> Self {
        Self {
            drive,
            migrator,
            config,
            control,
        }
    }

    /// Migrate every object `identity` can see.
    ///
    /// Only a listing failure is returned as an error; it carries the
    /// finalized, unsuccessful result.
    pub async fn run(
        &self,
        identity: &str,
        mapping: Arc<IdentityMapping>,
        listener: &dyn ProgressListener,
    ) -> Result<MigrationResult, MigrationError> {
        let mut result = MigrationResult::start(identity);
        let mut phase = MigrationPhase::NotStarted;

        info!(
            identity = %identity,
            inner_pool_size = self.config.inner_pool_size,
            "Starting migration"
        );

        advance(&mut phase, MigrationPhase::Listing, identity);
        let objects = match self.drive.list_all(identity).await {
            Ok(objects) => objects,
            Err(source) => {
                advance(&mut phase, MigrationPhase::Failed, identity);
                error!(identity = %identity, error = %source, "Failed to list objects");
                result.finish(false, Some(source.to_string()));
                return Err(MigrationError::Listing {
                    identity: identity.to_string(),
                    source,
                    result: Box::new(result),
                });
            }
        };

        let total = objects.len();
        result.stats.total = total;

        if objects.is_empty() {
            advance(&mut phase, MigrationPhase::Done, identity);
            result.finish(true, None);
            info!(identity = %identity, "No objects to migrate");
            return Ok(result);
        }

        advance(&mut phase, MigrationPhase::FanOut, identity);

        let mut tasks: JoinSet<FileOutcome> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, RemoteObject> = HashMap::new();
        let mut processed = 0usize;

        let permits = Arc::new(Semaphore::new(self.config.inner_pool_size.max(1)));
        let mut pending = objects.into_iter();
        let mut deadline: Option<Instant> = None;
        let mut aborted = false;

        loop {
            let joined = if aborted {
                tasks.join_next_with_id().await
            } else if let Some(at) = deadline {
                match timeout_at(at, tasks.join_next_with_id()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            identity = %identity,
                            running = tasks.len(),
                            "Shutdown grace expired, aborting running tasks"
                        );
                        tasks.abort_all();
                        aborted = true;
                        continue;
                    }
                }
            } else {
                let dispatching = !pending.as_slice().is_empty();
                if !dispatching && tasks.is_empty() {
                    break;
                }
                tokio::select! {
                    biased;

                    _ = self.control.stopped() => {
                        info!(
                            identity = %identity,
                            running = tasks.len(),
                            grace_secs = self.config.shutdown_grace.as_secs(),
                            "Stop requested, draining running tasks"
                        );
                        deadline = Some(Instant::now() + self.config.shutdown_grace);
                        continue;
                    }
                    permit = Arc::clone(&permits).acquire_owned(), if dispatching => {
                        let Ok(permit) = permit else { continue };
                        let Some(object) = pending.next() else { continue };
                        let handle = tasks.spawn(self.migrate_one(
                            identity,
                            Arc::clone(&mapping),
                            object.clone(),
                            permit,
                        ));
                        in_flight.insert(handle.id(), object);
                        continue;
                    }
                    joined = tasks.join_next_with_id(), if !tasks.is_empty() => joined,
                }
            };

            let Some(joined) = joined else {
                break;
            };

            let outcome = match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    outcome
                }
                Err(e) => match in_flight.remove(&e.id()) {
                    Some(object) => {
                        warn!(
                            identity = %identity,
                            object_id = %object.id,
                            error = %e,
                            "Object task did not complete"
                        );
                        object_error(&object, format!("Task failed: {e}"))
                    }
                    None => {
                        error!(identity = %identity, error = %e, "Unknown task failed");
                        continue;
                    }
                },
            };

            processed += 1;
            metrics::record_outcome(outcome.status);
            listener.on_progress(identity, processed, total, &outcome).await;
            result.push(outcome);
        }

        // Objects never dispatched because of a stop still need an outcome.
        let undispatched: Vec<RemoteObject> = pending.collect();
        result.interrupted = aborted || !undispatched.is_empty();
        if !undispatched.is_empty() {
            info!(
                identity = %identity,
                count = undispatched.len(),
                "Skipping objects not dispatched before stop"
            );
        }
        for object in undispatched {
            let outcome = FileOutcome::for_object(&object, OutcomeStatus::Skipped)
                .with_error(STOPPED_BEFORE_PROCESSING);
            processed += 1;
            metrics::record_outcome(outcome.status);
            listener.on_progress(identity, processed, total, &outcome).await;
            result.push(outcome);
        }

        advance(&mut phase, MigrationPhase::Aggregating, identity);
        result.finish(true, None);
        advance(&mut phase, MigrationPhase::Done, identity);

        info!(
            identity = %identity,
            total = result.stats.total,
            success = result.stats.success,
            failed = result.stats.failed,
            restricted = result.stats.restricted,
            skipped = result.stats.skipped,
            delay_ms = self.drive_delay_ms(),
            "Migration finished"
        );

        Ok(result)
    }

    fn drive_delay_ms(&self) -> u64 {
        self.drive.write_delay_ms()
    }

    /// One worker task: migrate `object` under the per-object timeout,
    /// holding `permit` for the duration.
    fn migrate_one(
        &self,
        identity: &str,
        mapping: Arc<IdentityMapping>,
        object: RemoteObject,
        permit: OwnedSemaphorePermit,
    ) -> impl Future<Output = FileOutcome> + Send + 'static {
        let migrator = Arc::clone(&self.migrator);
        let identity = identity.to_string();
        let object_timeout = self.config.object_timeout;

        async move {
            let _permit = permit;
            match timeout(object_timeout, migrator.migrate(&object, &mapping, &identity)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        identity = %identity,
                        object_id = %object.id,
                        "Object migration timed out"
                    );
                    object_error(
                        &object,
                        format!("Timed out after {}s", object_timeout.as_secs()),
                    )
                }
            }
        }
    }
}
