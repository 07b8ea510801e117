// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Operator run controls (stop, pause)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Granularity of the pause wait loop
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stop and pause signals shared by every task of a run.
///
/// Cloning is cheap; clones observe the same state. Stop is final, pause
/// can be toggled any number of times.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    stop: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop: no new identities or objects are dispatched.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Stop requested");
        }
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Run paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Run resumed");
    }

    /// Flip the pause state and return the new value.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.paused.fetch_xor(true, Ordering::SeqCst);
        info!(paused, "Pause toggled");
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Poll until the run is resumed or stopped.
    pub async fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_stopped() {
            tokio::select! {
                _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                _ = self.stop.cancelled() => break,
            }
        }
    }
}
