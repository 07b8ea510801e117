// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Job execution for the permission migrator
//!
//! This module contains the per-identity migration job: listing an
//! identity's objects, fanning the permission rewrite out over a bounded
//! worker pool, and aggregating the per-object outcomes.

pub mod migrate;

use migration_types::{Identity, MigrationResult};
use thiserror::Error;

use crate::executor::ApiError;

/// Migration job errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The listing failed, so no object was processed. `result` is the
    /// finalized (unsuccessful) aggregate for the identity.
    #[error("Failed to list objects for {identity}: {source}")]
    Listing {
        identity: Identity,
        #[source]
        source: ApiError,
        result: Box<MigrationResult>,
    },
}

impl MigrationError {
    /// The finalized result recorded before the error was raised
    pub fn result(&self) -> &MigrationResult {
        match self {
            MigrationError::Listing { result, .. } => result,
        }
    }

    pub fn into_result(self) -> MigrationResult {
        match self {
            MigrationError::Listing { result, .. } => *result,
        }
    }
}
