// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Permission Migrator Library
//!
//! Core of the permission migrator: delegated token minting, paced and
//! retried API calls, object listing, the per-identity migration job, and
//! batched write-back of outcomes to the tracking store.

pub mod auth;
pub mod config;
pub mod control;
pub mod drive;
pub mod executor;
pub mod jobs;
pub mod metrics;
pub mod runner;
pub mod store;
pub mod transport;
pub mod writeback;

#[cfg(test)]
mod testing;
