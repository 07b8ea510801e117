// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the permission migrator
//!
//! Exports metrics for monitoring a migration run including:
//! - Outbound calls by kind (read, write)
//! - Throttle responses and retries
//! - Object outcomes by status
//! - Write-back rows flushed and dropped
//! - Token mints

use migration_types::OutcomeStatus;
use prometheus::{Counter, CounterVec, Opts, Registry, TextEncoder};

// Static metric initialization uses expect because these are compile-time
// constant definitions that cannot fail in practice.
//
// This module exists to scope the clippy allow attributes to just the metric definitions.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all migrator metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Outbound API calls by kind (read, write)
        pub static ref CALLS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("permission_migrator_calls_total", "Outbound API calls by kind"),
            &["kind"]
        ).expect("valid metric name and labels");

        /// Throttling responses (429/403) received
        pub static ref THROTTLED_TOTAL: Counter = Counter::with_opts(
            Opts::new("permission_migrator_throttled_total", "Throttling responses received")
        ).expect("valid metric name");

        /// Retries by reason (throttled, transient)
        pub static ref RETRIES_TOTAL: CounterVec = CounterVec::new(
            Opts::new("permission_migrator_retries_total", "Retried calls by reason"),
            &["reason"]
        ).expect("valid metric name and labels");

        /// Objects processed by outcome status
        pub static ref OUTCOMES_TOTAL: CounterVec = CounterVec::new(
            Opts::new("permission_migrator_outcomes_total", "Objects processed by status"),
            &["status"]
        ).expect("valid metric name and labels");

        /// Detail rows durably written to the tracking store
        pub static ref ROWS_FLUSHED: Counter = Counter::with_opts(
            Opts::new("permission_migrator_rows_flushed_total", "Detail rows written back")
        ).expect("valid metric name");

        /// Detail rows dropped because a write-back buffer was full
        pub static ref ROWS_DROPPED: Counter = Counter::with_opts(
            Opts::new(
                "permission_migrator_rows_dropped_total",
                "Detail rows dropped at write-back capacity"
            )
        ).expect("valid metric name");

        /// Token exchanges attempted
        pub static ref TOKEN_MINTS: Counter = Counter::with_opts(
            Opts::new("permission_migrator_token_mints_total", "Token exchanges attempted")
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    CALLS_TOTAL, OUTCOMES_TOTAL, REGISTRY, RETRIES_TOTAL, ROWS_DROPPED, ROWS_FLUSHED,
    THROTTLED_TOTAL, TOKEN_MINTS,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(CALLS_TOTAL.clone()))
        .expect("Failed to register CALLS_TOTAL");
    REGISTRY
        .register(Box::new(THROTTLED_TOTAL.clone()))
        .expect("Failed to register THROTTLED_TOTAL");
    REGISTRY
        .register(Box::new(RETRIES_TOTAL.clone()))
        .expect("Failed to register RETRIES_TOTAL");
    REGISTRY
        .register(Box::new(OUTCOMES_TOTAL.clone()))
        .expect("Failed to register OUTCOMES_TOTAL");
    REGISTRY
        .register(Box::new(ROWS_FLUSHED.clone()))
        .expect("Failed to register ROWS_FLUSHED");
    REGISTRY
        .register(Box::new(ROWS_DROPPED.clone()))
        .expect("Failed to register ROWS_DROPPED");
    REGISTRY
        .register(Box::new(TOKEN_MINTS.clone()))
        .expect("Failed to register TOKEN_MINTS");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Record one outbound call
pub fn record_call(kind: &str) {
    CALLS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a throttling response
pub fn record_throttled() {
    THROTTLED_TOTAL.inc();
}

/// Record a retry and why it happened
pub fn record_retry(reason: &str) {
    RETRIES_TOTAL.with_label_values(&[reason]).inc();
}

/// Record a classified object outcome
pub fn record_outcome(status: OutcomeStatus) {
    OUTCOMES_TOTAL.with_label_values(&[&status.to_string()]).inc();
}

pub fn record_rows_flushed(count: usize) {
    ROWS_FLUSHED.inc_by(count as f64);
}

/// Record detail rows lost to the write-back capacity bound
pub fn record_rows_dropped(count: usize) {
    ROWS_DROPPED.inc_by(count as f64);
}

pub fn record_token_mint() {
    TOKEN_MINTS.inc();
}
