// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Configuration for the permission migrator

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use secrecy::SecretString;
use serde::Deserialize;

use crate::auth::DEFAULT_TOKEN_URL;
use crate::drive::{DEFAULT_DRIVE_BASE_URL, DEFAULT_MAX_OBJECTS, DEFAULT_PAGE_SIZE};
use crate::executor::{
    DEFAULT_ADMISSION_CAPACITY, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_RETRIES, DEFAULT_MIN_DELAY_MS, PacingConfig,
};
use crate::jobs::migrate::{
    DEFAULT_INNER_POOL_SIZE, DEFAULT_OBJECT_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, OrchestratorConfig,
};
use crate::runner::DEFAULT_OUTER_POOL_SIZE;
use crate::store::{
    DEFAULT_DISPLAY_UTC_OFFSET_MINUTES, DEFAULT_SHEETS_BASE_URL, DEFAULT_STORE_CALL_INTERVAL_MS,
};
use crate::writeback::{
    DEFAULT_AUTO_FLUSH_THRESHOLD, DEFAULT_FLUSH_BATCH_SIZE, DEFAULT_FLUSH_PAUSE,
    DEFAULT_QUEUE_CAPACITY, WriteBackConfig,
};

/// Migrator configuration loaded from environment variables or a JSON file
///
/// Credentials and the tracking store id only come from the environment
/// (see `from_env()`). The JSON file named by `CONFIG_FILE` may override
/// any of the tunables (see `merge_overlay()`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Service identity that signs assertions
    #[serde(skip)]
    pub service_account_email: String,

    /// PEM file holding the service identity's private key
    #[serde(skip)]
    pub private_key_file: PathBuf,

    /// Tracking store spreadsheet
    #[serde(skip)]
    pub spreadsheet_id: String,

    /// Identities migrated concurrently
    pub outer_pool_size: usize,

    /// Objects migrated concurrently per identity
    pub inner_pool_size: usize,

    pub admission_capacity: usize,
    pub initial_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,

    pub page_size: u32,
    pub max_objects: usize,

    pub object_timeout_secs: u64,
    pub shutdown_grace_secs: u64,

    pub flush_batch_size: usize,
    pub auto_flush_threshold: usize,
    pub queue_capacity: usize,
    pub flush_pause_ms: u64,

    /// Fixed spacing between tracking store calls
    pub store_call_interval_ms: u64,

    /// HTTP client timeout in seconds
    pub http_timeout_secs: u64,

    pub token_url: String,
    pub drive_base_url: String,
    pub sheets_base_url: String,

    /// Offset applied to timestamps written to the tracking store
    pub display_utc_offset_minutes: i32,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            service_account_email: String::new(),
            private_key_file: PathBuf::new(),
            spreadsheet_id: String::new(),
            outer_pool_size: DEFAULT_OUTER_POOL_SIZE,
            inner_pool_size: DEFAULT_INNER_POOL_SIZE,
            admission_capacity: DEFAULT_ADMISSION_CAPACITY,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            page_size: DEFAULT_PAGE_SIZE,
            max_objects: DEFAULT_MAX_OBJECTS,
            object_timeout_secs: DEFAULT_OBJECT_TIMEOUT.as_secs(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            auto_flush_threshold: DEFAULT_AUTO_FLUSH_THRESHOLD,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_pause_ms: DEFAULT_FLUSH_PAUSE.as_millis() as u64,
            store_call_interval_ms: DEFAULT_STORE_CALL_INTERVAL_MS,
            http_timeout_secs: 60,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            drive_base_url: DEFAULT_DRIVE_BASE_URL.to_string(),
            sheets_base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            display_utc_offset_minutes: DEFAULT_DISPLAY_UTC_OFFSET_MINUTES,
        }
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{key} environment variable required"))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

impl MigratorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source using the environment
    /// variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            service_account_email: required(&lookup, "SERVICE_ACCOUNT_EMAIL")?,
            private_key_file: PathBuf::from(required(&lookup, "PRIVATE_KEY_FILE")?),
            spreadsheet_id: required(&lookup, "SPREADSHEET_ID")?,
            outer_pool_size: parse_or(&lookup, "OUTER_POOL_SIZE", defaults.outer_pool_size)?,
            inner_pool_size: parse_or(&lookup, "INNER_POOL_SIZE", defaults.inner_pool_size)?,
            admission_capacity: parse_or(
                &lookup,
                "ADMISSION_CAPACITY",
                defaults.admission_capacity,
            )?,
            initial_delay_ms: parse_or(&lookup, "WRITE_DELAY_MS", defaults.initial_delay_ms)?,
            min_delay_ms: parse_or(&lookup, "MIN_WRITE_DELAY_MS", defaults.min_delay_ms)?,
            max_delay_ms: parse_or(&lookup, "MAX_WRITE_DELAY_MS", defaults.max_delay_ms)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            page_size: parse_or(&lookup, "PAGE_SIZE", defaults.page_size)?,
            max_objects: parse_or(&lookup, "MAX_OBJECTS", defaults.max_objects)?,
            object_timeout_secs: parse_or(
                &lookup,
                "OBJECT_TIMEOUT_SECS",
                defaults.object_timeout_secs,
            )?,
            shutdown_grace_secs: parse_or(
                &lookup,
                "SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace_secs,
            )?,
            flush_batch_size: parse_or(&lookup, "FLUSH_BATCH_SIZE", defaults.flush_batch_size)?,
            auto_flush_threshold: parse_or(
                &lookup,
                "AUTO_FLUSH_THRESHOLD",
                defaults.auto_flush_threshold,
            )?,
            queue_capacity: parse_or(&lookup, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            flush_pause_ms: parse_or(&lookup, "FLUSH_PAUSE_MS", defaults.flush_pause_ms)?,
            store_call_interval_ms: parse_or(
                &lookup,
                "STORE_CALL_INTERVAL_MS",
                defaults.store_call_interval_ms,
            )?,
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            token_url: lookup("TOKEN_URL").unwrap_or(defaults.token_url),
            drive_base_url: lookup("DRIVE_BASE_URL").unwrap_or(defaults.drive_base_url),
            sheets_base_url: lookup("SHEETS_BASE_URL").unwrap_or(defaults.sheets_base_url),
            display_utc_offset_minutes: parse_or(
                &lookup,
                "DISPLAY_UTC_OFFSET_MINUTES",
                defaults.display_utc_offset_minutes,
            )?,
        })
    }

    /// Load configuration from a JSON file
    ///
    /// Credential fields are never read from the file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Take every tunable from `other`, keeping credentials and the
    /// tracking store id.
    pub fn merge_overlay(&mut self, other: &MigratorConfig) {
        let service_account_email = std::mem::take(&mut self.service_account_email);
        let private_key_file = std::mem::take(&mut self.private_key_file);
        let spreadsheet_id = std::mem::take(&mut self.spreadsheet_id);

        *self = Self {
            service_account_email,
            private_key_file,
            spreadsheet_id,
            ..other.clone()
        };
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.outer_pool_size == 0 || self.inner_pool_size == 0 {
            bail!("Pool sizes must be at least 1");
        }
        if self.admission_capacity == 0 {
            bail!("ADMISSION_CAPACITY must be at least 1");
        }
        if self.min_delay_ms > self.max_delay_ms {
            bail!(
                "MIN_WRITE_DELAY_MS ({}) exceeds MAX_WRITE_DELAY_MS ({})",
                self.min_delay_ms,
                self.max_delay_ms
            );
        }
        if !(self.min_delay_ms..=self.max_delay_ms).contains(&self.initial_delay_ms) {
            bail!(
                "WRITE_DELAY_MS ({}) must lie within {}..={}",
                self.initial_delay_ms,
                self.min_delay_ms,
                self.max_delay_ms
            );
        }
        if self.page_size == 0 || self.max_objects == 0 {
            bail!("PAGE_SIZE and MAX_OBJECTS must be at least 1");
        }
        if self.flush_batch_size == 0 || self.auto_flush_threshold == 0 {
            bail!("FLUSH_BATCH_SIZE and AUTO_FLUSH_THRESHOLD must be at least 1");
        }
        if self.queue_capacity < self.auto_flush_threshold {
            bail!(
                "QUEUE_CAPACITY ({}) is below AUTO_FLUSH_THRESHOLD ({})",
                self.queue_capacity,
                self.auto_flush_threshold
            );
        }
        self.token_url()?;
        self.drive_base_url()?;
        self.sheets_base_url()?;
        Ok(())
    }

    pub fn token_url(&self) -> Result<Url> {
        Url::parse(&self.token_url).with_context(|| format!("Invalid TOKEN_URL: {}", self.token_url))
    }

    pub fn drive_base_url(&self) -> Result<Url> {
        Url::parse(&self.drive_base_url)
            .with_context(|| format!("Invalid DRIVE_BASE_URL: {}", self.drive_base_url))
    }

    pub fn sheets_base_url(&self) -> Result<Url> {
        Url::parse(&self.sheets_base_url)
            .with_context(|| format!("Invalid SHEETS_BASE_URL: {}", self.sheets_base_url))
    }

    /// Read the service identity's private key
    pub async fn load_private_key(&self) -> Result<SecretString> {
        let pem = tokio::fs::read_to_string(&self.private_key_file)
            .await
            .with_context(|| {
                format!(
                    "Failed to read private key file: {}",
                    self.private_key_file.display()
                )
            })?;
        Ok(SecretString::from(pem))
    }

    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            initial_delay_ms: self.initial_delay_ms,
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            admission_capacity: self.admission_capacity,
        }
    }

    pub fn store_pacing(&self) -> PacingConfig {
        PacingConfig::fixed(self.store_call_interval_ms)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            inner_pool_size: self.inner_pool_size,
            object_timeout: Duration::from_secs(self.object_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn write_back(&self) -> WriteBackConfig {
        WriteBackConfig {
            batch_size: self.flush_batch_size,
            auto_flush_threshold: self.auto_flush_threshold,
            capacity: self.queue_capacity,
            flush_pause: Duration::from_millis(self.flush_pause_ms),
        }
    }
}
