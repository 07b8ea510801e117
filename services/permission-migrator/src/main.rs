// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Permission Migrator
//!
//! Rewrites sharing grants across every object owned by a roster of
//! identities. For each identity whose roster row is pending it:
//!
//! - Lists every object the identity can see
//! - Re-grants each permission held by a mapped old identity to its new one
//! - Records one outcome per object in the identity's detail sheet
//! - Marks the identity Completed or Failed in the roster
//!
//! SIGINT/SIGTERM stop the run; SIGUSR2 toggles pause (Unix only).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use migration_types::{FileOutcome, MigrationResult};
use tracing::{debug, info, warn};

use permission_migrator::auth::{DEFAULT_SCOPES, ServiceIdentity, TokenManager};
use permission_migrator::config::MigratorConfig;
use permission_migrator::control::RunControl;
use permission_migrator::drive::DriveClient;
use permission_migrator::executor::{RateLimiterState, RequestExecutor};
use permission_migrator::jobs::migrate::{
    MigrationOrchestrator, PermissionMigrator, ProgressListener,
};
use permission_migrator::metrics;
use permission_migrator::runner::Runner;
use permission_migrator::store::SheetsStore;
use permission_migrator::transport::{HttpTransport, Transport};
use permission_migrator::writeback::{BatchSink, WriteBackQueue};

/// Objects between progress log lines
const PROGRESS_LOG_INTERVAL: usize = 50;

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn print_help(program: &str) {
    print_version();
    println!("Usage: {} [OPTIONS]", program);
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!("  --check          Verify credentials against the first roster identity and exit");
    println!();
    println!("Environment variables:");
    println!("  SERVICE_ACCOUNT_EMAIL    Service identity that signs token requests (required)");
    println!("  PRIVATE_KEY_FILE         PEM private key of the service identity (required)");
    println!("  SPREADSHEET_ID           Tracking store spreadsheet id (required)");
    println!("  OUTER_POOL_SIZE          Identities migrated concurrently (default: 5)");
    println!("  INNER_POOL_SIZE          Objects migrated concurrently per identity (default: 3)");
    println!("  WRITE_DELAY_MS           Initial spacing between writes (default: 150)");
    println!("  MAX_RETRIES              Retries per throttled or failed call (default: 5)");
    println!("  CONFIG_FILE              JSON file overriding tunables (optional)");
    println!("  RUST_LOG                 Log filter (default: permission_migrator=info)");
}

/// Logs per-object progress and per-identity summaries.
struct LogListener;

#[async_trait]
impl ProgressListener for LogListener {
    async fn on_progress(
        &self,
        identity: &str,
        processed: usize,
        total: usize,
        outcome: &FileOutcome,
    ) {
        debug!(
            identity = %identity,
            object_id = %outcome.object_id,
            status = %outcome.status,
            "Object processed"
        );
        if processed % PROGRESS_LOG_INTERVAL == 0 || processed == total {
            info!(identity = %identity, processed, total, "Progress");
        }
    }

    async fn on_identity_complete(&self, result: &MigrationResult) {
        info!(
            identity = %result.identity,
            success = result.success,
            total = result.stats.total,
            succeeded = result.stats.success,
            failed = result.stats.failed,
            restricted = result.stats.restricted,
            skipped = result.stats.skipped,
            duration_secs = result.duration().map(|d| d.num_seconds()).unwrap_or_default(),
            "Identity complete"
        );
    }
}

#[cfg(unix)]
fn spawn_signal_handlers(control: RunControl) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sigusr2 =
        signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => control.stop(),
                _ = sigterm.recv() => control.stop(),
                _ = sigusr2.recv() => {
                    control.toggle_pause();
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handlers(control: RunControl) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.stop();
        }
    });
    Ok(())
}

async fn load_config() -> Result<MigratorConfig> {
    let mut config = MigratorConfig::from_env().context("Failed to load configuration")?;

    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        let overlay = MigratorConfig::from_file(Path::new(&config_file)).await?;
        config.merge_overlay(&overlay);
        info!(config_file = %config_file, "Applied config file overrides");
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn build_runner(config: &MigratorConfig, control: RunControl) -> Result<Runner> {
    let private_key = config.load_private_key().await?;
    let identity = ServiceIdentity::from_pem(config.service_account_email.clone(), &private_key)
        .context("Invalid service identity")?;

    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(config.http_timeout_secs).context("Failed to create HTTP client")?,
    );
    let tokens = Arc::new(TokenManager::new(
        identity,
        Arc::clone(&transport),
        config.token_url()?,
        DEFAULT_SCOPES,
    ));

    let drive = Arc::new(DriveClient::new(
        Arc::new(RequestExecutor::new(
            Arc::clone(&tokens),
            Arc::clone(&transport),
            Arc::new(RateLimiterState::new(config.pacing())),
            config.max_retries,
        )),
        config.drive_base_url()?,
        config.page_size,
        config.max_objects,
    ));

    let store = Arc::new(
        SheetsStore::new(
            RequestExecutor::new(
                tokens,
                transport,
                Arc::new(RateLimiterState::new(config.store_pacing())),
                config.max_retries,
            ),
            config.sheets_base_url()?,
            config.spreadsheet_id.clone(),
            config.display_utc_offset_minutes,
        )
        .context("Invalid tracking store settings")?,
    );

    let queue = Arc::new(WriteBackQueue::new(
        Arc::clone(&store) as Arc<dyn BatchSink>,
        config.write_back(),
    ));

    let orchestrator = Arc::new(MigrationOrchestrator::new(
        Arc::clone(&drive),
        Arc::new(PermissionMigrator::new(Arc::clone(&drive))),
        config.orchestrator(),
        control.clone(),
    ));

    Ok(Runner::new(
        store,
        queue,
        drive,
        orchestrator,
        control,
        config.outer_pool_size,
    ))
}

/// What the command line asked for
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Version,
    Help,
    Run { check_only: bool },
}

/// Parse `argv`, tolerating an empty one.
fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut check_only = false;
    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "-V" | "--version" => return Ok(Command::Version),
            "-h" | "--help" => return Ok(Command::Help),
            "--check" => check_only = true,
            other => return Err(other.to_string()),
        }
    }
    Ok(Command::Run { check_only })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("permission-migrator", String::as_str);
    let check_only = match parse_args(&args) {
        Ok(Command::Version) => {
            print_version();
            return Ok(());
        }
        Ok(Command::Help) => {
            print_help(program);
            return Ok(());
        }
        Ok(Command::Run { check_only }) => check_only,
        Err(arg) => {
            eprintln!("Unknown option: {}", arg);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "permission_migrator=info".to_string()),
        ))
        .init();

    print_version();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    metrics::register_metrics();

    let config = load_config().await?;
    info!(
        service_account = %config.service_account_email,
        spreadsheet_id = %config.spreadsheet_id,
        outer_pool_size = config.outer_pool_size,
        inner_pool_size = config.inner_pool_size,
        "Configuration loaded"
    );

    let control = RunControl::new();
    spawn_signal_handlers(control.clone())?;

    let runner = Arc::new(build_runner(&config, control).await?);

    if check_only {
        let (identity, reported) = runner.check().await.context("Connection check failed")?;
        info!(
            identity = %identity,
            reported = reported.as_deref().unwrap_or("unknown"),
            "Connection OK"
        );
        return Ok(());
    }

    let summary = runner
        .run(Arc::new(LogListener))
        .await
        .context("Migration run failed")?;

    if summary.unflushed > 0 {
        warn!(
            unflushed = summary.unflushed,
            "Some outcomes could not be written to the tracking store"
        );
    }
    info!(
        identities = summary.identities,
        completed = summary.completed,
        failed = summary.failed,
        interrupted = summary.interrupted,
        not_started = summary.not_started,
        "Migration run complete"
    );

    debug!(metrics = %metrics::gather_metrics(), "Final metrics");
    Ok(())
}
