//! Command surface
//!
//! Flag parsing, logging setup and signal handling around one backup run. The
//! embedding binary supplies the collaborators that reach the real cluster.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backup::{Backup, Collaborators, RunContext};
use crate::config::{read_filter_file, BackupOptions, CompressionType, ObjectFilter};
use crate::errors::ExitStatus;

#[derive(Parser, Debug, Clone)]
#[command(name = "driftdump")]
#[command(about = "Consistent parallel backups of a DriftDB cluster")]
pub struct BackupArgs {
    /// Database to back up
    #[arg(long, env = "PGDATABASE")]
    pub dbname: String,

    /// Root for backup files; each segment's data directory when omitted
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Directory holding the per-timestamp lock file
    #[arg(long)]
    pub lock_dir: Option<PathBuf>,

    /// Use this timestamp (YYYYMMDDHHMMSS) instead of the current time
    #[arg(long)]
    pub timestamp: Option<String>,

    /// Number of parallel connections
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    #[arg(long)]
    pub include_schema: Vec<String>,

    #[arg(long)]
    pub include_schema_file: Option<PathBuf>,

    #[arg(long)]
    pub exclude_schema: Vec<String>,

    #[arg(long)]
    pub exclude_schema_file: Option<PathBuf>,

    /// Schema-qualified table, may be repeated
    #[arg(long)]
    pub include_table: Vec<String>,

    #[arg(long)]
    pub include_table_file: Option<PathBuf>,

    #[arg(long)]
    pub exclude_table: Vec<String>,

    #[arg(long)]
    pub exclude_table_file: Option<PathBuf>,

    #[arg(long, conflicts_with = "data_only")]
    pub metadata_only: bool,

    #[arg(long)]
    pub data_only: bool,

    /// Only copy tables changed since a compatible earlier backup
    #[arg(long)]
    pub incremental: bool,

    /// Base the incremental backup on this timestamp
    #[arg(long, requires = "incremental")]
    pub from_timestamp: Option<String>,

    /// One data file per segment instead of one per table
    #[arg(long)]
    pub single_data_file: bool,

    #[arg(long)]
    pub leaf_partition_data: bool,

    #[arg(long)]
    pub with_stats: bool,

    #[arg(long)]
    pub no_compression: bool,

    #[arg(long)]
    pub compression_level: Option<u32>,

    /// gzip or zstd
    #[arg(long, default_value = "gzip")]
    pub compression_type: String,

    /// Storage plugin configuration (YAML)
    #[arg(long)]
    pub plugin_config: Option<PathBuf>,

    /// Seconds to wait for another backup holding the same timestamp
    #[arg(long)]
    pub lock_wait_timeout: Option<u64>,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub debug: bool,

    #[arg(short, long, conflicts_with_all = ["verbose", "debug"])]
    pub quiet: bool,
}

fn extend_from_file(list: &mut Vec<String>, path: Option<&PathBuf>) -> Result<()> {
    if let Some(path) = path {
        let entries = read_filter_file(path)
            .with_context(|| format!("Failed to read filter file {}", path.display()))?;
        list.extend(entries);
    }
    Ok(())
}

impl BackupArgs {
    /// Converts the flags into validated options, reading any filter files.
    pub fn into_options(self) -> Result<BackupOptions> {
        let mut filter = ObjectFilter {
            include_schemas: self.include_schema,
            exclude_schemas: self.exclude_schema,
            include_relations: self.include_table,
            exclude_relations: self.exclude_table,
        };
        extend_from_file(&mut filter.include_schemas, self.include_schema_file.as_ref())?;
        extend_from_file(&mut filter.exclude_schemas, self.exclude_schema_file.as_ref())?;
        extend_from_file(&mut filter.include_relations, self.include_table_file.as_ref())?;
        extend_from_file(&mut filter.exclude_relations, self.exclude_table_file.as_ref())?;

        let options = BackupOptions {
            dbname: self.dbname,
            backup_dir: self.backup_dir,
            lock_dir: self.lock_dir.unwrap_or_else(std::env::temp_dir),
            timestamp: self.timestamp,
            jobs: self.jobs,
            filter,
            metadata_only: self.metadata_only,
            data_only: self.data_only,
            incremental: self.incremental,
            from_timestamp: self.from_timestamp,
            single_data_file: self.single_data_file,
            leaf_partition_data: self.leaf_partition_data,
            with_stats: self.with_stats,
            no_compression: self.no_compression,
            compression_level: self.compression_level,
            compression_type: CompressionType::parse(&self.compression_type)?,
            plugin_config: self.plugin_config,
            lock_wait_timeout: self.lock_wait_timeout.map(Duration::from_secs),
        };
        options.validate().context("Invalid backup options")?;
        Ok(options)
    }

    fn default_log_filter(&self) -> &'static str {
        if self.debug || self.verbose {
            "driftdump_core=debug"
        } else if self.quiet {
            "driftdump_core=warn"
        } else {
            "driftdump_core=info"
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the verbosity flags.
pub fn init_logging(args: &BackupArgs) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.default_log_filter())),
        )
        .try_init();
}

/// Cancels the run and cleans up once `trigger` completes.
pub fn listen_for_cancel<F>(ctx: Arc<RunContext>, trigger: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        trigger.await;
        // Cleanup blocks on connection shutdown and remote commands
        if let Err(e) = tokio::task::spawn_blocking(move || ctx.handle_cancel_signal()).await {
            error!("Cancellation handler failed: {}", e);
        }
    })
}

/// Waits for Ctrl-C or SIGTERM, then cancels the run.
pub fn spawn_signal_listener(ctx: Arc<RunContext>) -> JoinHandle<()> {
    listen_for_cancel(ctx, cancel_on_signal())
}

async fn cancel_on_signal() {
    if let Err(e) = shutdown_signal().await {
        warn!("Cannot listen for termination signals: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        return tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        };
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Runs the backup described by `options` on a blocking task, cancelling it
/// when `trigger` completes first.
pub async fn run_with_trigger<F>(
    options: BackupOptions,
    collaborators: Collaborators,
    trigger: F,
) -> ExitStatus
where
    F: Future<Output = ()> + Send + 'static,
{
    let backup = match Backup::new(options, collaborators) {
        Ok(backup) => backup,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::Fatal;
        }
    };

    let listener = listen_for_cancel(backup.context(), trigger);
    let outcome = tokio::task::spawn_blocking(move || backup.run()).await;
    listener.abort();

    match outcome {
        Ok(outcome) => {
            match &outcome.error {
                Some(message) => error!("Backup {} ended: {}", outcome.timestamp, message),
                None => info!("Backup {} ended with {:?}", outcome.timestamp, outcome.status),
            }
            outcome.status
        }
        Err(e) => {
            error!("Backup task failed: {}", e);
            ExitStatus::Unexpected
        }
    }
}

/// Full command entry point; the process exit code is `run(..).await.code()`.
pub async fn run(args: BackupArgs, collaborators: Collaborators) -> ExitStatus {
    init_logging(&args);
    let options = match args.into_options() {
        Ok(options) => options,
        Err(e) => {
            error!("{:#}", e);
            return ExitStatus::Fatal;
        }
    };
    run_with_trigger(options, collaborators, cancel_on_signal()).await
}
