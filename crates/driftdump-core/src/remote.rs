//! Per-segment remote commands
//!
//! The transport that actually reaches a host lives outside this crate. This
//! module builds one shell command per segment, hands the batch to the
//! transport and folds the per-host results into a single outcome.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::Segment;
use crate::config::CompressionType;
use crate::errors::{BackupError, Result};
use crate::paths::FilePaths;

/// Name of the streaming helper started on each host in single-data-file mode.
pub const HELPER_PROGRAM: &str = "driftdump_helper";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub content_id: i32,
    pub hostname: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub content_id: i32,
    pub hostname: String,
    pub stdout: String,
    /// Set when the command could not run or exited non-zero.
    pub error: Option<String>,
}

/// Runs a batch of commands, one per segment, and reports each host's result.
pub trait RemoteExecutor: Send + Sync {
    fn execute(&self, commands: &[RemoteCommand]) -> Vec<RemoteOutput>;
}

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Hosts of the failed outputs, deduplicated, in segment order.
fn failed_hosts(outputs: &[RemoteOutput]) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for output in outputs.iter().filter(|o| o.error.is_some()) {
        let host = format!("{} (segment {})", output.hostname, output.content_id);
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}

/// Fails with every failing host named when any output carries an error.
pub fn check_outputs(action: &str, outputs: &[RemoteOutput]) -> Result<()> {
    for output in outputs {
        if let Some(error) = &output.error {
            warn!(
                "{} failed on {} (segment {}): {}",
                action, output.hostname, output.content_id, error
            );
        }
    }
    let hosts = failed_hosts(outputs);
    if hosts.is_empty() {
        Ok(())
    } else {
        Err(BackupError::RemoteExecution {
            action: action.to_string(),
            hosts,
        })
    }
}

/// The cluster's segments together with the transport that reaches them.
#[derive(Clone)]
pub struct RemoteCluster {
    executor: Arc<dyn RemoteExecutor>,
    segments: Vec<Segment>,
}

impl RemoteCluster {
    pub fn new(executor: Arc<dyn RemoteExecutor>, segments: Vec<Segment>) -> Self {
        Self { executor, segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn run<F>(&self, include_coordinator: bool, build: F) -> Result<Vec<RemoteOutput>>
    where
        F: Fn(&Segment) -> Result<String>,
    {
        let commands = self
            .segments
            .iter()
            .filter(|s| include_coordinator || !s.is_coordinator())
            .map(|segment| {
                Ok(RemoteCommand {
                    content_id: segment.content_id,
                    hostname: segment.hostname.clone(),
                    command: build(segment)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Running {} remote command(s)", commands.len());
        Ok(self.executor.execute(&commands))
    }

    /// Runs a required step; any failing host fails the step.
    pub fn run_required<F>(&self, action: &str, include_coordinator: bool, build: F) -> Result<()>
    where
        F: Fn(&Segment) -> Result<String>,
    {
        let outputs = self.run(include_coordinator, build)?;
        check_outputs(action, &outputs)?;
        info!("{} succeeded on {} segment(s)", action, outputs.len());
        Ok(())
    }

    /// Runs a cleanup step; failures are logged and counted.
    pub fn run_best_effort<F>(&self, action: &str, include_coordinator: bool, build: F) -> usize
    where
        F: Fn(&Segment) -> Result<String>,
    {
        match self.run(include_coordinator, build) {
            Ok(outputs) => {
                let failed = failed_hosts(&outputs);
                if !failed.is_empty() {
                    warn!("{} failed on: {}", action, failed.join(", "));
                }
                failed.len()
            }
            Err(e) => {
                warn!("{} could not be started: {}", action, e);
                1
            }
        }
    }

    pub fn create_backup_dirs(&self, paths: &FilePaths) -> Result<()> {
        self.run_required("Create backup directories", true, |segment| {
            Ok(format!(
                "mkdir -p {}",
                quote_path(&paths.segment_dir(segment.content_id)?)
            ))
        })
    }

    pub fn create_pipes(&self, paths: &FilePaths) -> Result<()> {
        self.run_required("Create segment pipes", false, |segment| {
            let pipe = paths.segment_pipe(segment.content_id)?;
            Ok(format!("rm -f {0} && mkfifo {0}", quote_path(&pipe)))
        })
    }

    /// Writes the ordered table OIDs the helper reads from each segment's pipe.
    pub fn write_oid_files(&self, paths: &FilePaths, oids: &[u32]) -> Result<()> {
        let list = oids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.run_required("Write table OID lists", false, |segment| {
            Ok(format!(
                "printf '%s\\n' {} > {}",
                list,
                quote_path(&paths.oid_file(segment.content_id)?)
            ))
        })
    }

    pub fn start_helpers(
        &self,
        paths: &FilePaths,
        compression: Option<(CompressionType, u32)>,
    ) -> Result<()> {
        self.run_required("Start segment helpers", false, |segment| {
            let content = segment.content_id;
            let mut data_file = paths.segment_data_file(content)?.to_string_lossy().into_owned();
            let mut flags = String::new();
            if let Some((kind, level)) = compression {
                data_file.push_str(kind.extension());
                flags = format!(
                    " --compression-type {} --compression-level {}",
                    match kind {
                        CompressionType::Gzip => "gzip",
                        CompressionType::Zstd => "zstd",
                    },
                    level
                );
            }
            Ok(format!(
                "nohup {} --backup-agent --content {} --oid-file {} --pipe-file {} \
                 --data-file {}{} --error-file {} > /dev/null 2>&1 &",
                HELPER_PROGRAM,
                content,
                quote_path(&paths.oid_file(content)?),
                quote_path(&paths.segment_pipe(content)?),
                shell_quote(&data_file),
                flags,
                quote_path(&paths.helper_error_file(content)?),
            ))
        })
    }

    /// Helpers leave an error file behind when they fail.
    pub fn check_helper_errors(&self, paths: &FilePaths) -> Result<()> {
        self.run_required("Check segment helpers", false, |segment| {
            Ok(format!(
                "test ! -e {}",
                quote_path(&paths.helper_error_file(segment.content_id)?)
            ))
        })
    }

    pub fn kill_helpers(&self, paths: &FilePaths) -> usize {
        self.run_best_effort("Stop segment helpers", false, |segment| {
            Ok(format!(
                "pkill -f {} || true",
                shell_quote(&format!(
                    "{} --backup-agent --content {} --oid-file {}",
                    HELPER_PROGRAM,
                    segment.content_id,
                    paths.oid_file(segment.content_id)?.display()
                ))
            ))
        })
    }

    pub fn remove_pipes(&self, paths: &FilePaths) -> usize {
        self.run_best_effort("Remove segment pipes", false, |segment| {
            Ok(format!(
                "rm -f {}",
                quote_path(&paths.segment_pipe(segment.content_id)?)
            ))
        })
    }
}
