use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected among: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Reference backup error: {0}")]
    ReferenceBackup(String),

    #[error("{action} failed on {} host(s): {}", .hosts.len(), .hosts.join(", "))]
    RemoteExecution { action: String, hosts: Vec<String> },

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Coarse grouping of errors used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Consistency,
    Remote,
    BestEffort,
    Cancelled,
    Other,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Validation(_) => ErrorKind::Validation,
            BackupError::DependencyCycle(_)
            | BackupError::Snapshot(_)
            | BackupError::ReferenceBackup(_) => ErrorKind::Consistency,
            BackupError::RemoteExecution { .. } => ErrorKind::Remote,
            BackupError::Plugin(_) => ErrorKind::BestEffort,
            BackupError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    /// True when continuing would break a correctness guarantee of the backup.
    pub fn is_consistency_critical(&self) -> bool {
        self.kind() == ErrorKind::Consistency
    }
}

impl From<serde_yaml::Error> for BackupError {
    fn from(e: serde_yaml::Error) -> Self {
        BackupError::Serialization(e.to_string())
    }
}

/// Process exit status of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Fatal,
    Unexpected,
    Cancelled,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Fatal => 1,
            ExitStatus::Unexpected => 2,
            ExitStatus::Cancelled => 3,
        }
    }
}
