//! File layout of a backup
//!
//! Every artifact path is derived from the backup root, the segment prefix and
//! the timestamp alone, so a later run can find an earlier backup's files from
//! its timestamp.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::catalog::{Segment, COORDINATOR_CONTENT_ID};
use crate::errors::{BackupError, Result};

const FILE_PREFIX: &str = "driftdump";
const DEFAULT_SEGMENT_PREFIX: &str = "seg";

/// Replaced by each segment's content id when the server runs `COPY ... ON SEGMENT`.
pub const SEGMENT_ID_PLACEHOLDER: &str = "<SEGID>";
/// Replaced by each segment's data directory when the server runs `COPY ... ON SEGMENT`.
pub const SEGMENT_DATA_DIR_PLACEHOLDER: &str = "<SEG_DATA_DIR>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    timestamp: String,
    backup_root: Option<PathBuf>,
    segment_prefix: String,
    data_dirs: BTreeMap<i32, PathBuf>,
}

impl FilePaths {
    pub fn new(timestamp: &str, backup_root: Option<&Path>, segments: &[Segment]) -> Result<Self> {
        let coordinator = segments
            .iter()
            .find(|s| s.is_coordinator())
            .ok_or_else(|| BackupError::Validation("cluster has no coordinator segment".into()))?;

        Ok(Self {
            timestamp: timestamp.to_string(),
            backup_root: backup_root.map(Path::to_path_buf),
            segment_prefix: segment_prefix(&coordinator.data_dir),
            data_dirs: segments
                .iter()
                .map(|s| (s.content_id, s.data_dir.clone()))
                .collect(),
        })
    }

    /// Same layout, another timestamp. Used to locate a reference backup.
    pub fn for_timestamp(&self, timestamp: &str) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            ..self.clone()
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn segment_prefix(&self) -> &str {
        &self.segment_prefix
    }

    fn root_for(&self, content_id: i32) -> Result<PathBuf> {
        match &self.backup_root {
            Some(root) => Ok(root.join(format!("{}{}", self.segment_prefix, content_id))),
            None => self
                .data_dirs
                .get(&content_id)
                .cloned()
                .ok_or_else(|| BackupError::Internal(format!("unknown segment {}", content_id))),
        }
    }

    fn dated(&self, root: PathBuf) -> PathBuf {
        let date = self.timestamp.get(..8).unwrap_or(&self.timestamp);
        root.join("backups").join(date).join(&self.timestamp)
    }

    /// `<root>/backups/<YYYYMMDD>/<timestamp>` for one segment.
    pub fn segment_dir(&self, content_id: i32) -> Result<PathBuf> {
        Ok(self.dated(self.root_for(content_id)?))
    }

    /// Segment directory with the server-side placeholders left in.
    pub fn segment_dir_template(&self) -> PathBuf {
        let root = match &self.backup_root {
            Some(root) => root.join(format!("{}{}", self.segment_prefix, SEGMENT_ID_PLACEHOLDER)),
            None => PathBuf::from(SEGMENT_DATA_DIR_PLACEHOLDER),
        };
        self.dated(root)
    }

    pub fn table_data_file_template(&self, oid: u32) -> PathBuf {
        self.segment_dir_template().join(format!(
            "{}_{}_{}_{}",
            FILE_PREFIX, SEGMENT_ID_PLACEHOLDER, self.timestamp, oid
        ))
    }

    pub fn segment_pipe_template(&self) -> PathBuf {
        self.segment_dir_template().join(format!(
            "{}_{}_{}_pipe",
            FILE_PREFIX, SEGMENT_ID_PLACEHOLDER, self.timestamp
        ))
    }

    pub fn coordinator_dir(&self) -> Result<PathBuf> {
        self.segment_dir(COORDINATOR_CONTENT_ID)
    }

    fn coordinator_file(&self, suffix: &str) -> Result<PathBuf> {
        Ok(self
            .coordinator_dir()?
            .join(format!("{}_{}_{}", FILE_PREFIX, self.timestamp, suffix)))
    }

    pub fn metadata_file(&self) -> Result<PathBuf> {
        self.coordinator_file("metadata.sql")
    }

    pub fn toc_file(&self) -> Result<PathBuf> {
        self.coordinator_file("toc.yaml")
    }

    pub fn config_file(&self) -> Result<PathBuf> {
        self.coordinator_file("config.yaml")
    }

    pub fn report_file(&self) -> Result<PathBuf> {
        self.coordinator_file("report")
    }

    pub fn statistics_file(&self) -> Result<PathBuf> {
        self.coordinator_file("statistics.sql")
    }

    /// The history file lives above the dated directories so every run shares it.
    pub fn history_file(&self) -> Result<PathBuf> {
        Ok(self
            .root_for(COORDINATOR_CONTENT_ID)?
            .join(format!("{}_history.yaml", FILE_PREFIX)))
    }

    /// Data file of one table on one segment, without compression extension.
    pub fn table_data_file(&self, content_id: i32, oid: u32) -> Result<PathBuf> {
        Ok(self.segment_dir(content_id)?.join(format!(
            "{}_{}_{}_{}",
            FILE_PREFIX, content_id, self.timestamp, oid
        )))
    }

    /// Single data file holding every table of one segment.
    pub fn segment_data_file(&self, content_id: i32) -> Result<PathBuf> {
        Ok(self
            .segment_dir(content_id)?
            .join(format!("{}_{}_{}", FILE_PREFIX, content_id, self.timestamp)))
    }

    pub fn segment_pipe(&self, content_id: i32) -> Result<PathBuf> {
        Ok(self
            .segment_dir(content_id)?
            .join(format!("{}_{}_{}_pipe", FILE_PREFIX, content_id, self.timestamp)))
    }

    pub fn oid_file(&self, content_id: i32) -> Result<PathBuf> {
        Ok(self
            .segment_dir(content_id)?
            .join(format!("{}_{}_{}_oids", FILE_PREFIX, content_id, self.timestamp)))
    }

    pub fn helper_error_file(&self, content_id: i32) -> Result<PathBuf> {
        Ok(self
            .segment_dir(content_id)?
            .join(format!("{}_{}_{}_error", FILE_PREFIX, content_id, self.timestamp)))
    }
}

/// Lock file guarding one timestamp.
pub fn lock_file(lock_dir: &Path, timestamp: &str) -> PathBuf {
    lock_dir.join(format!("{}_{}.lck", FILE_PREFIX, timestamp))
}

/// Segment prefix from the coordinator's data directory, e.g. `/data/dseg-1` gives `dseg`.
fn segment_prefix(coordinator_dir: &Path) -> String {
    coordinator_dir
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(&COORDINATOR_CONTENT_ID.to_string()))
        .filter(|prefix| !prefix.is_empty())
        .unwrap_or(DEFAULT_SEGMENT_PREFIX)
        .to_string()
}
