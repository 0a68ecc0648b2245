//! Per-run configuration record and the backup history
//!
//! Every backup writes a config file next to its TOC. The history file lists the
//! configs of past runs so an incremental run can find its reference backup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BackupOptions, CompressionType, ObjectFilter};
use crate::errors::Result;
use crate::incremental::RestorePlanEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    InProgress,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub backup_version: String,
    pub timestamp: String,
    pub database_name: String,
    #[serde(default)]
    pub database_version: String,
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub segment_count: usize,
    pub compression_type: Option<CompressionType>,
    pub compression_level: Option<u32>,
    pub data_only: bool,
    pub metadata_only: bool,
    pub incremental: bool,
    pub leaf_partition_data: bool,
    pub single_data_file: bool,
    pub with_statistics: bool,
    #[serde(default)]
    pub filter: ObjectFilter,
    pub plugin_executable: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_synchronized: bool,
    #[serde(default)]
    pub restore_plan: Vec<RestorePlanEntry>,
    pub status: BackupStatus,
    pub start_time: String,
    pub end_time: Option<String>,
}

impl BackupConfig {
    pub fn new(options: &BackupOptions, timestamp: &str, start_time: &str) -> Self {
        let compression = options.compression();
        Self {
            backup_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: timestamp.to_string(),
            database_name: options.dbname.clone(),
            database_version: String::new(),
            backup_dir: options.backup_dir.clone(),
            segment_count: 0,
            compression_type: compression.map(|(kind, _)| kind),
            compression_level: compression.map(|(_, level)| level),
            data_only: options.data_only,
            metadata_only: options.metadata_only,
            incremental: options.incremental,
            leaf_partition_data: options.leaf_partition_data,
            single_data_file: options.single_data_file,
            with_statistics: options.with_stats,
            filter: options.filter.clone(),
            plugin_executable: None,
            snapshot_synchronized: false,
            restore_plan: Vec::new(),
            status: BackupStatus::InProgress,
            start_time: start_time.to_string(),
            end_time: None,
        }
    }

    /// Whether `self`, a finished backup, can serve as the reference of `current`.
    pub fn can_be_reference_for(&self, current: &BackupConfig) -> bool {
        self.status == BackupStatus::Success
            && self.timestamp < current.timestamp
            && self.database_name == current.database_name
            && self.backup_dir == current.backup_dir
            && self.leaf_partition_data
            && !self.data_only
            && !self.metadata_only
            && self.filter == current.filter
            && self.compression_type == current.compression_type
            && self.single_data_file == current.single_data_file
            && self.plugin_executable == current.plugin_executable
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Configs of past runs, newest first.
#[derive(Debug, Clone)]
pub struct BackupHistory {
    path: PathBuf,
    entries: Vec<BackupConfig>,
}

impl BackupHistory {
    /// Loads the history at `path`; a missing file is an empty history.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries: Vec<BackupConfig> = if path.exists() {
            serde_yaml::from_str(&fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        debug!("Loaded {} backup(s) from {:?}", entries.len(), path);
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[BackupConfig] {
        &self.entries
    }

    pub fn find(&self, timestamp: &str) -> Option<&BackupConfig> {
        self.entries.iter().find(|e| e.timestamp == timestamp)
    }

    pub fn find_latest_compatible(&self, current: &BackupConfig) -> Option<&BackupConfig> {
        self.entries.iter().find(|e| e.can_be_reference_for(current))
    }

    /// Records `config`, replacing an earlier record of the same timestamp.
    pub fn record(&mut self, config: BackupConfig) -> Result<()> {
        self.entries.retain(|e| e.timestamp != config.timestamp);
        self.entries.push(config);
        self.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_yaml::to_string(&self.entries)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn finished(timestamp: &str, options: &BackupOptions) -> BackupConfig {
        let mut config = BackupConfig::new(options, timestamp, timestamp);
        config.status = BackupStatus::Success;
        config
    }

    fn leaf_options() -> BackupOptions {
        BackupOptions {
            dbname: "sales".into(),
            leaf_partition_data: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_compatible_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("history.yaml");
        let options = leaf_options();

        let mut history = BackupHistory::load(&path).unwrap();
        assert!(history.entries().is_empty());

        history.record(finished("20240101000000", &options)).unwrap();
        history
            .record(finished(
                "20240102000000",
                &BackupOptions { metadata_only: true, ..leaf_options() },
            ))
            .unwrap();
        let mut failed = finished("20240103000000", &options);
        failed.status = BackupStatus::Failure;
        history.record(failed).unwrap();

        let current = BackupConfig::new(
            &BackupOptions { incremental: true, ..leaf_options() },
            "20240104000000",
            "20240104000000",
        );
        let history = BackupHistory::load(&path).unwrap();
        assert_eq!(history.entries().len(), 3);
        assert_eq!(history.entries()[0].timestamp, "20240103000000");
        assert_eq!(
            history.find_latest_compatible(&current).map(|c| c.timestamp.as_str()),
            Some("20240101000000")
        );
    }

    #[test]
    fn test_filters_must_match() {
        let base = finished("20240101000000", &leaf_options());
        let filtered = BackupOptions {
            filter: ObjectFilter {
                include_schemas: vec!["sales".into()],
                ..Default::default()
            },
            ..leaf_options()
        };
        let current = BackupConfig::new(&filtered, "20240102000000", "20240102000000");
        assert!(!base.can_be_reference_for(&current));
    }

    #[test]
    fn test_record_replaces_same_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let mut history = BackupHistory::load(temp_dir.path().join("h.yaml")).unwrap();
        let mut config = finished("20240101000000", &leaf_options());
        config.status = BackupStatus::InProgress;
        history.record(config.clone()).unwrap();
        config.status = BackupStatus::Success;
        history.record(config).unwrap();

        assert_eq!(history.entries().len(), 1);
        assert_eq!(
            history.find("20240101000000").map(|c| c.status),
            Some(BackupStatus::Success)
        );
    }
}
