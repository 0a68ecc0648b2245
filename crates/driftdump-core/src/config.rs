//! Backup options, object filters and plugin configuration

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::catalog::{qualify, Relation};
use crate::errors::{BackupError, Result};

/// Format of backup timestamps, which double as backup identifiers.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    Zstd,
}

impl CompressionType {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            other => Err(BackupError::Validation(format!(
                "unknown compression type {:?}, expected gzip or zstd",
                other
            ))),
        }
    }

    pub fn max_level(self) -> u32 {
        match self {
            CompressionType::Gzip => 9,
            CompressionType::Zstd => 19,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CompressionType::Gzip => ".gz",
            CompressionType::Zstd => ".zst",
        }
    }

    /// Shell command that compresses stdin to stdout.
    pub fn program(self, level: u32) -> String {
        match self {
            CompressionType::Gzip => format!("gzip -c -{}", level),
            CompressionType::Zstd => format!("zstd --compress -{} -c", level),
        }
    }
}

/// Inclusion and exclusion lists. Schemas are bare names, relations `schema.table`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFilter {
    #[serde(default)]
    pub include_schemas: Vec<String>,
    #[serde(default)]
    pub exclude_schemas: Vec<String>,
    #[serde(default)]
    pub include_relations: Vec<String>,
    #[serde(default)]
    pub exclude_relations: Vec<String>,
}

impl ObjectFilter {
    pub fn is_empty(&self) -> bool {
        self.include_schemas.is_empty()
            && self.exclude_schemas.is_empty()
            && self.include_relations.is_empty()
            && self.exclude_relations.is_empty()
    }

    pub fn matches_schema(&self, schema: &str) -> bool {
        if !self.include_schemas.is_empty() && !self.include_schemas.iter().any(|s| s == schema) {
            return false;
        }
        !self.exclude_schemas.iter().any(|s| s == schema)
    }

    pub fn matches_relation(&self, schema: &str, name: &str) -> bool {
        if !self.matches_schema(schema) {
            return false;
        }
        let fqn = qualify(schema, name);
        if !self.include_relations.is_empty() && !self.include_relations.contains(&fqn) {
            return false;
        }
        !self.exclude_relations.contains(&fqn)
    }

    /// Checks the flag combinations that make no sense together.
    pub fn validate(&self) -> Result<()> {
        if !self.include_schemas.is_empty() && !self.exclude_schemas.is_empty() {
            return Err(BackupError::Validation(
                "include-schema and exclude-schema cannot be used together".to_string(),
            ));
        }
        if !self.include_relations.is_empty() && !self.exclude_relations.is_empty() {
            return Err(BackupError::Validation(
                "include-table and exclude-table cannot be used together".to_string(),
            ));
        }
        if !self.include_relations.is_empty() && !self.exclude_schemas.is_empty() {
            return Err(BackupError::Validation(
                "include-table cannot be combined with exclude-schema".to_string(),
            ));
        }
        for relation in self.include_relations.iter().chain(&self.exclude_relations) {
            let qualified = relation
                .split_once('.')
                .is_some_and(|(schema, name)| !schema.is_empty() && !name.is_empty());
            if !qualified {
                return Err(BackupError::Validation(format!(
                    "table {:?} is not schema-qualified",
                    relation
                )));
            }
        }
        Ok(())
    }

    /// Include filters must name objects that exist.
    pub fn check_against_catalog(&self, schemas: &[String], relations: &[Relation]) -> Result<()> {
        if let Some(missing) = self
            .include_schemas
            .iter()
            .find(|s| !schemas.contains(s))
        {
            return Err(BackupError::Validation(format!(
                "schema {} does not exist",
                missing
            )));
        }
        if let Some(missing) = self
            .include_relations
            .iter()
            .find(|fqn| !relations.iter().any(|r| &r.fqn() == *fqn))
        {
            return Err(BackupError::Validation(format!(
                "table {} does not exist",
                missing
            )));
        }
        Ok(())
    }
}

/// Reads a filter file: one entry per line, blank lines and surrounding spaces ignored.
pub fn read_filter_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| {
        BackupError::Validation(format!(
            "cannot read filter file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Checks that `timestamp` is a valid `YYYYMMDDHHMMSS` backup identifier.
pub fn validate_timestamp(timestamp: &str) -> Result<()> {
    if timestamp.len() != 14
        || NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_err()
    {
        return Err(BackupError::Validation(format!(
            "{:?} is not a valid timestamp, expected YYYYMMDDHHMMSS",
            timestamp
        )));
    }
    Ok(())
}

/// Options of one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOptions {
    pub dbname: String,
    /// Root for all backup files; each segment's data directory when unset.
    pub backup_dir: Option<PathBuf>,
    /// Where the per-timestamp lock file lives.
    pub lock_dir: PathBuf,
    /// Fixed timestamp for the run; generated from the clock when unset.
    pub timestamp: Option<String>,
    pub jobs: usize,
    pub filter: ObjectFilter,
    pub metadata_only: bool,
    pub data_only: bool,
    pub incremental: bool,
    pub from_timestamp: Option<String>,
    pub single_data_file: bool,
    pub leaf_partition_data: bool,
    pub with_stats: bool,
    pub no_compression: bool,
    pub compression_level: Option<u32>,
    pub compression_type: CompressionType,
    pub plugin_config: Option<PathBuf>,
    /// Give up on a held lock after this long; wait forever when unset.
    pub lock_wait_timeout: Option<Duration>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            dbname: String::new(),
            backup_dir: None,
            lock_dir: std::env::temp_dir(),
            timestamp: None,
            jobs: 1,
            filter: ObjectFilter::default(),
            metadata_only: false,
            data_only: false,
            incremental: false,
            from_timestamp: None,
            single_data_file: false,
            leaf_partition_data: false,
            with_stats: false,
            no_compression: false,
            compression_level: None,
            compression_type: CompressionType::Gzip,
            plugin_config: None,
            lock_wait_timeout: None,
        }
    }
}

impl BackupOptions {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BackupError::Validation(msg.to_string()));

        if self.dbname.is_empty() {
            return invalid("a database name is required");
        }
        if self.jobs == 0 {
            return invalid("jobs must be at least 1");
        }
        if self.metadata_only && self.data_only {
            return invalid("metadata-only and data-only cannot be used together");
        }
        if self.incremental {
            if self.metadata_only || self.data_only {
                return invalid("incremental cannot be combined with metadata-only or data-only");
            }
            if !self.leaf_partition_data {
                return invalid("incremental requires leaf-partition-data");
            }
        }
        if let Some(from) = &self.from_timestamp {
            if !self.incremental {
                return invalid("from-timestamp requires incremental");
            }
            validate_timestamp(from)?;
        }
        if let Some(timestamp) = &self.timestamp {
            validate_timestamp(timestamp)?;
        }
        if self.single_data_file {
            if self.jobs > 1 {
                return invalid("single-data-file requires jobs to be 1");
            }
            if self.metadata_only {
                return invalid("single-data-file cannot be combined with metadata-only");
            }
        }
        if let Some(level) = self.compression_level {
            if self.no_compression {
                return invalid("no-compression cannot be combined with compression-level");
            }
            let max = self.compression_type.max_level();
            if level < 1 || level > max {
                return Err(BackupError::Validation(format!(
                    "compression-level must be between 1 and {} for {:?}",
                    max, self.compression_type
                )));
            }
        }
        self.filter.validate()
    }

    /// Compression applied to table data, if any.
    pub fn compression(&self) -> Option<(CompressionType, u32)> {
        if self.no_compression {
            None
        } else {
            Some((self.compression_type, self.compression_level.unwrap_or(1)))
        }
    }
}

/// Storage plugin configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub executablepath: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            BackupError::Plugin(format!(
                "cannot read plugin config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: PluginConfig = serde_yaml::from_str(&content)?;
        if config.executablepath.as_os_str().is_empty() {
            return Err(BackupError::Plugin(
                "plugin config is missing executablepath".to_string(),
            ));
        }
        Ok(config)
    }
}
