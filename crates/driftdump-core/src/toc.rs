//! Table of contents for a backup
//!
//! Indexes every statement written to the metadata and statistics files by byte
//! range, lists the table data captured by the run, and carries the
//! append-optimized fingerprints used by later incremental runs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogObject;
use crate::errors::{BackupError, Result};

/// Change fingerprint of one append-optimized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoEntry {
    pub modification_count: i64,
    pub last_ddl_timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    Global,
    Predata,
    Postdata,
    Statistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub schema: String,
    pub name: String,
    pub object_type: String,
    #[serde(default)]
    pub reference_object: String,
    pub start_byte: u64,
    pub end_byte: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub schema: String,
    pub name: String,
    pub oid: u32,
    pub attribute_string: String,
    pub rows_copied: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalMetadata {
    #[serde(default)]
    pub ao: BTreeMap<String, AoEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOfContents {
    #[serde(default)]
    pub global_entries: Vec<MetadataEntry>,
    #[serde(default)]
    pub predata_entries: Vec<MetadataEntry>,
    #[serde(default)]
    pub postdata_entries: Vec<MetadataEntry>,
    #[serde(default)]
    pub statistics_entries: Vec<MetadataEntry>,
    #[serde(default)]
    pub data_entries: Vec<DataEntry>,
    #[serde(default)]
    pub incremental_metadata: IncrementalMetadata,
}

impl TableOfContents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_metadata_entry(
        &mut self,
        section: Section,
        object: &CatalogObject,
        start_byte: u64,
        end_byte: u64,
    ) {
        let entry = MetadataEntry {
            schema: object.schema.clone(),
            name: object.name.clone(),
            object_type: object.object_type.as_str().to_string(),
            reference_object: object.reference_object.clone(),
            start_byte,
            end_byte,
        };
        self.entries_mut(section).push(entry);
    }

    pub fn entries(&self, section: Section) -> &[MetadataEntry] {
        match section {
            Section::Global => &self.global_entries,
            Section::Predata => &self.predata_entries,
            Section::Postdata => &self.postdata_entries,
            Section::Statistics => &self.statistics_entries,
        }
    }

    fn entries_mut(&mut self, section: Section) -> &mut Vec<MetadataEntry> {
        match section {
            Section::Global => &mut self.global_entries,
            Section::Predata => &mut self.predata_entries,
            Section::Postdata => &mut self.postdata_entries,
            Section::Statistics => &mut self.statistics_entries,
        }
    }

    pub fn ao_entry(&self, fqn: &str) -> Option<&AoEntry> {
        self.incremental_metadata.ao.get(fqn)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Writes the TOC through a temporary file so readers never see a partial one.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temp_path = PathBuf::from(format!("{}.tmp", path.display()));
        fs::write(&temp_path, serde_yaml::to_string(self)?)?;
        fs::rename(temp_path, path)?;
        Ok(())
    }
}

/// Append-only SQL file that reports the byte range of every statement it writes.
pub struct MetadataFile {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
}

impl MetadataFile {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Writes one statement followed by a blank line and returns its byte range.
    pub fn write_statement(&mut self, statement: &str) -> Result<(u64, u64)> {
        let statement = statement.trim_end();
        if statement.is_empty() {
            return Err(BackupError::Internal(
                "refusing to write an empty statement".to_string(),
            ));
        }
        let start = self.position;
        let text = format!("\n{}\n", statement);
        self.writer.write_all(text.as_bytes())?;
        self.position += text.len() as u64;
        Ok((start, self.position))
    }

    /// Writes the statement and records it in `toc` under `section`.
    pub fn write_object(
        &mut self,
        toc: &mut TableOfContents,
        section: Section,
        object: &CatalogObject,
        statement: &str,
    ) -> Result<()> {
        let (start, end) = self.write_statement(statement)?;
        toc.add_metadata_entry(section, object, start, end);
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
