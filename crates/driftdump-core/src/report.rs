//! Human-readable report of a backup run

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::BackupOptions;
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    InProgress,
    Success,
    Failure,
}

impl ReportStatus {
    fn as_str(self) -> &'static str {
        match self {
            ReportStatus::InProgress => "In Progress",
            ReportStatus::Success => "Success",
            ReportStatus::Failure => "Failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: String,
    pub tool_version: String,
    pub database: String,
    pub server_version: Option<String>,
    pub options: Vec<(String, String)>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: ReportStatus,
    pub error: Option<String>,
    pub object_counts: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

impl Report {
    pub fn new(timestamp: &str, options: &BackupOptions, start_time: &str) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            database: options.dbname.clone(),
            server_version: None,
            options: describe_options(options),
            start_time: start_time.to_string(),
            end_time: None,
            status: ReportStatus::InProgress,
            error: None,
            object_counts: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn count(&mut self, object_type: &str, n: usize) {
        *self.object_counts.entry(object_type.to_string()).or_insert(0) += n;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn finish(&mut self, end_time: &str, error: Option<String>) {
        self.end_time = Some(end_time.to_string());
        self.status = if error.is_some() {
            ReportStatus::Failure
        } else {
            ReportStatus::Success
        };
        self.error = error;
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: &str| {
            let _ = writeln!(out, "{:<24}{}", format!("{}:", key), value);
        };

        line("timestamp key", &self.timestamp);
        line("driftdump version", &self.tool_version);
        line("database name", &self.database);
        line(
            "server version",
            self.server_version.as_deref().unwrap_or("unknown"),
        );
        for (key, value) in &self.options {
            line(key, value);
        }
        line("start time", &self.start_time);
        line("end time", self.end_time.as_deref().unwrap_or(""));
        line("backup status", self.status.as_str());
        if let Some(error) = &self.error {
            line("backup error", error);
        }

        out.push('\n');
        let _ = writeln!(out, "{:<24}{}", "object type", "count");
        for (object_type, count) in &self.object_counts {
            let _ = writeln!(out, "{:<24}{}", object_type, count);
        }

        if !self.warnings.is_empty() {
            out.push('\n');
            out.push_str("warnings:\n");
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}", warning);
            }
        }
        out
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }
}

fn describe_options(options: &BackupOptions) -> Vec<(String, String)> {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" }.to_string();
    let section = if options.metadata_only {
        "metadata only"
    } else if options.data_only {
        "data only"
    } else {
        "all"
    };
    let compression = match options.compression() {
        Some((kind, level)) => format!("{:?} level {}", kind, level).to_lowercase(),
        None => "none".to_string(),
    };
    let filter = if options.filter.is_empty() {
        "none".to_string()
    } else {
        let f = &options.filter;
        let mut parts = Vec::new();
        if !f.include_schemas.is_empty() {
            parts.push(format!("include schemas {}", f.include_schemas.join(",")));
        }
        if !f.exclude_schemas.is_empty() {
            parts.push(format!("exclude schemas {}", f.exclude_schemas.join(",")));
        }
        if !f.include_relations.is_empty() {
            parts.push(format!("include tables {}", f.include_relations.join(",")));
        }
        if !f.exclude_relations.is_empty() {
            parts.push(format!("exclude tables {}", f.exclude_relations.join(",")));
        }
        parts.join("; ")
    };

    vec![
        ("backup section".into(), section.into()),
        ("object filtering".into(), filter),
        ("includes statistics".into(), yes_no(options.with_stats)),
        ("data file format".into(), if options.single_data_file {
            "single data file per segment".into()
        } else {
            "multiple data files".into()
        }),
        ("compression".into(), compression),
        ("incremental".into(), yes_no(options.incremental)),
        ("leaf partition data".into(), yes_no(options.leaf_partition_data)),
        ("jobs".into(), options.jobs.to_string()),
    ]
}
