pub mod errors;
pub mod catalog;
pub mod connection;
pub mod snapshot;
pub mod sorter;
pub mod toc;
pub mod incremental;
pub mod config;
pub mod history;
pub mod paths;
pub mod lock;
pub mod remote;
pub mod report;
pub mod plugin;
pub mod data;
pub mod backup;
pub mod cli;

pub use backup::{Backup, Collaborators, RunContext, RunOutcome};
pub use config::BackupOptions;
pub use errors::{BackupError, ExitStatus, Result};
pub use incremental::RestorePlanEntry;
pub use sorter::{topological_sort, Sortable};
pub use toc::TableOfContents;
