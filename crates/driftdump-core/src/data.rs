//! Table data copy
//!
//! Each table is copied with one `COPY ... ON SEGMENT` statement, so every
//! segment writes its own slice of the table locally. Tables are spread over the
//! pool's connections, one worker per connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{quote_ident, PartitionLevel, Relation};
use crate::config::CompressionType;
use crate::connection::{ConnectionPool, ConnectionSlot, Connector};
use crate::errors::{BackupError, Result};
use crate::paths::FilePaths;
use crate::toc::DataEntry;

/// How table data lands on the segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// One file per table per segment, optionally compressed.
    PerTable(Option<(CompressionType, u32)>),
    /// Every table streamed through the segment's pipe into one helper-managed file.
    SingleFile,
}

/// Relations whose rows are copied in this run.
///
/// With `leaf_partition_data` each leaf partition is copied on its own and the
/// partition parents are skipped; otherwise the root carries all partition rows.
/// External and foreign tables hold no data in the cluster.
pub fn data_tables(relations: &[Relation], leaf_partition_data: bool) -> Vec<Relation> {
    relations
        .iter()
        .filter(|r| r.has_local_data())
        .filter(|r| match r.partition_level {
            PartitionLevel::None => true,
            PartitionLevel::Root => !leaf_partition_data,
            PartitionLevel::Intermediate => false,
            PartitionLevel::Leaf => leaf_partition_data,
        })
        .cloned()
        .collect()
}

/// `(a,b,c)` column list of the copy, or empty for a table without columns.
pub fn attribute_string(table: &Relation) -> String {
    if table.columns.is_empty() {
        return String::new();
    }
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
    format!("({})", columns.join(","))
}

pub fn copy_statement(table: &Relation, paths: &FilePaths, format: DataFormat) -> String {
    let program = match format {
        DataFormat::PerTable(None) => format!(
            "cat - > {}",
            paths.table_data_file_template(table.oid).display()
        ),
        DataFormat::PerTable(Some((kind, level))) => format!(
            "{} > {}{}",
            kind.program(level),
            paths.table_data_file_template(table.oid).display(),
            kind.extension()
        ),
        DataFormat::SingleFile => format!("cat - > {}", paths.segment_pipe_template().display()),
    };
    format!(
        "COPY {}.{}{} TO PROGRAM '{}' WITH CSV DELIMITER ',' ON SEGMENT IGNORE EXTERNAL PARTITIONS;",
        quote_ident(&table.schema),
        quote_ident(&table.name),
        attribute_string(table),
        program.replace('\'', "''")
    )
}

fn copy_table(
    slot: &ConnectionSlot,
    table: &Relation,
    paths: &FilePaths,
    format: DataFormat,
) -> Result<DataEntry> {
    let statement = copy_statement(table, paths, format);
    debug!("Connection {} copying {}", slot.id, table.fqn());
    let rows = slot
        .execute(&statement)
        .map_err(|e| BackupError::Query(format!("copy of {} failed: {}", table.fqn(), e)))?;
    Ok(DataEntry {
        schema: table.schema.clone(),
        name: table.name.clone(),
        oid: table.oid,
        attribute_string: attribute_string(table),
        rows_copied: rows,
    })
}

/// Copies `tables` on all pool connections in parallel.
///
/// Workers stop taking new tables once `cancelled` is set or any copy fails;
/// copies already running are left to finish. Entries come back in the order of
/// `tables`.
#[instrument(skip_all, fields(tables = tables.len(), workers = pool.size()))]
pub fn copy_tables(
    pool: &ConnectionPool,
    tables: &[Relation],
    paths: &FilePaths,
    format: DataFormat,
    cancelled: &AtomicBool,
) -> Result<Vec<DataEntry>> {
    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(pool.size())
        .thread_name(|i| format!("driftdump-data-{}", i))
        .build()
        .map_err(|e| BackupError::Internal(format!("Failed to create worker pool: {}", e)))?;

    let queue: Mutex<VecDeque<(usize, &Relation)>> = Mutex::new(tables.iter().enumerate().collect());
    let copied: Mutex<Vec<(usize, DataEntry)>> = Mutex::new(Vec::with_capacity(tables.len()));
    let failure: Mutex<Option<BackupError>> = Mutex::new(None);
    let abort = AtomicBool::new(false);

    thread_pool.scope(|scope| {
        for slot in pool.slots() {
            let (queue, copied, failure, abort) = (&queue, &copied, &failure, &abort);
            scope.spawn(move |_| loop {
                if cancelled.load(Ordering::SeqCst) || abort.load(Ordering::SeqCst) {
                    break;
                }
                let Some((index, table)) = queue.lock().pop_front() else {
                    break;
                };
                match copy_table(slot, table, paths, format) {
                    Ok(entry) => copied.lock().push((index, entry)),
                    Err(e) => {
                        warn!("Connection {}: {}", slot.id, e);
                        abort.store(true, Ordering::SeqCst);
                        let mut first = failure.lock();
                        if first.is_none() {
                            *first = Some(e);
                        }
                        break;
                    }
                }
            });
        }
    });

    if let Some(e) = failure.into_inner() {
        return Err(e);
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(BackupError::Cancelled);
    }

    let mut copied = copied.into_inner();
    copied.sort_by_key(|(index, _)| *index);
    let rows: u64 = copied.iter().map(|(_, e)| e.rows_copied).sum();
    info!("Copied {} table(s), {} row(s)", copied.len(), rows);
    Ok(copied.into_iter().map(|(_, entry)| entry).collect())
}

/// Cancels COPY statements of this run that outlived their connection.
///
/// Uses a fresh connection since the pool's own may be stuck behind the copy.
pub fn cancel_orphaned_copies(
    connector: &dyn Connector,
    database: &str,
    application_name: &str,
) -> Result<u64> {
    let mut conn = connector.connect(database, &format!("{}_cleanup", application_name))?;
    let cancelled = conn.execute(&format!(
        "SELECT pg_cancel_backend(pid) FROM pg_stat_activity \
         WHERE application_name = '{}' AND query LIKE 'COPY %' AND pid <> pg_backend_pid()",
        application_name.replace('\'', "''")
    ));
    let closed = conn.close();
    let cancelled = cancelled?;
    closed?;
    if cancelled > 0 {
        info!("Cancelled {} orphaned copy session(s)", cancelled);
    }
    Ok(cancelled)
}
