//! Incremental change detection and the restore-plan chain
//!
//! An incremental run copies only tables whose data may have changed since its
//! reference backup. The restore plan records, per backup in the chain, which
//! tables have their newest data in that backup's directory.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::Relation;
use crate::toc::TableOfContents;

/// Tables whose newest data lives in the backup taken at `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePlanEntry {
    pub timestamp: String,
    pub table_fqns: Vec<String>,
}

/// Keeps the candidates whose data must be captured again.
///
/// A table is kept when it has no fingerprint in the current run (heap tables
/// cannot be fingerprinted cheaply), when the reference backup has no
/// fingerprint for it (created since), or when the modification count or the
/// last DDL timestamp moved. Candidate order is preserved.
pub fn filter_changed_tables(
    reference: &TableOfContents,
    current: &TableOfContents,
    candidates: &[Relation],
) -> Vec<Relation> {
    let changed: Vec<Relation> = candidates
        .iter()
        .filter(|table| {
            let fqn = table.fqn();
            match (current.ao_entry(&fqn), reference.ao_entry(&fqn)) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(now), Some(before)) => {
                    now.modification_count != before.modification_count
                        || now.last_ddl_timestamp != before.last_ddl_timestamp
                }
            }
        })
        .cloned()
        .collect();

    info!(
        "{} of {} table(s) changed since the reference backup",
        changed.len(),
        candidates.len()
    );
    changed
}

/// Folds this run into the prior chain and returns the replacement plan.
///
/// Older entries lose every table re-captured now and every table that no
/// longer exists; the new entry is appended even when it captures nothing.
pub fn build_restore_plan(
    timestamp: &str,
    changed_tables: &[Relation],
    prior_plan: Vec<RestorePlanEntry>,
    all_tables: &[Relation],
) -> Vec<RestorePlanEntry> {
    let changed: Vec<String> = changed_tables.iter().map(Relation::fqn).collect();
    let changed_set: HashSet<&str> = changed.iter().map(String::as_str).collect();
    let all: HashSet<String> = all_tables.iter().map(Relation::fqn).collect();

    let mut plan: Vec<RestorePlanEntry> = prior_plan
        .into_iter()
        .map(|mut entry| {
            let before = entry.table_fqns.len();
            entry
                .table_fqns
                .retain(|fqn| !changed_set.contains(fqn.as_str()) && all.contains(fqn));
            debug!(
                "Restore plan entry {} keeps {} of {} table(s)",
                entry.timestamp,
                entry.table_fqns.len(),
                before
            );
            entry
        })
        .collect();

    plan.push(RestorePlanEntry {
        timestamp: timestamp.to_string(),
        table_fqns: changed,
    });
    plan
}

/// Plan of a full backup: one entry owning every table.
pub fn full_restore_plan(timestamp: &str, tables: &[Relation]) -> Vec<RestorePlanEntry> {
    build_restore_plan(timestamp, tables, Vec::new(), tables)
}

/// Timestamp of the newest entry that still claims `fqn`.
pub fn owning_backup<'a>(plan: &'a [RestorePlanEntry], fqn: &str) -> Option<&'a str> {
    plan.iter()
        .rev()
        .find(|entry| entry.table_fqns.iter().any(|t| t == fqn))
        .map(|entry| entry.timestamp.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PartitionLevel, StorageKind};
    use crate::toc::AoEntry;

    fn table(name: &str, storage: StorageKind) -> Relation {
        Relation {
            oid: 0,
            schema: "public".into(),
            name: name.into(),
            storage,
            partition_level: PartitionLevel::None,
            columns: vec![],
            dependencies: vec![],
        }
    }

    fn ao(modification_count: i64, ts: &str) -> AoEntry {
        AoEntry {
            modification_count,
            last_ddl_timestamp: ts.to_string(),
        }
    }

    fn toc_with(entries: &[(&str, AoEntry)]) -> TableOfContents {
        let mut toc = TableOfContents::new();
        for (name, entry) in entries {
            toc.incremental_metadata
                .ao
                .insert(format!("public.{}", name), entry.clone());
        }
        toc
    }

    fn entry(timestamp: &str, tables: &[&str]) -> RestorePlanEntry {
        RestorePlanEntry {
            timestamp: timestamp.to_string(),
            table_fqns: tables.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_filter_changed_tables() {
        let reference = toc_with(&[
            ("ao_modcount", ao(0, "00000")),
            ("ao_ddl", ao(0, "00000")),
            ("ao_same", ao(0, "00000")),
        ]);
        let current = toc_with(&[
            ("ao_modcount", ao(2, "00000")),
            ("ao_ddl", ao(0, "00001")),
            ("ao_same", ao(0, "00000")),
        ]);
        let candidates = vec![
            table("heap", StorageKind::Heap),
            table("ao_modcount", StorageKind::AppendOptimized),
            table("ao_ddl", StorageKind::AppendOptimized),
            table("ao_same", StorageKind::AppendOptimized),
        ];

        let changed: Vec<String> = filter_changed_tables(&reference, &current, &candidates)
            .iter()
            .map(Relation::fqn)
            .collect();
        assert_eq!(changed, ["public.heap", "public.ao_modcount", "public.ao_ddl"]);
    }

    #[test]
    fn test_new_ao_table_is_captured() {
        let reference = toc_with(&[]);
        let current = toc_with(&[("ao_new", ao(0, "00000"))]);
        let candidates = vec![table("ao_new", StorageKind::AppendOptimizedColumn)];
        assert_eq!(filter_changed_tables(&reference, &current, &candidates).len(), 1);
    }

    #[test]
    fn test_untouched_tables_stay_in_their_entry() {
        let all = vec![
            table("t1", StorageKind::Heap),
            table("t2", StorageKind::AppendOptimized),
        ];
        let prior = vec![entry("20240101000000", &["public.t1", "public.t2"])];
        let plan = build_restore_plan("20240102000000", &all[..1], prior, &all);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], entry("20240101000000", &["public.t2"]));
        assert_eq!(plan[1], entry("20240102000000", &["public.t1"]));
        assert_eq!(owning_backup(&plan, "public.t2"), Some("20240101000000"));
        assert_eq!(owning_backup(&plan, "public.t1"), Some("20240102000000"));
    }

    #[test]
    fn test_recaptured_table_removed_from_every_older_entry() {
        let all = vec![table("t1", StorageKind::Heap), table("t2", StorageKind::Heap)];
        let prior = vec![
            entry("20240101000000", &["public.t1", "public.t2"]),
            entry("20240102000000", &["public.t1"]),
        ];
        let plan = build_restore_plan("20240103000000", &all[..1], prior, &all);

        let claims = plan
            .iter()
            .filter(|e| e.table_fqns.contains(&"public.t1".to_string()))
            .count();
        assert_eq!(claims, 1);
        assert_eq!(plan[2].table_fqns, ["public.t1"]);
        assert_eq!(plan[0].table_fqns, ["public.t2"]);
        assert!(plan[1].table_fqns.is_empty());
    }

    #[test]
    fn test_dropped_table_removed_from_plan() {
        let all = vec![table("t1", StorageKind::AppendOptimized)];
        let prior = vec![entry("20240101000000", &["public.t1", "public.dropped"])];
        let plan = build_restore_plan("20240102000000", &[], prior, &all);

        assert_eq!(plan[0].table_fqns, ["public.t1"]);
        assert_eq!(owning_backup(&plan, "public.dropped"), None);
    }

    #[test]
    fn test_no_changes_still_appends_entry() {
        let all = vec![table("t1", StorageKind::AppendOptimized)];
        let prior = vec![entry("20240101000000", &["public.t1"])];
        let plan = build_restore_plan("20240102000000", &[], prior, &all);

        assert_eq!(plan.len(), 2);
        assert!(plan[1].table_fqns.is_empty());
        assert_eq!(plan[1].timestamp, "20240102000000");
    }

    #[test]
    fn test_full_plan_has_one_entry() {
        let all = vec![table("t1", StorageKind::Heap), table("t2", StorageKind::Heap)];
        let plan = full_restore_plan("20240101000000", &all);
        assert_eq!(plan, vec![entry("20240101000000", &["public.t1", "public.t2"])]);
    }
}
