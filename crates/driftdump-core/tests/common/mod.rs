//! In-memory cluster shared by the integration tests.
//!
//! Rows carry the commit sequence number that created them. A transaction sees
//! the rows committed up to its snapshot, which is taken by its first query or
//! imported with `SET TRANSACTION SNAPSHOT`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use driftdump_core::catalog::{
    Catalog, CatalogObject, DdlFormatter, Function, ObjectType, PartitionLevel, Relation, Segment,
    StorageKind, TypeDef, View,
};
use driftdump_core::config::{BackupOptions, PluginConfig};
use driftdump_core::connection::{Connector, DbConnection, QueryCanceller};
use driftdump_core::history::BackupConfig;
use driftdump_core::paths::FilePaths;
use driftdump_core::plugin::StoragePlugin;
use driftdump_core::remote::{RemoteCommand, RemoteExecutor, RemoteOutput};
use driftdump_core::toc::{AoEntry, TableOfContents};
use driftdump_core::{BackupError, Collaborators, Result};

pub const SUPPORTED_VERSION: &str = "PostgreSQL 12.12 (DriftDB Database 7.1.0 build commit:f00d)";
pub const LEGACY_VERSION: &str = "PostgreSQL 9.4.26 (DriftDB Database 6.20.3 build commit:beef)";

type CopyHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ClusterState {
    pub version: Mutex<String>,
    pub segments: Vec<Segment>,
    pub schemas: Mutex<Vec<String>>,
    pub relations: Mutex<Vec<Relation>>,
    pub views: Mutex<Vec<View>>,
    pub functions: Mutex<Vec<Function>>,
    pub types: Mutex<Vec<TypeDef>>,
    pub ao: Mutex<BTreeMap<String, AoEntry>>,
    rows: Mutex<Vec<(u64, String)>>,
    commit_seq: AtomicU64,
    snapshots: Mutex<HashMap<String, u64>>,
    pub statements: Mutex<Vec<String>>,
    pub failing_copy: Mutex<Option<String>>,
    pub copy_hook: Mutex<Option<CopyHook>>,
    /// COPY waits until its connection is cancelled.
    pub block_copies: AtomicBool,
    pub connects: AtomicUsize,
    pub open_connections: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeCluster(pub Arc<ClusterState>);

fn relation(
    schema: &str,
    name: &str,
    oid: u32,
    storage: StorageKind,
    dependencies: &[&str],
) -> Relation {
    Relation {
        oid,
        schema: schema.into(),
        name: name.into(),
        storage,
        partition_level: PartitionLevel::None,
        columns: vec!["id".into(), "payload".into()],
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
    }
}

impl FakeCluster {
    /// Coordinator plus two primaries, three tables, a view, a type and a function.
    pub fn new(root: &Path) -> Self {
        let segments = vec![
            Segment {
                content_id: -1,
                hostname: "cdw".into(),
                data_dir: root.join("coordinator").join("dseg-1"),
            },
            Segment {
                content_id: 0,
                hostname: "sdw1".into(),
                data_dir: root.join("primary").join("dseg0"),
            },
            Segment {
                content_id: 1,
                hostname: "sdw2".into(),
                data_dir: root.join("primary").join("dseg1"),
            },
        ];

        let state = ClusterState {
            version: Mutex::new(SUPPORTED_VERSION.to_string()),
            segments,
            schemas: Mutex::new(vec!["public".into(), "sales".into()]),
            relations: Mutex::new(vec![
                relation("public", "customers", 16384, StorageKind::Heap, &["public.money_t"]),
                relation("sales", "orders", 16390, StorageKind::AppendOptimized, &["public.customers"]),
                relation("sales", "items", 16395, StorageKind::AppendOptimizedColumn, &[]),
            ]),
            views: Mutex::new(vec![View {
                oid: 16400,
                schema: "public".into(),
                name: "order_summary".into(),
                is_materialized: false,
                dependencies: vec!["sales.orders".into(), "public.total(integer)".into()],
            }]),
            functions: Mutex::new(vec![Function {
                oid: 16410,
                schema: "public".into(),
                name: "total".into(),
                arguments: "integer".into(),
                dependencies: vec!["public.money_t".into()],
            }]),
            types: Mutex::new(vec![TypeDef {
                oid: 16420,
                schema: "public".into(),
                name: "money_t".into(),
                dependencies: vec![],
            }]),
            ao: Mutex::new(BTreeMap::new()),
            rows: Mutex::new(Vec::new()),
            commit_seq: AtomicU64::new(0),
            snapshots: Mutex::new(HashMap::new()),
            statements: Mutex::new(Vec::new()),
            failing_copy: Mutex::new(None),
            copy_hook: Mutex::new(None),
            block_copies: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            open_connections: AtomicUsize::new(0),
        };

        let cluster = FakeCluster(Arc::new(state));
        cluster.touch_ao("sales.orders");
        cluster.touch_ao("sales.items");
        cluster.insert("public.customers", 3);
        cluster.insert("sales.orders", 5);
        cluster.insert("sales.items", 7);
        cluster
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.0.segments.clone()
    }

    pub fn set_version(&self, version: &str) {
        *self.0.version.lock() = version.to_string();
    }

    /// Commits `n` rows into `fqn` in one transaction.
    pub fn insert(&self, fqn: &str, n: usize) {
        let seq = self.0.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut rows = self.0.rows.lock();
        for _ in 0..n {
            rows.push((seq, fqn.to_string()));
        }
    }

    /// Records a modification of an append-optimized table.
    pub fn touch_ao(&self, fqn: &str) {
        let mut ao = self.0.ao.lock();
        let entry = ao.entry(fqn.to_string()).or_insert(AoEntry {
            modification_count: 0,
            last_ddl_timestamp: "2024-03-01 00:00:00".into(),
        });
        entry.modification_count += 1;
    }

    pub fn add_relation(&self, schema: &str, name: &str, oid: u32, storage: StorageKind) {
        self.0
            .relations
            .lock()
            .push(relation(schema, name, oid, storage, &[]));
    }

    pub fn add_view(&self, schema: &str, name: &str, dependencies: &[&str]) {
        let mut views = self.0.views.lock();
        let oid = 17000 + views.len() as u32;
        views.push(View {
            oid,
            schema: schema.into(),
            name: name.into(),
            is_materialized: false,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        });
    }

    pub fn fail_copy_of(&self, fqn: &str) {
        *self.0.failing_copy.lock() = Some(fqn.to_string());
    }

    pub fn on_copy(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.0.copy_hook.lock() = Some(Arc::new(hook));
    }

    pub fn copies(&self) -> Vec<String> {
        self.0
            .statements
            .lock()
            .iter()
            .filter(|s| s.contains(": COPY "))
            .cloned()
            .collect()
    }

    pub fn statements_matching(&self, needle: &str) -> Vec<String> {
        self.0
            .statements
            .lock()
            .iter()
            .filter(|s| s.contains(needle))
            .cloned()
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.0.open_connections.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.0.connects.load(Ordering::SeqCst)
    }

    fn visible_rows(&self, fqn: &str, snapshot: u64) -> u64 {
        self.0
            .rows
            .lock()
            .iter()
            .filter(|(seq, table)| *seq <= snapshot && table == fqn)
            .count() as u64
    }
}

struct FakeCanceller(Arc<AtomicBool>);

impl QueryCanceller for FakeCanceller {
    fn cancel(&self) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConnection {
    cluster: FakeCluster,
    application_name: String,
    in_transaction: bool,
    snapshot: Option<u64>,
    cancelled: Arc<AtomicBool>,
    closed: bool,
}

impl FakeConnection {
    fn snapshot(&mut self) -> u64 {
        let current = self.cluster.0.commit_seq.load(Ordering::SeqCst);
        if !self.in_transaction {
            return current;
        }
        *self.snapshot.get_or_insert(current)
    }

    fn copy(&mut self, sql: &str) -> Result<u64> {
        let fqn = sql
            .trim_start_matches("COPY ")
            .split('(')
            .next()
            .unwrap_or_default()
            .to_string();
        let snapshot = self.snapshot();

        let hook = self.cluster.0.copy_hook.lock().clone();
        if let Some(hook) = hook {
            hook(&fqn);
        }

        if self.cluster.0.failing_copy.lock().as_deref() == Some(fqn.as_str()) {
            return Err(BackupError::Query(format!("could not write data of {}", fqn)));
        }

        if self.cluster.0.block_copies.load(Ordering::SeqCst) {
            let started = Instant::now();
            while !self.cancelled.load(Ordering::SeqCst) {
                if started.elapsed() > Duration::from_secs(10) {
                    return Err(BackupError::Query("copy never cancelled".into()));
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Err(BackupError::Query("canceling statement due to user request".into()));
        }

        Ok(self.cluster.visible_rows(&fqn, snapshot))
    }
}

impl DbConnection for FakeConnection {
    fn execute(&mut self, sql: &str) -> Result<u64> {
        if self.closed {
            return Err(BackupError::Query("connection closed".into()));
        }
        self.cluster
            .0
            .statements
            .lock()
            .push(format!("{}: {}", self.application_name, sql));

        if sql.starts_with("BEGIN") {
            self.in_transaction = true;
            self.snapshot = None;
        } else if sql == "COMMIT" || sql == "ROLLBACK" {
            self.in_transaction = false;
            self.snapshot = None;
        } else if let Some(rest) = sql.strip_prefix("SET TRANSACTION SNAPSHOT '") {
            if !self.in_transaction || self.snapshot.is_some() {
                return Err(BackupError::Query(
                    "SET TRANSACTION SNAPSHOT must be called before any query".into(),
                ));
            }
            let id = rest.trim_end_matches('\'');
            let seq = self
                .cluster
                .0
                .snapshots
                .lock()
                .get(id)
                .copied()
                .ok_or_else(|| BackupError::Query(format!("invalid snapshot identifier {}", id)))?;
            self.snapshot = Some(seq);
        } else if sql.starts_with("COPY ") {
            return self.copy(sql);
        } else if sql.starts_with("LOCK TABLE") {
            self.snapshot();
        }
        Ok(0)
    }

    fn query_scalar(&mut self, sql: &str) -> Result<String> {
        self.cluster
            .0
            .statements
            .lock()
            .push(format!("{}: {}", self.application_name, sql));
        match sql {
            "SELECT version()" => Ok(self.cluster.0.version.lock().clone()),
            "SELECT pg_export_snapshot()" => {
                if !self.in_transaction {
                    return Err(BackupError::Query("no transaction to export".into()));
                }
                let seq = self.snapshot();
                let mut snapshots = self.cluster.0.snapshots.lock();
                let id = format!("{:08X}-{}", seq, snapshots.len() + 1);
                snapshots.insert(id.clone(), seq);
                Ok(id)
            }
            other => Err(BackupError::Query(format!("unexpected query {}", other))),
        }
    }

    fn canceller(&self) -> Arc<dyn QueryCanceller> {
        Arc::new(FakeCanceller(self.cancelled.clone()))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.cluster.0.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Connector for FakeCluster {
    fn connect(&self, _database: &str, application_name: &str) -> Result<Box<dyn DbConnection>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        self.0.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            cluster: self.clone(),
            application_name: application_name.to_string(),
            in_transaction: false,
            snapshot: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: false,
        }))
    }
}

impl Catalog for FakeCluster {
    fn segments(&self, _conn: &mut dyn DbConnection) -> Result<Vec<Segment>> {
        Ok(self.0.segments.clone())
    }

    fn schemas(&self, _conn: &mut dyn DbConnection) -> Result<Vec<String>> {
        Ok(self.0.schemas.lock().clone())
    }

    fn relations(&self, _conn: &mut dyn DbConnection) -> Result<Vec<Relation>> {
        Ok(self.0.relations.lock().clone())
    }

    fn views(&self, _conn: &mut dyn DbConnection) -> Result<Vec<View>> {
        Ok(self.0.views.lock().clone())
    }

    fn functions(&self, _conn: &mut dyn DbConnection) -> Result<Vec<Function>> {
        Ok(self.0.functions.lock().clone())
    }

    fn types(&self, _conn: &mut dyn DbConnection) -> Result<Vec<TypeDef>> {
        Ok(self.0.types.lock().clone())
    }

    fn global_objects(&self, _conn: &mut dyn DbConnection) -> Result<Vec<CatalogObject>> {
        Ok(vec![
            CatalogObject::new(ObjectType::SessionGuc, "", "session", 0),
            CatalogObject::new(ObjectType::Role, "", "etl_user", 10),
        ])
    }

    fn postdata_objects(
        &self,
        _conn: &mut dyn DbConnection,
        relations: &[Relation],
    ) -> Result<Vec<CatalogObject>> {
        Ok(relations
            .iter()
            .filter(|r| r.has_local_data())
            .map(|r| {
                CatalogObject::new(ObjectType::Index, &r.schema, &format!("{}_pkey", r.name), 0)
                    .with_reference(&r.fqn())
            })
            .collect())
    }

    fn ao_fingerprints(
        &self,
        _conn: &mut dyn DbConnection,
        relations: &[Relation],
    ) -> Result<BTreeMap<String, AoEntry>> {
        let ao = self.0.ao.lock();
        Ok(relations
            .iter()
            .filter_map(|r| ao.get(&r.fqn()).map(|entry| (r.fqn(), entry.clone())))
            .collect())
    }

    fn attribute_statistics(
        &self,
        _conn: &mut dyn DbConnection,
        relations: &[Relation],
    ) -> Result<Vec<CatalogObject>> {
        Ok(relations
            .iter()
            .map(|r| {
                CatalogObject::new(ObjectType::Statistics, &r.schema, &r.name, r.oid)
                    .with_reference(&r.fqn())
            })
            .collect())
    }
}

/// Renders `CREATE <TYPE> schema.name;`. Statistics of tables named `broken_*`
/// cannot be rendered.
pub struct FakeFormatter;

impl DdlFormatter for FakeFormatter {
    fn statement(&self, object: &CatalogObject) -> Result<String> {
        if object.object_type == ObjectType::Statistics && object.name.starts_with("broken") {
            return Err(BackupError::Query(format!(
                "no statistics for {}.{}",
                object.schema, object.name
            )));
        }
        if object.schema.is_empty() {
            Ok(format!("CREATE {} {};", object.object_type, object.name))
        } else {
            Ok(format!(
                "CREATE {} {}.{};",
                object.object_type, object.schema, object.name
            ))
        }
    }
}

/// Creates directories for `mkdir -p` and accepts everything else.
#[derive(Default)]
pub struct LocalExecutor {
    pub commands: Mutex<Vec<RemoteCommand>>,
    pub failing_host: Mutex<Option<String>>,
}

impl RemoteExecutor for LocalExecutor {
    fn execute(&self, commands: &[RemoteCommand]) -> Vec<RemoteOutput> {
        let failing = self.failing_host.lock().clone();
        commands
            .iter()
            .map(|command| {
                self.commands.lock().push(command.clone());
                let mut error = None;
                if failing.as_deref() == Some(command.hostname.as_str()) {
                    error = Some("ssh: connect to host: Connection refused".to_string());
                } else if let Some(path) = command
                    .command
                    .strip_prefix("mkdir -p '")
                    .and_then(|rest| rest.strip_suffix('\''))
                {
                    if let Err(e) = fs::create_dir_all(path) {
                        error = Some(e.to_string());
                    }
                }
                RemoteOutput {
                    content_id: command.content_id,
                    hostname: command.hostname.clone(),
                    stdout: String::new(),
                    error,
                }
            })
            .collect()
    }
}

#[derive(Default)]
pub struct RecordingPlugin {
    pub uploaded: Mutex<Vec<PathBuf>>,
}

impl StoragePlugin for RecordingPlugin {
    fn check_reachable(&self, _config: &PluginConfig, _config_path: &Path) -> Result<()> {
        Ok(())
    }

    fn upload(&self, _config: &PluginConfig, _config_path: &Path, file: &Path) -> Result<()> {
        self.uploaded.lock().push(file.to_path_buf());
        Ok(())
    }
}

pub struct TestEnv {
    pub root: PathBuf,
    pub cluster: FakeCluster,
    pub remote: Arc<LocalExecutor>,
    pub plugin: Arc<RecordingPlugin>,
}

impl TestEnv {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cluster: FakeCluster::new(root),
            remote: Arc::new(LocalExecutor::default()),
            plugin: Arc::new(RecordingPlugin::default()),
        }
    }

    pub fn backup_root(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn options(&self, timestamp: &str) -> BackupOptions {
        BackupOptions {
            dbname: "sales".into(),
            backup_dir: Some(self.backup_root()),
            lock_dir: self.root.join("locks"),
            timestamp: Some(timestamp.to_string()),
            jobs: 2,
            leaf_partition_data: true,
            lock_wait_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let cluster = Arc::new(self.cluster.clone());
        Collaborators::new(
            cluster.clone(),
            cluster,
            Arc::new(FakeFormatter),
            self.remote.clone(),
        )
        .with_plugin(self.plugin.clone())
    }

    pub fn paths(&self, timestamp: &str) -> FilePaths {
        FilePaths::new(timestamp, Some(&self.backup_root()), &self.cluster.segments())
            .expect("cluster has a coordinator")
    }

    pub fn toc(&self, timestamp: &str) -> TableOfContents {
        TableOfContents::load_from_file(self.paths(timestamp).toc_file().unwrap()).unwrap()
    }

    pub fn config(&self, timestamp: &str) -> BackupConfig {
        BackupConfig::load_from_file(self.paths(timestamp).config_file().unwrap()).unwrap()
    }

    pub fn report(&self, timestamp: &str) -> Option<String> {
        fs::read_to_string(self.paths(timestamp).report_file().unwrap()).ok()
    }
}
