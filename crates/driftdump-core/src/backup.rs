//! Backup lifecycle
//!
//! A run moves through Init, Setup, the global, predata, data, postdata and
//! statistics phases, then Teardown. Cleanup always runs last and may also be
//! started from a signal handler while the phases are still running.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use chrono::Local;
use parking_lot::{const_mutex, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{quote_ident, Catalog, CatalogObject, DdlFormatter, ObjectType, Relation};
use crate::config::{BackupOptions, TIMESTAMP_FORMAT};
use crate::connection::{ConnectionPool, Connector, DbConnection};
use crate::data::{self, DataFormat};
use crate::errors::{BackupError, ErrorKind, ExitStatus, Result};
use crate::history::{BackupConfig, BackupHistory, BackupStatus};
use crate::incremental::{
    build_restore_plan, filter_changed_tables, full_restore_plan, owning_backup,
};
use crate::lock::BackupLock;
use crate::paths::{self, FilePaths};
use crate::plugin::{ConfiguredPlugin, ExecutablePlugin, StoragePlugin};
use crate::remote::{RemoteCluster, RemoteExecutor};
use crate::report::Report;
use crate::snapshot::{self, ServerVersion, SnapshotCapability};
use crate::sorter::{topological_sort, Sortable};
use crate::toc::{MetadataFile, Section, TableOfContents};

/// Tables named per `LOCK TABLE` statement.
const LOCK_BATCH_SIZE: usize = 100;

const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything the engine reaches outside itself.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub catalog: Arc<dyn Catalog>,
    pub formatter: Arc<dyn DdlFormatter>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub plugin: Arc<dyn StoragePlugin>,
}

impl Collaborators {
    pub fn new(
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn Catalog>,
        formatter: Arc<dyn DdlFormatter>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            connector,
            catalog,
            formatter,
            remote,
            plugin: Arc::new(ExecutablePlugin),
        }
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn StoragePlugin>) -> Self {
        self.plugin = plugin;
        self
    }
}

/// Resources cleanup must release, registered as Setup acquires them.
#[derive(Default)]
struct Resources {
    lock: Option<BackupLock>,
    pool: Option<Arc<ConnectionPool>>,
    helpers: Option<(RemoteCluster, FilePaths)>,
}

/// State shared between the orchestrating thread and the signal handler.
pub struct RunContext {
    options: BackupOptions,
    timestamp: String,
    application_name: String,
    start_time: String,
    collaborators: Collaborators,
    cancelled: AtomicBool,
    report: Mutex<Report>,
    resources: Mutex<Resources>,
    /// Held for the whole cleanup, so a second caller waits for the first to finish.
    cleanup_done: Mutex<bool>,
}

impl RunContext {
    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation; running phases finish their current step.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn report(&self) -> Report {
        self.report.lock().clone()
    }

    pub fn cleanup_finished(&self) -> bool {
        *self.cleanup_done.lock()
    }

    /// Entry point for the signal listener.
    pub fn handle_cancel_signal(&self) {
        warn!("Received cancellation request for backup {}", self.timestamp);
        self.cancel();
        self.cleanup();
    }

    /// Releases everything the run acquired. Safe to call any number of times
    /// from any thread.
    pub fn cleanup(&self) {
        let mut done = self.cleanup_done.lock();
        if *done {
            debug!("Cleanup of backup {} already ran", self.timestamp);
            return;
        }
        info!("Cleaning up backup {}", self.timestamp);

        let mut resources = self.resources.lock();

        if let Some((cluster, paths)) = resources.helpers.take() {
            cluster.kill_helpers(&paths);
            if let Err(e) = data::cancel_orphaned_copies(
                self.collaborators.connector.as_ref(),
                &self.options.dbname,
                &self.application_name,
            ) {
                warn!("Could not cancel orphaned copy sessions: {}", e);
            }
            cluster.remove_pipes(&paths);
        }

        if let Some(pool) = resources.pool.take() {
            let failures = pool.shutdown();
            let stats = pool.stats();
            info!(
                "Closed {} of {} connection(s) after {} statement(s)",
                stats.closed, stats.total_connections, stats.statements_executed
            );
            if failures > 0 {
                warn!("{} error(s) while closing connections", failures);
            }
        }

        if let Some(lock) = resources.lock.take() {
            if let Err(e) = lock.release() {
                warn!("Could not release backup lock {}: {}", lock.path().display(), e);
            }
        }

        *done = true;
        info!("Cleanup of backup {} complete", self.timestamp);
    }

    fn register_lock(&self, lock: BackupLock) -> Result<()> {
        let done = self.cleanup_done.lock();
        if *done {
            lock.release()?;
            return Err(BackupError::Cancelled);
        }
        self.resources.lock().lock = Some(lock);
        Ok(())
    }

    fn register_pool(&self, pool: Arc<ConnectionPool>) -> Result<()> {
        let done = self.cleanup_done.lock();
        if *done {
            pool.shutdown();
            return Err(BackupError::Cancelled);
        }
        self.resources.lock().pool = Some(pool);
        Ok(())
    }

    fn register_helpers(&self, cluster: RemoteCluster, paths: FilePaths) -> Result<()> {
        let done = self.cleanup_done.lock();
        if *done {
            return Err(BackupError::Cancelled);
        }
        self.resources.lock().helpers = Some((cluster, paths));
        Ok(())
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub timestamp: String,
    pub status: ExitStatus,
    pub error: Option<String>,
}

/// Per-run state owned by the orchestrating thread.
#[derive(Default)]
struct RunState {
    pool: Option<Arc<ConnectionPool>>,
    paths: Option<FilePaths>,
    cluster: Option<RemoteCluster>,
    plugin: Option<ConfiguredPlugin>,
    config: Option<BackupConfig>,
    schemas: Vec<String>,
    tables: Vec<Relation>,
    reference: Option<(BackupConfig, TableOfContents)>,
    toc: TableOfContents,
    metadata: Option<MetadataFile>,
    setup_complete: bool,
}

fn used_before_setup(what: &str) -> BackupError {
    BackupError::Internal(format!("{} used before setup", what))
}

impl RunState {
    fn pool(&self) -> Result<&Arc<ConnectionPool>> {
        self.pool.as_ref().ok_or_else(|| used_before_setup("connection pool"))
    }

    fn paths(&self) -> Result<&FilePaths> {
        self.paths.as_ref().ok_or_else(|| used_before_setup("file paths"))
    }

    fn cluster(&self) -> Result<&RemoteCluster> {
        self.cluster.as_ref().ok_or_else(|| used_before_setup("remote cluster"))
    }

    fn config_mut(&mut self) -> Result<&mut BackupConfig> {
        self.config.as_mut().ok_or_else(|| used_before_setup("backup config"))
    }

    fn take_metadata(&mut self) -> Result<MetadataFile> {
        self.metadata.take().ok_or_else(|| used_before_setup("metadata file"))
    }
}

/// One backup run.
pub struct Backup {
    ctx: Arc<RunContext>,
}

impl Backup {
    /// Validates the options and prepares the run context.
    pub fn new(options: BackupOptions, collaborators: Collaborators) -> Result<Self> {
        options.validate()?;
        install_panic_hook();

        let now = Local::now();
        let timestamp = options
            .timestamp
            .clone()
            .unwrap_or_else(|| now.format(TIMESTAMP_FORMAT).to_string());
        let start_time = now.format(DISPLAY_TIME_FORMAT).to_string();
        let report = Report::new(&timestamp, &options, &start_time);

        Ok(Self {
            ctx: Arc::new(RunContext {
                application_name: format!("driftdump_{}", timestamp),
                timestamp,
                start_time,
                options,
                collaborators,
                cancelled: AtomicBool::new(false),
                report: Mutex::new(report),
                resources: Mutex::new(Resources::default()),
                cleanup_done: Mutex::new(false),
            }),
        })
    }

    pub fn context(&self) -> Arc<RunContext> {
        self.ctx.clone()
    }

    pub fn timestamp(&self) -> &str {
        &self.ctx.timestamp
    }

    /// Runs every phase, then teardown and cleanup, whatever happens in between.
    pub fn run(&self) -> RunOutcome {
        info!(
            "Starting backup {} of database {}",
            self.ctx.timestamp, self.ctx.options.dbname
        );
        let mut state = RunState::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&mut state)));
        let outcome = self.teardown(&mut state, result);
        self.ctx.cleanup();
        outcome
    }

    fn execute(&self, state: &mut RunState) -> Result<()> {
        let options = &self.ctx.options;

        self.setup(state)?;

        if !options.data_only {
            self.gate("global")?;
            self.backup_global(state)?;
            self.gate("predata")?;
            self.backup_predata(state)?;
        }

        if !options.metadata_only {
            self.gate("data")?;
            self.backup_data(state)?;
        }

        if !options.data_only {
            self.gate("postdata")?;
            self.backup_postdata(state)?;
            state.take_metadata()?.finish()?;
        }

        if options.with_stats {
            self.gate("statistics")?;
            self.backup_statistics(state)?;
        }

        state.toc.save_to_file(state.paths()?.toc_file()?)?;
        Ok(())
    }

    /// Phases start only while the run has not been cancelled.
    fn gate(&self, phase: &str) -> Result<()> {
        if self.ctx.is_cancelled() {
            warn!("{} phase incomplete: backup was cancelled", phase);
            return Err(BackupError::Cancelled);
        }
        info!("Starting {} phase", phase);
        Ok(())
    }

    /// Runs `f` against the catalog on the leader connection.
    fn query<T>(
        &self,
        state: &RunState,
        f: impl FnOnce(&dyn Catalog, &mut dyn DbConnection) -> Result<T>,
    ) -> Result<T> {
        let catalog = self.ctx.collaborators.catalog.as_ref();
        state.pool()?.leader().with_connection(|conn| f(catalog, conn))
    }

    fn write_object(
        &self,
        metadata: &mut MetadataFile,
        toc: &mut TableOfContents,
        section: Section,
        object: &CatalogObject,
    ) -> Result<()> {
        let statement = self.ctx.collaborators.formatter.statement(object)?;
        metadata.write_object(toc, section, object, &statement)?;
        self.ctx.report.lock().count(object.object_type.as_str(), 1);
        Ok(())
    }

    #[instrument(skip_all, fields(timestamp = %self.ctx.timestamp))]
    fn setup(&self, state: &mut RunState) -> Result<()> {
        let ctx = &self.ctx;
        let options = &ctx.options;
        let collaborators = &ctx.collaborators;

        // Only one backup may use this timestamp
        let lock = BackupLock::acquire(
            &paths::lock_file(&options.lock_dir, &ctx.timestamp),
            options.lock_wait_timeout,
        )?;
        ctx.register_lock(lock)?;

        if let Some(config_path) = &options.plugin_config {
            state.plugin = Some(ConfiguredPlugin::setup(
                collaborators.plugin.clone(),
                config_path,
            )?);
        }

        let pool = Arc::new(ConnectionPool::open(
            collaborators.connector.as_ref(),
            &options.dbname,
            &ctx.application_name,
            options.jobs,
        )?);
        ctx.register_pool(pool.clone())?;
        state.pool = Some(pool.clone());

        let version = ServerVersion::parse(&pool.leader().query_scalar("SELECT version()")?)?;
        ctx.report.lock().server_version = Some(version.to_string());

        let capability = snapshot::synchronize(&pool, version)?;
        if capability == SnapshotCapability::Unsupported {
            ctx.report.lock().add_warning(format!(
                "Server {} cannot synchronize snapshots; worker connections may have \
                 observed commits made after the backup started",
                version
            ));
        }

        let segments = self.query(state, |catalog, conn| catalog.segments(conn))?;
        let schemas = self.query(state, |catalog, conn| catalog.schemas(conn))?;
        let relations = self.query(state, |catalog, conn| catalog.relations(conn))?;

        options.filter.check_against_catalog(&schemas, &relations)?;
        state.schemas = schemas
            .into_iter()
            .filter(|schema| options.filter.matches_schema(schema))
            .collect();
        state.tables = relations
            .into_iter()
            .filter(|r| options.filter.matches_relation(&r.schema, &r.name))
            .collect();
        info!("Backup set has {} table(s)", state.tables.len());

        lock_tables(&pool, &state.tables)?;

        let paths = FilePaths::new(&ctx.timestamp, options.backup_dir.as_deref(), &segments)?;

        let mut config = BackupConfig::new(options, &ctx.timestamp, &ctx.start_time);
        config.database_version = version.to_string();
        config.segment_count = segments.iter().filter(|s| !s.is_coordinator()).count();
        config.plugin_executable = state.plugin.as_ref().map(|p| p.executable().to_path_buf());
        config.snapshot_synchronized = capability.snapshot_id().is_some();

        if options.incremental {
            state.reference = Some(self.load_reference(&paths, &config)?);
        }

        let cluster = RemoteCluster::new(collaborators.remote.clone(), segments);
        cluster.create_backup_dirs(&paths)?;

        state.config = Some(config);
        state.paths = Some(paths);
        state.cluster = Some(cluster);
        state.setup_complete = true;
        Ok(())
    }

    /// Finds the backup an incremental run builds on and loads its config and TOC.
    fn load_reference(
        &self,
        paths: &FilePaths,
        current: &BackupConfig,
    ) -> Result<(BackupConfig, TableOfContents)> {
        let reference = match &self.ctx.options.from_timestamp {
            Some(timestamp) => {
                let path = paths.for_timestamp(timestamp).config_file()?;
                let config = BackupConfig::load_from_file(&path).map_err(|e| {
                    BackupError::ReferenceBackup(format!(
                        "cannot read config of backup {} at {}: {}",
                        timestamp,
                        path.display(),
                        e
                    ))
                })?;
                if !config.can_be_reference_for(current) {
                    return Err(BackupError::ReferenceBackup(format!(
                        "backup {} cannot be the base of this incremental backup",
                        timestamp
                    )));
                }
                config
            }
            None => {
                let history = BackupHistory::load(paths.history_file()?).map_err(|e| {
                    BackupError::ReferenceBackup(format!("cannot read backup history: {}", e))
                })?;
                history.find_latest_compatible(current).cloned().ok_or_else(|| {
                    BackupError::ReferenceBackup(
                        "no earlier compatible backup to base an incremental backup on".to_string(),
                    )
                })?
            }
        };

        let toc_path = paths.for_timestamp(&reference.timestamp).toc_file()?;
        let toc = TableOfContents::load_from_file(&toc_path).map_err(|e| {
            BackupError::ReferenceBackup(format!(
                "cannot read table of contents {}: {}",
                toc_path.display(),
                e
            ))
        })?;

        info!("Using backup {} as incremental reference", reference.timestamp);
        Ok((reference, toc))
    }

    #[instrument(skip_all)]
    fn backup_global(&self, state: &mut RunState) -> Result<()> {
        let mut metadata = MetadataFile::create(state.paths()?.metadata_file()?)?;
        let objects = self.query(state, |catalog, conn| catalog.global_objects(conn))?;
        for object in &objects {
            self.write_object(&mut metadata, &mut state.toc, Section::Global, object)?;
        }
        debug!("Wrote {} global object(s)", objects.len());
        state.metadata = Some(metadata);
        Ok(())
    }

    #[instrument(skip_all)]
    fn backup_predata(&self, state: &mut RunState) -> Result<()> {
        let filter = &self.ctx.options.filter;
        let mut metadata = state.take_metadata()?;

        for schema in &state.schemas {
            let object = CatalogObject::new(ObjectType::Schema, schema, schema, 0);
            self.write_object(&mut metadata, &mut state.toc, Section::Predata, &object)?;
        }

        let types = self.query(state, |catalog, conn| catalog.types(conn))?;
        let functions = self.query(state, |catalog, conn| catalog.functions(conn))?;
        let views = self.query(state, |catalog, conn| catalog.views(conn))?;

        let mut objects: Vec<Sortable> = Vec::new();
        objects.extend(
            types
                .into_iter()
                .filter(|t| filter.matches_schema(&t.schema))
                .map(Sortable::Type),
        );
        objects.extend(
            functions
                .into_iter()
                .filter(|f| filter.matches_schema(&f.schema))
                .map(Sortable::Function),
        );
        objects.extend(state.tables.iter().cloned().map(Sortable::Relation));
        objects.extend(
            views
                .into_iter()
                .filter(|v| filter.matches_relation(&v.schema, &v.name))
                .map(Sortable::View),
        );

        for object in topological_sort(objects)? {
            self.write_object(
                &mut metadata,
                &mut state.toc,
                Section::Predata,
                &object.catalog_object(),
            )?;
        }

        state.metadata = Some(metadata);
        Ok(())
    }

    #[instrument(skip_all)]
    fn backup_data(&self, state: &mut RunState) -> Result<()> {
        let options = &self.ctx.options;
        let timestamp = &self.ctx.timestamp;
        let pool = state.pool()?.clone();
        let paths = state.paths()?.clone();
        let all_tables = data::data_tables(&state.tables, options.leaf_partition_data);

        // Fingerprints let the next incremental run skip unchanged tables
        let ao_tables: Vec<Relation> = all_tables
            .iter()
            .filter(|t| t.is_append_optimized())
            .cloned()
            .collect();
        if !ao_tables.is_empty() {
            let fingerprints =
                self.query(state, |catalog, conn| catalog.ao_fingerprints(conn, &ao_tables))?;
            state.toc.incremental_metadata.ao = fingerprints;
        }

        let tables = match &state.reference {
            Some((reference, reference_toc)) => {
                let changed = filter_changed_tables(reference_toc, &state.toc, &all_tables);
                for table in all_tables.iter().filter(|t| !changed.contains(t)) {
                    let fqn = table.fqn();
                    debug!(
                        "Skipping unchanged {}, data is in backup {}",
                        fqn,
                        owning_backup(&reference.restore_plan, &fqn)
                            .unwrap_or(reference.timestamp.as_str())
                    );
                }
                changed
            }
            None => all_tables.clone(),
        };

        let single_file = options.single_data_file && !tables.is_empty();
        let format = if options.single_data_file {
            DataFormat::SingleFile
        } else {
            DataFormat::PerTable(options.compression())
        };

        if single_file {
            let cluster = state.cluster()?.clone();
            self.ctx.register_helpers(cluster.clone(), paths.clone())?;
            let oids: Vec<u32> = tables.iter().map(|t| t.oid).collect();
            cluster.create_pipes(&paths)?;
            cluster.write_oid_files(&paths, &oids)?;
            cluster.start_helpers(&paths, options.compression())?;
        }

        let entries = data::copy_tables(&pool, &tables, &paths, format, &self.ctx.cancelled)?;

        if single_file {
            state.cluster()?.check_helper_errors(&paths)?;
        }

        self.ctx.report.lock().count("TABLE DATA", entries.len());
        state.toc.data_entries = entries;

        let plan = match &state.reference {
            Some((reference, _)) => build_restore_plan(
                timestamp,
                &tables,
                reference.restore_plan.clone(),
                &all_tables,
            ),
            None => full_restore_plan(timestamp, &all_tables),
        };
        let config = state.config_mut()?;
        config.restore_plan = plan;
        config.save_to_file(paths.config_file()?)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn backup_postdata(&self, state: &mut RunState) -> Result<()> {
        let tables = state.tables.clone();
        let objects = self.query(state, |catalog, conn| catalog.postdata_objects(conn, &tables))?;
        let mut metadata = state.take_metadata()?;
        for object in &objects {
            self.write_object(&mut metadata, &mut state.toc, Section::Postdata, object)?;
        }
        state.metadata = Some(metadata);
        Ok(())
    }

    #[instrument(skip_all)]
    fn backup_statistics(&self, state: &mut RunState) -> Result<()> {
        let tables = state.tables.clone();
        let statistics =
            self.query(state, |catalog, conn| catalog.attribute_statistics(conn, &tables))?;
        let mut file = MetadataFile::create(state.paths()?.statistics_file()?)?;

        for object in &statistics {
            // A missing statistic is not worth failing the backup over
            match self.ctx.collaborators.formatter.statement(object) {
                Ok(statement) => {
                    file.write_object(&mut state.toc, Section::Statistics, object, &statement)?;
                    self.ctx.report.lock().count(object.object_type.as_str(), 1);
                }
                Err(e) => {
                    warn!("Skipping statistics for {}.{}: {}", object.schema, object.name, e);
                    self.ctx.report.lock().add_warning(format!(
                        "Statistics for {}.{} skipped: {}",
                        object.schema, object.name, e
                    ));
                }
            }
        }
        file.finish()
    }

    /// Classifies the outcome and writes the config, history and report.
    fn teardown(
        &self,
        state: &mut RunState,
        result: std::thread::Result<Result<()>>,
    ) -> RunOutcome {
        let ctx = &self.ctx;
        let end_time = Local::now().format(DISPLAY_TIME_FORMAT).to_string();

        let (mut status, mut error) = match result {
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    "Unexpected error in backup {}: {}\n{}",
                    ctx.timestamp,
                    message,
                    take_panic_backtrace()
                );
                (ExitStatus::Unexpected, Some(message))
            }
            Ok(_) if ctx.is_cancelled() => (ExitStatus::Cancelled, None),
            Ok(Err(e)) => match e.kind() {
                ErrorKind::Cancelled => (ExitStatus::Cancelled, None),
                _ if e.is_consistency_critical() => {
                    error!(
                        "Backup {} aborted, its artifacts would not be consistent: {}",
                        ctx.timestamp, e
                    );
                    (ExitStatus::Fatal, Some(e.to_string()))
                }
                _ => {
                    error!("Backup {} failed: {}", ctx.timestamp, e);
                    (ExitStatus::Fatal, Some(e.to_string()))
                }
            },
            Ok(Ok(())) => (ExitStatus::Success, None),
        };

        if let Some(metadata) = state.metadata.take() {
            if let Err(e) = metadata.finish() {
                warn!("Could not flush metadata of backup {}: {}", ctx.timestamp, e);
            }
        }

        if status == ExitStatus::Cancelled {
            warn!("Backup {} was cancelled; no report written", ctx.timestamp);
            // The signal handler may still be cleaning up; wait for it
            ctx.cleanup();
            return RunOutcome {
                timestamp: ctx.timestamp.clone(),
                status,
                error,
            };
        }

        if state.setup_complete {
            if let Err(e) = self.finalize(state, error.as_deref(), &end_time) {
                error!("Could not record backup {}: {}", ctx.timestamp, e);
                if status == ExitStatus::Success {
                    status = ExitStatus::Fatal;
                    error = Some(e.to_string());
                }
            }
        }

        if status == ExitStatus::Success {
            info!("Backup {} completed successfully", ctx.timestamp);
        }
        RunOutcome {
            timestamp: ctx.timestamp.clone(),
            status,
            error,
        }
    }

    fn finalize(&self, state: &mut RunState, error: Option<&str>, end_time: &str) -> Result<()> {
        let paths = state.paths()?.clone();
        let succeeded = error.is_none();

        let config = state.config_mut()?;
        config.status = if succeeded {
            BackupStatus::Success
        } else {
            BackupStatus::Failure
        };
        config.end_time = Some(end_time.to_string());
        let config = config.clone();
        config.save_to_file(paths.config_file()?)?;
        BackupHistory::load(paths.history_file()?)?.record(config)?;

        let mut warnings = Vec::new();
        if succeeded {
            if let Some(plugin) = &state.plugin {
                warnings = plugin.upload_artifacts(&[
                    paths.metadata_file()?,
                    paths.toc_file()?,
                    paths.statistics_file()?,
                    paths.config_file()?,
                ]);
            }
        }

        let report_path = paths.report_file()?;
        {
            let mut report = self.ctx.report.lock();
            for warning in warnings {
                report.add_warning(warning);
            }
            report.finish(end_time, error.map(String::from));
            report.write_to_file(&report_path)?;
        }

        if succeeded {
            if let Some(plugin) = &state.plugin {
                // The report is already written, so these can only be logged
                let late_warnings = plugin.upload_artifacts(&[report_path]);
                debug!("{} report upload warning(s)", late_warnings.len());
            }
        }
        Ok(())
    }
}

/// Takes ACCESS SHARE locks so concurrent DDL cannot change the captured tables.
fn lock_tables(pool: &ConnectionPool, tables: &[Relation]) -> Result<()> {
    for batch in tables.chunks(LOCK_BATCH_SIZE) {
        let names: Vec<String> = batch
            .iter()
            .map(|t| format!("{}.{}", quote_ident(&t.schema), quote_ident(&t.name)))
            .collect();
        pool.leader().execute(&format!(
            "LOCK TABLE {} IN ACCESS SHARE MODE",
            names.join(", ")
        ))?;
    }
    debug!("Locked {} table(s)", tables.len());
    Ok(())
}

/// Panics inside worker threads resurface on the orchestrating thread, so the
/// backtrace is kept process-wide.
static LAST_PANIC_BACKTRACE: Mutex<Option<String>> = const_mutex(None);

static PANIC_HOOK: Once = Once::new();

/// Records a backtrace for each panic so teardown can log where it happened.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            *LAST_PANIC_BACKTRACE.lock() = Some(backtrace);
            previous(info);
        }));
    });
}

fn take_panic_backtrace() -> String {
    LAST_PANIC_BACKTRACE
        .lock()
        .take()
        .unwrap_or_else(|| "backtrace unavailable".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
