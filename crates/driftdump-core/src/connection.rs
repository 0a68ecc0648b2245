//! Connection pooling for a backup run
//!
//! Provides a fixed-size pool with:
//! - One physical connection per worker slot
//! - One transaction per slot, opened before any catalog query
//! - A cancellation handle per slot that never waits on the slot's lock
//! - Best-effort cancel, rollback and close on shutdown

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::{BackupError, Result};

/// Statements run on every new connection before it joins the pool.
const SESSION_SETUP: &[&str] = &[
    "SET statement_timeout = 0",
    "SET client_encoding = 'UTF8'",
    "SET standard_conforming_strings = on",
];

/// Sends an out-of-band cancel for whatever the connection is running.
///
/// Returns as soon as the request is sent; the server may still be unwinding the
/// query when this returns.
pub trait QueryCanceller: Send + Sync {
    fn cancel(&self) -> Result<()>;
}

/// One physical database connection.
pub trait DbConnection: Send {
    /// Executes a statement and returns the number of rows it affected.
    fn execute(&mut self, sql: &str) -> Result<u64>;
    /// Runs a query expected to return exactly one text value.
    fn query_scalar(&mut self, sql: &str) -> Result<String>;
    fn canceller(&self) -> Arc<dyn QueryCanceller>;
    fn close(&mut self) -> Result<()>;
}

/// Opens physical connections.
pub trait Connector: Send + Sync {
    fn connect(&self, database: &str, application_name: &str) -> Result<Box<dyn DbConnection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Idle,
    InTransaction,
    Closed,
}

struct SlotInner {
    conn: Box<dyn DbConnection>,
    state: SlotState,
}

/// A pooled connection with its own transaction and cancellation handle.
pub struct ConnectionSlot {
    pub id: usize,
    inner: Mutex<SlotInner>,
    canceller: Arc<dyn QueryCanceller>,
    /// Readable while a query holds `inner`.
    closed: AtomicBool,
    statements_executed: AtomicU64,
}

impl ConnectionSlot {
    fn new(id: usize, conn: Box<dyn DbConnection>) -> Self {
        let canceller = conn.canceller();
        Self {
            id,
            inner: Mutex::new(SlotInner {
                conn,
                state: SlotState::Idle,
            }),
            canceller,
            closed: AtomicBool::new(false),
            statements_executed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    /// Opens a repeatable-read transaction unless one is already open.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SlotState::InTransaction => Ok(()),
            SlotState::Closed => Err(closed_error(self.id)),
            SlotState::Idle => {
                inner.conn.execute("BEGIN ISOLATION LEVEL REPEATABLE READ")?;
                inner.state = SlotState::InTransaction;
                self.statements_executed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    pub fn execute(&self, sql: &str) -> Result<u64> {
        self.with_connection(|conn| conn.execute(sql))
    }

    pub fn query_scalar(&self, sql: &str) -> Result<String> {
        self.with_connection(|conn| conn.query_scalar(sql))
    }

    /// Runs `f` with exclusive access to the underlying connection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn DbConnection) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        if inner.state == SlotState::Closed {
            return Err(closed_error(self.id));
        }
        self.statements_executed.fetch_add(1, Ordering::Relaxed);
        f(inner.conn.as_mut())
    }

    /// Requests cancellation of the running query without taking the slot lock.
    pub fn cancel(&self) -> Result<()> {
        self.canceller.cancel()
    }

    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == SlotState::InTransaction {
            inner.state = SlotState::Idle;
            inner.conn.execute("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == SlotState::Closed {
            return Ok(());
        }
        inner.state = SlotState::Closed;
        self.closed.store(true, Ordering::SeqCst);
        inner.conn.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn statements_executed(&self) -> u64 {
        self.statements_executed.load(Ordering::Relaxed)
    }
}

/// Connects and runs the session setup, closing the connection if setup fails.
fn open_session(
    connector: &dyn Connector,
    database: &str,
    application_name: &str,
) -> Result<Box<dyn DbConnection>> {
    let mut conn = connector.connect(database, application_name)?;
    for statement in SESSION_SETUP {
        if let Err(e) = conn.execute(statement) {
            if let Err(close_err) = conn.close() {
                warn!("Failed to close connection after setup error: {}", close_err);
            }
            return Err(e);
        }
    }
    Ok(conn)
}

fn closed_error(id: usize) -> BackupError {
    BackupError::Query(format!("connection {} is closed", id))
}

/// Fixed-size pool of connections to one database.
pub struct ConnectionPool {
    database: String,
    slots: Vec<ConnectionSlot>,
}

impl ConnectionPool {
    /// Opens `size` connections and prepares their sessions.
    #[instrument(skip(connector))]
    pub fn open(
        connector: &dyn Connector,
        database: &str,
        application_name: &str,
        size: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(BackupError::Validation(
                "connection pool needs at least one connection".to_string(),
            ));
        }

        let mut slots: Vec<ConnectionSlot> = Vec::with_capacity(size);
        for id in 0..size {
            match open_session(connector, database, application_name) {
                Ok(conn) => {
                    debug!("Opened connection {} to {}", id, database);
                    slots.push(ConnectionSlot::new(id, conn));
                }
                Err(e) => {
                    warn!("Connection {} to {} failed: {}", id, database, e);
                    // Nobody owns the pool yet, so close what is already open
                    for slot in &slots {
                        if let Err(close_err) = slot.close() {
                            warn!("Failed to close connection {}: {}", slot.id, close_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!("Opened {} connection(s) to database {}", size, database);
        Ok(Self {
            database: database.to_string(),
            slots,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: usize) -> &ConnectionSlot {
        &self.slots[id]
    }

    pub fn slots(&self) -> &[ConnectionSlot] {
        &self.slots
    }

    pub fn leader(&self) -> &ConnectionSlot {
        &self.slots[0]
    }

    pub fn followers(&self) -> &[ConnectionSlot] {
        &self.slots[1..]
    }

    /// Cancels, rolls back and closes every slot.
    ///
    /// Cancellation only asks the server to stop, so an explicit rollback follows
    /// to make sure each transaction is actually gone. Errors are logged and
    /// counted, never returned.
    pub fn shutdown(&self) -> usize {
        let mut failures = 0;

        for slot in &self.slots {
            if slot.is_closed() {
                continue;
            }
            if let Err(e) = slot.cancel() {
                warn!("Failed to cancel query on connection {}: {}", slot.id, e);
                failures += 1;
            }
        }

        for slot in &self.slots {
            if let Err(e) = slot.rollback() {
                warn!("Failed to roll back connection {}: {}", slot.id, e);
                failures += 1;
            }
            if let Err(e) = slot.close() {
                warn!("Failed to close connection {}: {}", slot.id, e);
                failures += 1;
            }
        }

        info!("Connection pool shut down");
        failures
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_connections: self.slots.len(),
            ..Default::default()
        };
        for slot in &self.slots {
            match slot.state() {
                SlotState::InTransaction => stats.in_transaction += 1,
                SlotState::Closed => stats.closed += 1,
                SlotState::Idle => {}
            }
            stats.statements_executed += slot.statements_executed();
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolStats {
    pub total_connections: usize,
    pub in_transaction: usize,
    pub closed: usize,
    pub statements_executed: u64,
}
