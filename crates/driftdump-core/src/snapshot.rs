//! Synchronized snapshots across the connection pool
//!
//! The leader connection exports a snapshot and every follower imports it as the
//! first statement of its transaction, so all workers read one point-in-time view.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::connection::{ConnectionPool, ConnectionSlot};
use crate::errors::{BackupError, Result};

/// Oldest server release that can export and import snapshots.
pub const SYNCHRONIZED_SNAPSHOT_MIN_VERSION: ServerVersion = ServerVersion {
    major: 6,
    minor: 21,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// Parses the output of `SELECT version()`.
    ///
    /// Accepts both a bare `X.Y.Z` and a banner such as
    /// `PostgreSQL 12.12 (DriftDB Database 7.1.0 build commit:abc)`, where the
    /// number following `Database` wins.
    pub fn parse(banner: &str) -> Result<Self> {
        let candidate = match banner.rfind("Database ") {
            Some(pos) => banner[pos + "Database ".len()..].split_whitespace().next(),
            None => banner
                .split_whitespace()
                .find(|token| token.starts_with(|c: char| c.is_ascii_digit())),
        }
        .ok_or_else(|| BackupError::Validation(format!("unrecognized server version: {}", banner)))?;

        let mut parts = candidate.split('.').map(|part| {
            part.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<u32>()
                .ok()
        });

        let major = parts.next().flatten().ok_or_else(|| {
            BackupError::Validation(format!("unrecognized server version: {}", banner))
        })?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);

        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn supports_synchronized_snapshots(&self) -> bool {
        *self >= SYNCHRONIZED_SNAPSHOT_MIN_VERSION
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Outcome of snapshot negotiation for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotCapability {
    Supported(String),
    Unsupported,
}

impl SnapshotCapability {
    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            SnapshotCapability::Supported(id) => Some(id),
            SnapshotCapability::Unsupported => None,
        }
    }
}

/// Exports a snapshot on the leader and returns its identifier.
pub fn export_snapshot(leader: &ConnectionSlot) -> Result<String> {
    leader
        .begin()
        .map_err(|e| BackupError::Snapshot(format!("cannot open leader transaction: {}", e)))?;
    let id = leader
        .query_scalar("SELECT pg_export_snapshot()")
        .map_err(|e| BackupError::Snapshot(format!("snapshot export failed: {}", e)))?;
    let id = id.trim().to_string();
    validate_snapshot_id(&id)?;
    Ok(id)
}

/// Makes `slot` observe the snapshot `snapshot_id`.
///
/// Must run before the slot issues any other query in its transaction.
pub fn import_snapshot(slot: &ConnectionSlot, snapshot_id: &str) -> Result<()> {
    validate_snapshot_id(snapshot_id)?;
    slot.begin().map_err(|e| {
        BackupError::Snapshot(format!("cannot open transaction on connection {}: {}", slot.id, e))
    })?;
    slot.execute(&format!("SET TRANSACTION SNAPSHOT '{}'", snapshot_id))
        .map_err(|e| {
            BackupError::Snapshot(format!(
                "snapshot import failed on connection {}: {}",
                slot.id, e
            ))
        })?;
    Ok(())
}

fn validate_snapshot_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(BackupError::Snapshot(format!(
            "server returned an invalid snapshot id: {:?}",
            id
        )));
    }
    Ok(())
}

/// Puts every connection of the pool on one consistent view when the server can.
///
/// On older servers every slot still gets its own transaction, but followers may
/// observe commits made after the leader's view was taken.
#[instrument(skip(pool))]
pub fn synchronize(pool: &ConnectionPool, version: ServerVersion) -> Result<SnapshotCapability> {
    if !version.supports_synchronized_snapshots() {
        warn!(
            "Server {} predates synchronized snapshots ({}); worker connections may observe \
             commits made after the backup started",
            version, SYNCHRONIZED_SNAPSHOT_MIN_VERSION
        );
        for slot in pool.slots() {
            slot.begin()?;
        }
        return Ok(SnapshotCapability::Unsupported);
    }

    let snapshot_id = export_snapshot(pool.leader())?;
    for slot in pool.followers() {
        import_snapshot(slot, &snapshot_id)?;
    }

    info!(
        "Synchronized {} connection(s) on snapshot {}",
        pool.size(),
        snapshot_id
    );
    Ok(SnapshotCapability::Supported(snapshot_id))
}
