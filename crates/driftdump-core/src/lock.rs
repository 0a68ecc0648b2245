//! Per-timestamp backup lock
//!
//! At most one backup may write a given timestamp's directories. The guard is an
//! exclusive advisory lock on a well-known file that exists only while the
//! guard is held. `release()` or dropping the guard removes it.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::{BackupError, Result};

pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct BackupLock {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl BackupLock {
    /// Acquires the lock, polling while another process holds it.
    ///
    /// With no `timeout` this waits until the holder goes away.
    pub fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        Self::acquire_with_interval(path, timeout, LOCK_POLL_INTERVAL)
    }

    pub fn acquire_with_interval(
        path: &Path,
        timeout: Option<Duration>,
        interval: Duration,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        let mut logged = false;
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // The previous holder may have removed the file we opened
                    if names_same_file(&file, path)? {
                        debug!("Acquired backup lock {}", path.display());
                        return Ok(Self {
                            path: path.to_path_buf(),
                            file: Mutex::new(Some(file)),
                        });
                    }
                    debug!("Lock file {} was replaced, retrying", path.display());
                }
                Err(e) => {
                    if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                        return Err(BackupError::LockContention(format!(
                            "another backup holds {} ({})",
                            path.display(),
                            e
                        )));
                    }
                    if !logged {
                        info!("Waiting for backup lock {}", path.display());
                        logged = true;
                    }
                    thread::sleep(interval);
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Removes and unlocks the lock file. Calling it again does nothing.
    ///
    /// The file is removed while still locked, so a waiter that wins the old
    /// inode sees it unlinked and retries on a fresh file.
    pub fn release(&self) -> Result<()> {
        let Some(file) = self.file.lock().take() else {
            return Ok(());
        };
        let removed = remove_if_present(&self.path);
        FileExt::unlock(&file)?;
        removed?;
        debug!("Released backup lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.lock().take() {
            let _ = remove_if_present(&self.path);
            let _ = FileExt::unlock(&file);
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True when `path` still names the open `file`.
#[cfg(unix)]
fn names_same_file(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn names_same_file(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}
