//! One supervisor per configuration file.
//!
//! Two supervisors on the same configuration would race for the same
//! processes and fight over window visibility, so `rove run` takes an `fs2`
//! exclusive lock on `<config>.lock`. A JSON sidecar records who holds it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("supervisor already running for this configuration (pid: {pid}, started: {started_at})")]
    AlreadyRunning { pid: u32, started_at: String },

    /// Lock is held but the sidecar is missing or unreadable.
    #[error("supervisor already running for this configuration (holder unknown)")]
    AlreadyRunningNoMeta,

    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Sidecar contents describing the lock holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub config_path: PathBuf,
    pub rove_version: String,
}

impl HolderInfo {
    fn current(config_path: &Path) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            config_path: config_path.to_path_buf(),
            rove_version: crate::VERSION.to_string(),
        }
    }
}

/// Held for the lifetime of a running supervisor; released on drop.
pub struct SupervisorLock {
    _file: File,
    lock_path: PathBuf,
    holder_path: PathBuf,
}

impl SupervisorLock {
    /// Lock the configuration at `config_path`.
    pub fn acquire(config_path: &Path) -> Result<Self, LockError> {
        let lock_path = lock_path_for(config_path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let lock = Self {
                    _file: file,
                    holder_path: holder_path_for(&lock_path),
                    lock_path,
                };
                lock.write_holder(config_path)?;
                tracing::debug!(lock_path = %lock.lock_path.display(), "acquired supervisor lock");
                Ok(lock)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(held_by(&lock_path)),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn write_holder(&self, config_path: &Path) -> Result<(), LockError> {
        let info = HolderInfo::current(config_path);
        let json = serde_json::to_string_pretty(&info)?;
        let mut file = File::create(&self.holder_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[must_use]
    pub fn holder_path(&self) -> &Path {
        &self.holder_path
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.holder_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    holder_path = %self.holder_path.display(),
                    error = %e,
                    "failed to remove lock holder file"
                );
            }
        }
        tracing::debug!(lock_path = %self.lock_path.display(), "released supervisor lock");
    }
}

/// `<config>.lock` next to the configuration file.
#[must_use]
pub fn lock_path_for(config_path: &Path) -> PathBuf {
    let mut name = config_path
        .file_name()
        .map_or_else(|| "rove.toml".into(), std::ffi::OsStr::to_os_string);
    name.push(".lock");
    config_path.with_file_name(name)
}

fn holder_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map_or_else(|| "rove.lock".into(), std::ffi::OsStr::to_os_string);
    name.push(".json");
    lock_path.with_file_name(name)
}

fn held_by(lock_path: &Path) -> LockError {
    fs::read_to_string(holder_path_for(lock_path))
        .ok()
        .and_then(|s| serde_json::from_str::<HolderInfo>(&s).ok())
        .map_or(LockError::AlreadyRunningNoMeta, |info| {
            LockError::AlreadyRunning {
                pid: info.pid,
                started_at: info.started_at.to_rfc3339(),
            }
        })
}

/// Holder of the lock for `config_path`, if any supervisor runs on it.
#[must_use]
pub fn current_holder(config_path: &Path) -> Option<HolderInfo> {
    let lock_path = lock_path_for(config_path);
    let file = OpenOptions::new().read(true).write(true).open(&lock_path).ok()?;
    match file.try_lock_exclusive() {
        Ok(()) => None,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => fs::read_to_string(holder_path_for(&lock_path))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
        Err(_) => None,
    }
}
