//! Durable checkpoint: the highest block whose events were fully handed off to the relay.
//!
//! Loaded once at startup and saved only at chunk-completion barriers. The file store writes
//! atomically (temp file, fsync, rename) so a reader after a crash sees either the previous or
//! the new value. Ownership is an advisory lock on `<path>.lock`, held for the store's lifetime
//! and released by the OS when the owning process exits, however it exits.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Last confirmed-processed block. Non-decreasing except through [CheckpointStore::rollback].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_confirmed_block: u64,
}

impl Checkpoint {
    pub fn new(last_confirmed_block: u64) -> Self {
        Self {
            last_confirmed_block,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("refusing to move checkpoint back from {current} to {attempted}; use an explicit rollback")]
    Regression { current: u64, attempted: u64 },

    #[error("checkpoint lock {0} is held by another running listener")]
    Locked(PathBuf),
}

/// Durable single-slot store for the [Checkpoint].
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` on first run.
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Persist `checkpoint`. Rejects values below the stored one.
    fn save(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    /// Operator-triggered move to any value, including backwards.
    fn rollback(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;
}

/// JSON file store: `{"last_confirmed_block": N}`.
///
/// Also reads the legacy layout (a bare decimal block number).
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    // Holds the exclusive lock until dropped or the process dies.
    _lock: File,
}

impl FileCheckpointStore {
    /// Open the store at `path`, locking `<path>.lock`. Fails with [CheckpointError::Locked] if
    /// another live owner holds it. A lock file left behind by a dead process is reused.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let lock_path = sibling(&path, "lock");
        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if let Err(e) = FileExt::try_lock_exclusive(&lock) {
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(CheckpointError::Locked(lock_path));
            }
            return Err(e.into());
        }
        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;
        tracing::debug!(path = %path.display(), "checkpoint store opened");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let tmp = sibling(&self.path, "tmp");
        let body = serde_json::to_vec(&checkpoint).map_err(io::Error::other)?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        #[cfg(unix)]
        {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                File::open(dir)?.sync_all()?;
            }
        }
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_checkpoint(&self.path, &bytes).map(Some)
    }

    fn save(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        if let Some(current) = self.load()? {
            if checkpoint < current {
                return Err(CheckpointError::Regression {
                    current: current.last_confirmed_block,
                    attempted: checkpoint.last_confirmed_block,
                });
            }
        }
        self.write_atomic(checkpoint)
    }

    fn rollback(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let previous = self.load()?;
        self.write_atomic(checkpoint)?;
        tracing::warn!(
            from = ?previous.map(|c| c.last_confirmed_block),
            to = checkpoint.last_confirmed_block,
            "checkpoint rolled back by operator"
        );
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

fn parse_checkpoint(path: &Path, bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::str::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(corrupt("empty file".into()));
    }
    if let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(text) {
        return Ok(checkpoint);
    }
    text.parse::<u64>()
        .map(Checkpoint::new)
        .map_err(|_| corrupt(format!("unrecognized content {:?}", text)))
}
