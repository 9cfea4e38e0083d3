// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Flat-file persistence for the pool snapshot.
//!
//! The snapshot is a JSON array of [`PersistedRecord`]. Writes go to a temp
//! file and are renamed into place while an exclusive lock is held on a
//! sibling `.lock` file, so a crash mid-save never leaves a torn snapshot and
//! a second engine instance cannot interleave its writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use anyhow::{Result, Context, bail};
use fs2::FileExt;

use super::types::PersistedRecord;

/// How long a load or save waits for the snapshot lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_POLL: Duration = Duration::from_millis(50);

/// Who may hold the snapshot lock alongside us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Readers share.
    Read,
    /// A writer excludes everyone.
    Write,
}

/// Reads and writes the pool snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the sibling `.lock` file for `access`, polling until `timeout`.
    /// The lock is released when the returned file is dropped.
    fn lock(&self, access: Access, timeout: Duration) -> Result<File> {
        let lock_path = self.path.with_extension("lock");
        if let Some(dir) = lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open snapshot lock {:?}", lock_path))?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = match access {
                Access::Read => FileExt::try_lock_shared(&file),
                Access::Write => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        bail!("Snapshot {:?} is locked by another engine ({:?} access, waited {:?})", self.path, access, timeout);
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to lock snapshot {:?}", self.path)),
            }
        }
    }

    /// Load the snapshot. A missing file is an empty snapshot.
    pub fn load(&self) -> Result<Vec<PersistedRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock(Access::Read, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read snapshot {:?}", self.path))?;
        let content = content.trim();
        if content.is_empty() || content == "null" {
            return Ok(Vec::new());
        }

        serde_json::from_str(content).with_context(|| format!("Failed to parse snapshot {:?}", self.path))
    }

    /// Write the snapshot atomically.
    pub fn save(&self, records: &[PersistedRecord]) -> Result<()> {
        let _lock = self.lock(Access::Write, LOCK_TIMEOUT)?;

        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string(records)
            .with_context(|| "Failed to serialize snapshot")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file.write_all(content.as_bytes())
                .with_context(|| "Failed to write snapshot temp file")?;
            temp_file.sync_all()
                .with_context(|| "Failed to sync snapshot temp file")?;
        }

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, self.path))?;
        Ok(())
    }
}
