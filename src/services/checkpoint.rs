use crate::core::error::RunError;
use crate::core::io::Storage;
use crate::core::state::{AssemblyState, ErrorEntry};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `<stem>.state.json` next to the output.
pub fn checkpoint_path_for(output: &Path) -> PathBuf {
    output.with_extension("state.json")
}

pub fn lock_path_for(output: &Path) -> PathBuf {
    output.with_extension("lock")
}

/// Run statistics recorded alongside progress.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointStats<'a> {
    pub cumulative_duration_ms: u64,
    pub committed_frames: u64,
    pub error_log: &'a [ErrorEntry],
}

pub struct CheckpointStore {
    path: PathBuf,
    output_path: PathBuf,
    storage: Arc<dyn Storage>,
}

impl CheckpointStore {
    pub fn new(output_path: &Path, storage: Arc<dyn Storage>) -> Self {
        Self {
            path: checkpoint_path_for(output_path),
            output_path: output_path.to_path_buf(),
            storage,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(
        &self,
        completed: usize,
        total: usize,
        voice_assignments: &BTreeMap<String, String>,
        stats: CheckpointStats<'_>,
    ) -> Result<AssemblyState> {
        let state = AssemblyState {
            output_path: self.output_path.to_string_lossy().to_string(),
            completed_segment_count: completed,
            total_segment_count: total,
            voice_assignments: voice_assignments.clone(),
            cumulative_duration_ms: stats.cumulative_duration_ms,
            committed_frames: stats.committed_frames,
            error_log: stats.error_log.to_vec(),
            last_updated: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&state)?;
        self.storage
            .write(&self.path, json.as_bytes())
            .await
            .with_context(|| format!("Failed to write checkpoint {:?}", self.path))?;
        debug!("Checkpoint saved: {}/{} segments", completed, total);
        Ok(state)
    }

    /// Returns `None` when no checkpoint exists.
    pub async fn load(&self) -> Result<Option<AssemblyState>> {
        if !self.storage.exists(&self.path).await? {
            return Ok(None);
        }
        let content = self.storage.read(&self.path).await?;
        let state = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse checkpoint {:?}", self.path))?;
        Ok(Some(state))
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.delete(&self.path).await
    }
}

/// Exclusive claim on an output path, held for the lifetime of a run.
///
/// Backed by an advisory lock on `<stem>.lock`. The OS drops the lock when
/// the holding process exits, so a crashed run never blocks its resume; a
/// leftover lock file without a live holder is simply taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub fn acquire(output: &Path) -> Result<Self, RunError> {
        let path = lock_path_for(output);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| RunError::Io(e.into()))?;
            }
        }

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| RunError::Io(e.into()))?;

            match file.try_lock() {
                Ok(()) => {}
                Err(TryLockError::WouldBlock) => {
                    return Err(RunError::Input(format!(
                        "{:?} is being written by another running process",
                        output
                    )))
                }
                Err(TryLockError::Error(e)) => return Err(RunError::Io(e.into())),
            }

            // A releasing holder unlinks the file; retry on the fresh one
            if !still_linked(&file, &path).map_err(|e| RunError::Io(e.into()))? {
                continue;
            }

            let mut lock = Self { path, file };
            if lock.previous_holder().is_some() {
                warn!("Taking over stale lock {:?}", lock.path);
            }
            lock.record_pid().map_err(|e| RunError::Io(e.into()))?;
            return Ok(lock);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn previous_holder(&mut self) -> Option<u32> {
        let mut content = String::new();
        self.file.read_to_string(&mut content).ok()?;
        content.trim().parse().ok()
    }

    fn record_pid(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())?;
        self.file.sync_data()
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(on_disk) => Ok(on_disk.dev() == held.dev() && on_disk.ino() == held.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Open files cannot be unlinked here, so the path always names the held file
#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> std::io::Result<bool> {
    Ok(true)
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock; closing the file releases it
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock {:?}: {}", self.path, e);
        }
    }
}
