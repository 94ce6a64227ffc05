//! Scoped scratch storage for conversion jobs and slot profiles.
//!
//! Every job gets its own directory under a managed base; the directory is
//! removed on every exit path through `TempDir`'s RAII guard. A periodic
//! sweep additionally removes orphaned entries older than the cleanup
//! interval, covering process-kill paths that bypass normal release.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::config::CommonConfig;

/// One job's scratch directory. Dropping the guard deletes the directory and
/// everything inside it.
pub struct JobScratch {
    dir: TempDir,
}

impl JobScratch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Hands out scoped scratch directories and sweeps up orphans.
pub struct TempFileManager {
    base: PathBuf,
    cleanup_max_age: Duration,
}

impl TempFileManager {
    pub fn new(common: &CommonConfig) -> std::io::Result<Self> {
        let base = common
            .temp_base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("docuscope_converter"));
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            cleanup_max_age: Duration::from_secs(common.cleanup_interval_secs),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create a fresh scratch directory named `<prefix>-<random>`.
    pub fn scoped(&self, prefix: &str) -> std::io::Result<JobScratch> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir_in(&self.base)?;
        Ok(JobScratch { dir })
    }

    /// Remove entries under the base directory older than the cleanup
    /// interval. Returns how many entries were removed. Errors on individual
    /// entries are logged and skipped; the sweep itself never fails.
    pub fn sweep_orphans(&self) -> usize {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Scratch sweep cannot read {}: {}", self.base.display(), e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok());
            let Some(age) = age else { continue };
            if age < self.cleanup_max_age {
                continue;
            }
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!("Failed to remove orphaned scratch {}: {}", path.display(), e)
                }
            }
        }
        if removed > 0 {
            tracing::debug!("Scratch sweep removed {} orphaned entries", removed);
        }
        removed
    }
}
