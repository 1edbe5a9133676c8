//! Per-run scratch storage for serialized artifacts.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::PartitionKey;

const SCRATCH_PREFIX: &str = "pg_s3_";

/// Private temporary directory, removed when dropped.
///
/// Owned by [`WrittenPartitions`](super::WrittenPartitions); dropping that
/// value deletes every artifact.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir()?;
        tracing::debug!(path = %dir.path().display(), "Created scratch directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory for one partition (`{scratch}/YYYY/MM/DD`), created on demand.
    pub fn partition_dir(&self, key: &PartitionKey) -> io::Result<PathBuf> {
        let dir = self.dir.path().join(key.path_segment());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        tracing::debug!(path = %self.dir.path().display(), "Removing scratch directory");
    }
}
