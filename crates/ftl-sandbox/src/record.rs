use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use ftl_core::naming::project_hash;
use ftl_core::paths::containers_dir;

/// Path of the persisted container record for a project: the file holds
/// the container id, nothing else.
pub fn record_path(project_path: &Path) -> PathBuf {
    containers_dir().join(project_hash(project_path))
}

fn lock_file_path(project_path: &Path) -> PathBuf {
    let mut path = record_path(project_path).into_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

/// Advisory exclusive lock serialising container lookup and claim for one
/// project. Held for the duration of `boot`'s lookup; released on drop.
/// Two processes racing the same project: one claims the record, the
/// other creates a new container.
pub struct RecordLock {
    file: File,
}

impl RecordLock {
    pub fn acquire(project_path: &Path) -> Result<Self> {
        let path = lock_file_path(project_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Read the recorded container id for a project, if any.
pub fn read_record(project_path: &Path) -> Option<String> {
    let id = std::fs::read_to_string(record_path(project_path)).ok()?;
    let id = id.trim().to_string();
    (!id.is_empty()).then_some(id)
}

/// Persist the container id for a project.
pub fn write_record(project_path: &Path, container_id: &str) -> Result<()> {
    let path = record_path(project_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, container_id)
        .with_context(|| format!("Failed to write container record {}", path.display()))
}

/// Read and delete the record in one step, so a concurrent caller that
/// grabs the lock next sees no record and creates its own container.
pub fn claim_record(project_path: &Path) -> Option<String> {
    let id = read_record(project_path)?;
    let _ = std::fs::remove_file(record_path(project_path));
    Some(id)
}
