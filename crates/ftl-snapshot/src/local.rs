use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use filetime::FileTime;
use tracing::warn;

use ftl_core::FtlError;
use ftl_core::ignore::IgnoreSet;
use ftl_core::naming::short_id;
use ftl_core::paths::snapshots_dir;

use crate::{META_FILE, SnapshotInfo, SnapshotStore};

/// Files larger than this are copied but flagged: they usually mean a
/// build artifact or data blob that belongs in `.ftlignore`.
const LARGE_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Snapshots under `~/.ftl/snapshots/<id>/`, one directory per snapshot.
#[derive(Debug, Default)]
pub struct LocalSnapshotStore;

impl LocalSnapshotStore {
    pub fn new() -> Self {
        Self
    }

    pub fn snapshot_path(snapshot_id: &str) -> PathBuf {
        snapshots_dir().join(snapshot_id)
    }
}

impl SnapshotStore for LocalSnapshotStore {
    fn create(&self, project_path: &Path) -> Result<String> {
        let project_path = project_path
            .canonicalize()
            .with_context(|| format!("Project path not found: {}", project_path.display()))?;
        let snapshot_id = short_id();
        let snapshot_path = Self::snapshot_path(&snapshot_id);

        std::fs::create_dir_all(&snapshot_path)
            .with_context(|| format!("Failed to create {}", snapshot_path.display()))?;
        std::fs::write(snapshot_path.join(META_FILE), project_path.to_string_lossy().as_bytes())?;

        let ignore = IgnoreSet::for_project(&project_path);
        copy_tree(&project_path, &snapshot_path, &project_path, &ignore)?;

        Ok(snapshot_id)
    }

    fn restore(&self, snapshot_id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let snapshot_path = Self::snapshot_path(snapshot_id);
        if !snapshot_path.exists() {
            return Err(FtlError::SnapshotNotFound(snapshot_id.to_string()).into());
        }
        restore_overlay(&snapshot_path, target)
    }

    fn list(&self, project_filter: Option<&Path>) -> Result<Vec<SnapshotInfo>> {
        let dir = snapshots_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(Vec::new());
        };
        let filter = project_filter.and_then(|p| p.canonicalize().ok());

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let Ok(project) = std::fs::read_to_string(entry.path().join(META_FILE)) else {
                continue;
            };
            let project = project.trim().to_string();
            if let Some(ref filter) = filter {
                if Path::new(&project) != filter {
                    continue;
                }
            }
            snapshots.push(SnapshotInfo {
                id: entry.file_name().to_string_lossy().to_string(),
                project,
            });
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    fn delete(&self, snapshot_id: &str) -> Result<()> {
        let snapshot_path = Self::snapshot_path(snapshot_id);
        if snapshot_path.exists() {
            std::fs::remove_dir_all(&snapshot_path)
                .with_context(|| format!("Failed to delete {}", snapshot_path.display()))?;
        }
        Ok(())
    }
}

/// Recursively copy `src` into `dest`, skipping ignored paths.
fn copy_tree(src: &Path, dest: &Path, root: &Path, ignore: &IgnoreSet) -> Result<()> {
    for entry in std::fs::read_dir(src)
        .with_context(|| format!("Failed to read {}", src.display()))?
        .flatten()
    {
        let path = entry.path();
        let rel = path.strip_prefix(root).expect("entry under walk root");
        if ignore.matches(rel) {
            continue;
        }
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&path, &target, root, ignore)?;
        } else if file_type.is_file() {
            copy_with_metadata(&path, &target)?;
        }
        // Symlinks are skipped: a snapshot must stand on its own and a
        // link out of the tree would dangle after restore.
    }
    Ok(())
}

/// Copy one file preserving permissions and modification time.
pub(crate) fn copy_with_metadata(src: &Path, dest: &Path) -> Result<()> {
    let meta = std::fs::metadata(src)?;
    if meta.len() > LARGE_FILE_BYTES {
        warn!(
            path = %src.display(),
            size_mb = meta.len() / (1024 * 1024),
            "Snapshotting a very large file; consider adding it to .ftlignore"
        );
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest).with_context(|| format!("Failed to copy {}", src.display()))?;
    std::fs::set_permissions(dest, meta.permissions())?;
    filetime::set_file_mtime(dest, FileTime::from_last_modification_time(&meta))?;
    Ok(())
}

/// Overlay a snapshot directory onto a target, creating directories as
/// needed and overwriting files. `.ftl_meta` is never restored.
pub(crate) fn restore_overlay(snapshot_path: &Path, target: Option<&Path>) -> Result<PathBuf> {
    let meta_file = snapshot_path.join(META_FILE);
    let origin = std::fs::read_to_string(&meta_file)
        .with_context(|| format!("Snapshot is missing metadata: {}", meta_file.display()))?;
    let target = target
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(origin.trim()));

    overlay_dir(snapshot_path, &target, snapshot_path)?;
    Ok(target)
}

fn overlay_dir(src: &Path, dest: &Path, root: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)?.flatten() {
        if src == root && entry.file_name().to_string_lossy() == META_FILE {
            continue;
        }
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            overlay_dir(&path, &target, root)?;
        } else {
            copy_with_metadata(&path, &target)?;
        }
    }
    Ok(())
}
