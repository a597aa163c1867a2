use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use opendal::Operator;
use opendal::services::S3;
use tracing::debug;

use ftl_core::FtlError;
use ftl_core::naming::project_hash;

use crate::local::{LocalSnapshotStore, restore_overlay};
use crate::{META_FILE, SnapshotInfo, SnapshotStore};

const S3_PREFIX: &str = "snapshots";

/// Snapshot store backed by S3, with the local store as a write-through
/// cache so the sandbox can bind-mount snapshots without a per-task
/// download. S3 is the durable tier; the cache is ephemeral.
pub struct S3SnapshotStore {
    op: Operator,
    local: LocalSnapshotStore,
    rt: tokio::runtime::Runtime,
}

impl std::fmt::Debug for S3SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3SnapshotStore")
            .field("op", &self.op)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl S3SnapshotStore {
    pub fn new(bucket: &str) -> Result<Self> {
        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".to_string());
        let builder = S3::default().bucket(bucket).region(&region);
        let op = Operator::new(builder)
            .with_context(|| format!("Failed to configure S3 bucket {}", bucket))?
            .finish();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            op,
            local: LocalSnapshotStore::new(),
            rt,
        })
    }

    /// Scan the bucket for the key carrying exactly this snapshot id.
    fn find_key(&self, snapshot_id: &str) -> Result<Option<String>> {
        let entries = self.rt.block_on(async {
            self.op
                .list_with(&format!("{}/", S3_PREFIX))
                .recursive(true)
                .await
        })?;
        for entry in entries {
            if let Some((id, _)) = parse_key(entry.path()) {
                if id == snapshot_id {
                    return Ok(Some(entry.path().to_string()));
                }
            }
        }
        Ok(None)
    }
}

impl SnapshotStore for S3SnapshotStore {
    fn create(&self, project_path: &Path) -> Result<String> {
        // Local cache first: the sandbox mounts it immediately.
        let snapshot_id = self.local.create(project_path)?;
        let local_path = LocalSnapshotStore::snapshot_path(&snapshot_id);

        let project_path = project_path.canonicalize()?;
        let key = snapshot_key(&project_path, &snapshot_id);
        let tarball = make_tarball(&local_path)?;
        debug!(key = %key, bytes = tarball.len(), "Uploading snapshot tarball");
        self.rt
            .block_on(self.op.write(&key, tarball))
            .with_context(|| format!("Failed to upload snapshot to s3 key {}", key))?;

        Ok(snapshot_id)
    }

    fn restore(&self, snapshot_id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let local_path = LocalSnapshotStore::snapshot_path(snapshot_id);

        // Pull and extract only when the cache is absent.
        if !local_path.exists() {
            let key = self
                .find_key(snapshot_id)?
                .ok_or_else(|| FtlError::SnapshotNotFound(snapshot_id.to_string()))?;
            let data = self
                .rt
                .block_on(self.op.read(&key))
                .with_context(|| format!("Failed to download s3 key {}", key))?;
            std::fs::create_dir_all(&local_path)?;
            extract_tarball(&data.to_vec(), &local_path)?;
        }

        restore_overlay(&local_path, target)
    }

    fn list(&self, project_filter: Option<&Path>) -> Result<Vec<SnapshotInfo>> {
        let filter = project_filter.and_then(|p| p.canonicalize().ok());
        let entries = self.rt.block_on(async {
            self.op
                .list_with(&format!("{}/", S3_PREFIX))
                .recursive(true)
                .await
        })?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let Some((id, project)) = parse_key(entry.path()) else {
                continue;
            };
            if let Some(ref filter) = filter {
                if Path::new(&project) != filter {
                    continue;
                }
            }
            snapshots.push(SnapshotInfo { id, project });
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    fn delete(&self, snapshot_id: &str) -> Result<()> {
        if let Some(key) = self.find_key(snapshot_id)? {
            self.rt
                .block_on(self.op.delete(&key))
                .with_context(|| format!("Failed to delete s3 key {}", key))?;
        }
        self.local.delete(snapshot_id)
    }
}

/// S3 key for a snapshot. The project path is encoded into the key name so
/// list/filter never needs a per-object metadata read:
/// `snapshots/<md5(path)[:12]>/<id>__<urlsafe-b64(path)>.tar.gz`
fn snapshot_key(project_path: &Path, snapshot_id: &str) -> String {
    let path_b64 = URL_SAFE_NO_PAD.encode(project_path.to_string_lossy().as_bytes());
    format!(
        "{}/{}/{}__{}.tar.gz",
        S3_PREFIX,
        project_hash(project_path),
        snapshot_id,
        path_b64
    )
}

/// Extract `(snapshot_id, project_path)` from an S3 key. None on any
/// malformed key — foreign objects in the prefix are skipped, not fatal.
fn parse_key(key: &str) -> Option<(String, String)> {
    let name = key.rsplit('/').next()?;
    let stem = name.strip_suffix(".tar.gz")?;
    let (id, path_b64) = stem.split_once("__")?;
    let path_bytes = URL_SAFE_NO_PAD.decode(path_b64).ok()?;
    let project = String::from_utf8(path_bytes).ok()?;
    Some((id.to_string(), project))
}

/// Gzip-compressed tarball of a snapshot directory, in memory.
fn make_tarball(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);
    tar.append_dir_all(".", dir)
        .with_context(|| format!("Failed to tar {}", dir.display()))?;
    let encoder = tar.into_inner()?;
    Ok(encoder.finish()?)
}

/// Extract a gzipped tarball into `target`, refusing any member whose
/// resolved path would escape the target directory.
fn extract_tarball(data: &[u8], target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    archive.set_preserve_mtime(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("Unsafe path in snapshot tarball: {:?}", path);
        }
        entry.unpack(target.join(&path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_key_roundtrip() {
        let project = PathBuf::from("/home/user/my project");
        let key = snapshot_key(&project, "ab12cd34");
        assert!(key.starts_with("snapshots/"));
        assert!(key.ends_with(".tar.gz"));

        let (id, path) = parse_key(&key).unwrap();
        assert_eq!(id, "ab12cd34");
        assert_eq!(path, "/home/user/my project");
    }

    #[test]
    fn test_key_is_grouped_by_project_hash() {
        let project = PathBuf::from("/srv/app");
        let key_a = snapshot_key(&project, "aaaaaaaa");
        let key_b = snapshot_key(&project, "bbbbbbbb");
        let prefix_a: Vec<&str> = key_a.split('/').take(2).collect();
        let prefix_b: Vec<&str> = key_b.split('/').take(2).collect();
        assert_eq!(prefix_a, prefix_b);
    }

    #[test]
    fn test_parse_key_rejects_foreign_objects() {
        assert!(parse_key("snapshots/abc/no-separator.tar.gz").is_none());
        assert!(parse_key("snapshots/abc/id__notb64!!!.tar.gz").is_none());
        assert!(parse_key("other/file.txt").is_none());
    }

    #[test]
    fn test_tarball_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(src.path().join("sub/b.txt"), "beta").unwrap();
        std::fs::write(src.path().join(META_FILE), "/origin").unwrap();

        let tarball = make_tarball(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        extract_tarball(&tarball, dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("a.txt")).unwrap(),
            "alpha"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("sub/b.txt")).unwrap(),
            "beta"
        );
        assert!(dest.path().join(META_FILE).exists());
    }

    #[test]
    fn test_extract_rejects_path_traversal() {
        // Hand-build a tarball containing a ../evil member.
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        // `tar`'s path-setting helpers (and `append_data`) reject `..`
        // components outright, so the malicious name is written straight
        // into the raw header bytes to reach the extractor's own check.
        let name = b"../evil";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append(&header, "oops".as_bytes()).unwrap();
        let mut encoder = builder.into_inner().unwrap();
        encoder.flush().unwrap();
        let data = encoder.finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("inner");
        std::fs::create_dir_all(&target).unwrap();

        let err = extract_tarball(&data, &target).unwrap_err();
        assert!(err.to_string().contains("Unsafe path"));
        assert!(!dest.path().join("evil").exists());
    }
}
