// ftl-snapshot: immutable, filtered copies of a project tree, captured
// before any agent action. The local store is the mount source for the
// sandbox; the S3 store adds a durable tier behind the same cache.

mod local;
mod s3;

use std::path::{Path, PathBuf};

use anyhow::Result;

pub use local::LocalSnapshotStore;
pub use s3::S3SnapshotStore;

/// Name of the metadata file written into every snapshot, holding the
/// absolute origin path so restore is self-describing. Never restored.
pub const META_FILE: &str = ".ftl_meta";

/// One listed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub project: String,
}

/// Capability set shared by the snapshot backends.
pub trait SnapshotStore: std::fmt::Debug {
    /// Snapshot the project tree. Returns the 8-hex snapshot id.
    fn create(&self, project_path: &Path) -> Result<String>;

    /// Overlay a snapshot onto `target` (origin path when omitted).
    /// Returns the path restored into.
    fn restore(&self, snapshot_id: &str, target: Option<&Path>) -> Result<PathBuf>;

    /// List snapshots, filtered to one project when a filter is given,
    /// sorted by id.
    fn list(&self, project_filter: Option<&Path>) -> Result<Vec<SnapshotInfo>>;

    /// Delete a snapshot. Unknown ids are a no-op.
    fn delete(&self, snapshot_id: &str) -> Result<()>;
}

/// Build the store named by the config.
pub fn create_snapshot_store(
    backend: &str,
    s3_bucket: Option<&str>,
) -> Result<Box<dyn SnapshotStore>> {
    match backend {
        "local" => Ok(Box::new(LocalSnapshotStore::new())),
        "s3" => {
            let bucket = s3_bucket.ok_or_else(|| {
                anyhow::anyhow!(
                    "s3_bucket is required when snapshot_backend is 's3'. \
                     Add it to .ftlconfig: {{\"s3_bucket\": \"my-ftl-bucket\"}}"
                )
            })?;
            Ok(Box::new(S3SnapshotStore::new(bucket)?))
        }
        other => anyhow::bail!("Unknown snapshot backend: {:?}. Use 'local' or 's3'.", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_local() {
        assert!(create_snapshot_store("local", None).is_ok());
    }

    #[test]
    fn test_factory_s3_requires_bucket() {
        let err = create_snapshot_store("s3", None).unwrap_err();
        assert!(err.to_string().contains("s3_bucket is required"));
    }

    #[test]
    fn test_factory_unknown_backend() {
        let err = create_snapshot_store("floppy", None).unwrap_err();
        assert!(err.to_string().contains("Unknown snapshot backend"));
    }
}
