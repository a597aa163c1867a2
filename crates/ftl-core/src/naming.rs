use std::path::Path;

/// Generate a short random id: 8 hex chars.
///
/// Used for both snapshot ids and session trace ids.
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4();
    id.simple().to_string()[..8].to_string()
}

/// Stable 12-hex-char hash of a project path.
///
/// Keys the persisted container record and the S3 snapshot prefix, so every
/// invocation of the tool against the same project lands on the same key.
pub fn project_hash(project_path: &Path) -> String {
    let digest = md5::compute(project_path.to_string_lossy().as_bytes());
    format!("{:x}", digest)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_short_id_shape() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_ids_are_unique() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_project_hash_is_stable() {
        let path = PathBuf::from("/home/user/project");
        assert_eq!(project_hash(&path), project_hash(&path));
        assert_eq!(project_hash(&path).len(), 12);
    }

    #[test]
    fn test_project_hash_differs_per_path() {
        assert_ne!(
            project_hash(Path::new("/a")),
            project_hash(Path::new("/b"))
        );
    }
}
