use std::path::PathBuf;

/// Root of ftl's on-disk state: `$FTL_HOME` if set, otherwise `~/.ftl`.
///
/// The env override exists so integration tests can point the whole tool
/// at a scratch directory.
pub fn ftl_home() -> PathBuf {
    if let Ok(home) = std::env::var("FTL_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ftl")
}

/// Directory holding local snapshots, one subdirectory per snapshot id.
pub fn snapshots_dir() -> PathBuf {
    ftl_home().join("snapshots")
}

/// Directory holding persisted container records, one file per project.
pub fn containers_dir() -> PathBuf {
    ftl_home().join("containers")
}

/// Append-only session audit log.
pub fn logs_file() -> PathBuf {
    ftl_home().join("logs.jsonl")
}

/// Global credential file (mode 0600).
pub fn credentials_file() -> PathBuf {
    ftl_home().join("credentials")
}

/// Global config written by `ftl setup`.
pub fn global_config_file() -> PathBuf {
    ftl_home().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(ftl_home)]
    fn test_paths_hang_off_ftl_home() {
        let home = ftl_home();
        assert!(snapshots_dir().starts_with(&home));
        assert!(containers_dir().starts_with(&home));
        assert!(logs_file().starts_with(&home));
        assert!(credentials_file().starts_with(&home));
        assert!(global_config_file().starts_with(&home));
    }
}
