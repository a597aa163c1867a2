use thiserror::Error;

/// Errors callers must be able to match on.
///
/// Everything else in the workspace flows through `anyhow` with context;
/// these variants exist because the CLI and the interactive shell branch
/// on them (exit codes, retry-free "not found" messages).
#[derive(Debug, Error)]
pub enum FtlError {
    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("No .ftlconfig found. Run 'ftl init' first.")]
    ConfigMissing,

    #[error("Invalid JSON in {path}: {detail}")]
    ConfigInvalid { path: String, detail: String },

    #[error("{key} is not set. Run: ftl auth {key} <value>")]
    MissingAgentAuth { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_not_found_message() {
        let err = FtlError::SnapshotNotFound("ab12cd34".to_string());
        assert_eq!(err.to_string(), "Snapshot ab12cd34 not found");
    }

    #[test]
    fn test_missing_auth_names_the_key() {
        let err = FtlError::MissingAgentAuth {
            key: "ANTHROPIC_API_KEY".to_string(),
        };
        assert!(err.to_string().contains("ftl auth ANTHROPIC_API_KEY"));
    }
}
