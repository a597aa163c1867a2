use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

/// Session events recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStart,
    Review,
    Merge,
    Reject,
}

/// One append-only line in `~/.ftl/logs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub event: AuditEvent,
    pub task: String,
    pub snapshot: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<usize>,
}

impl AuditEntry {
    pub fn new(trace_id: &str, event: AuditEvent, task: &str, snapshot: &str, project: &str) -> Self {
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            trace_id: trace_id.to_string(),
            event,
            task: task.to_string(),
            snapshot: snapshot.to_string(),
            project: project.to_string(),
            result: None,
            files_changed: None,
        }
    }

    pub fn with_result(mut self, result: &str) -> Self {
        self.result = Some(result.to_string());
        self
    }

    pub fn with_files_changed(mut self, n: usize) -> Self {
        self.files_changed = Some(n);
        self
    }
}

/// Append an entry to the audit log, creating the file as needed.
pub fn write_log(entry: &AuditEntry) -> Result<()> {
    let path = paths::logs_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read all entries, optionally filtered to one project.
///
/// Unparseable lines are skipped: the log is append-only across versions
/// and a torn write must not break `ftl logs`.
pub fn read_log(project_filter: Option<&str>) -> Vec<AuditEntry> {
    let Ok(text) = std::fs::read_to_string(paths::logs_file()) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| serde_json::from_str::<AuditEntry>(line.trim()).ok())
        .filter(|e| project_filter.is_none_or(|p| e.project == p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_audit_entry_serialization() {
        let entry = AuditEntry::new("ab12cd34", AuditEvent::SessionStart, "add login", "e5f6", "/p")
            .with_result("merged")
            .with_files_changed(3);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"session_start\""));
        assert!(json.contains("\"trace_id\":\"ab12cd34\""));
        assert!(json.contains("\"files_changed\":3"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let entry = AuditEntry::new("ab12cd34", AuditEvent::Review, "t", "s", "/p");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("result"));
        assert!(!json.contains("files_changed"));
    }

    #[test]
    #[serial(ftl_home)]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("FTL_HOME", dir.path()) };

        let entry = AuditEntry::new("11223344", AuditEvent::Merge, "task", "snap", "/proj")
            .with_result("merged");
        write_log(&entry).unwrap();
        write_log(&AuditEntry::new("55667788", AuditEvent::Reject, "t2", "s2", "/other")).unwrap();

        let all = read_log(None);
        assert_eq!(all.len(), 2);
        let filtered = read_log(Some("/proj"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].trace_id, "11223344");

        unsafe { std::env::remove_var("FTL_HOME") };
    }

    #[test]
    #[serial(ftl_home)]
    fn test_unparseable_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("FTL_HOME", dir.path()) };
        std::fs::create_dir_all(paths::logs_file().parent().unwrap()).unwrap();
        std::fs::write(paths::logs_file(), "not json\n").unwrap();
        assert!(read_log(None).is_empty());
        unsafe { std::env::remove_var("FTL_HOME") };
    }
}
