use tabled::settings::Style;
use tabled::{Table, Tabled};

use ftl_core::audit::AuditEntry;
use ftl_snapshot::SnapshotInfo;

/// Display row for `ftl snapshots`.
#[derive(Debug, Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "PROJECT")]
    project: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

/// Display row for `ftl logs`.
#[derive(Debug, Tabled)]
struct LogRow {
    #[tabled(rename = "TIME")]
    time: String,
    #[tabled(rename = "EVENT")]
    event: String,
    #[tabled(rename = "TASK")]
    task: String,
    #[tabled(rename = "SNAPSHOT")]
    snapshot: String,
    #[tabled(rename = "RESULT")]
    result: String,
}

fn snapshot_rows(rows: &[(SnapshotInfo, String, std::time::SystemTime)]) -> Vec<SnapshotRow> {
    rows.iter()
        .map(|(info, created, _)| SnapshotRow {
            id: info.id.clone(),
            project: info.project.clone(),
            created: created.clone(),
        })
        .collect()
}

fn log_rows(entries: &[AuditEntry]) -> Vec<LogRow> {
    entries
        .iter()
        .map(|entry| {
            let time = chrono::DateTime::parse_from_rfc3339(&entry.timestamp)
                .map(|t| t.format("%m-%d %H:%M").to_string())
                .unwrap_or_else(|_| entry.timestamp.clone());
            let event = serde_json::to_string(&entry.event)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            let mut task = entry.task.clone();
            if task.chars().count() > 50 {
                task = format!("{}…", task.chars().take(49).collect::<String>());
            }
            LogRow {
                time,
                event,
                task,
                snapshot: entry.snapshot.clone(),
                result: entry.result.clone().unwrap_or_default(),
            }
        })
        .collect()
}

pub fn snapshot_table(rows: &[(SnapshotInfo, String, std::time::SystemTime)]) {
    let table = Table::new(snapshot_rows(rows))
        .with(Style::rounded())
        .to_string();
    println!("{}", table);
}

pub fn logs_table(entries: &[AuditEntry]) {
    let table = Table::new(log_rows(entries))
        .with(Style::rounded())
        .to_string();
    println!("{}", table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_core::audit::AuditEvent;

    #[test]
    fn test_snapshot_rows() {
        let rows = snapshot_rows(&[(
            SnapshotInfo {
                id: "ab12cd34".to_string(),
                project: "/home/user/proj".to_string(),
            },
            "2026-08-01 10:00".to_string(),
            std::time::UNIX_EPOCH,
        )]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "ab12cd34");
        assert_eq!(rows[0].created, "2026-08-01 10:00");
    }

    #[test]
    fn test_log_rows_format() {
        let entry = AuditEntry::new("ab12cd34", AuditEvent::SessionStart, &"t".repeat(80), "s", "/p")
            .with_result("merged");
        let rows = log_rows(&[entry]);
        assert_eq!(rows[0].event, "session_start");
        assert_eq!(rows[0].result, "merged");
        // Long tasks are tail-truncated with an ellipsis.
        assert_eq!(rows[0].task.chars().count(), 50);
        assert!(rows[0].task.ends_with('…'));
    }

    #[test]
    fn test_tables_render() {
        let table = Table::new(snapshot_rows(&[(
            SnapshotInfo {
                id: "ab12cd34".to_string(),
                project: "/p".to_string(),
            },
            "2026-08-01 10:00".to_string(),
            std::time::UNIX_EPOCH,
        )]))
        .with(Style::rounded())
        .to_string();
        assert!(table.contains("ID"));
        assert!(table.contains("ab12cd34"));

        logs_table(&[AuditEntry::new("ab12cd34", AuditEvent::Merge, "task", "s", "/p")]);
    }
}
