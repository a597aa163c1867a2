use std::process::{Command, Stdio};

/// Fire-and-forget span emission. Implementations must never fail, never
/// block the caller meaningfully, and never write to stdout.
///
/// Span types: `stage` (snapshot, boot, agent, tests), `tool` (each agent
/// tool call), `session` (start, merge, reject).
pub trait SpanSink: Send + Sync {
    fn emit(&self, trace_id: &str, span_type: &str, name: &str, elapsed_ms: Option<u64>);
}

/// Default sink: spans go to tracing debug output only.
pub struct NoopSink;

impl SpanSink for NoopSink {
    fn emit(&self, trace_id: &str, span_type: &str, name: &str, elapsed_ms: Option<u64>) {
        tracing::debug!(trace_id, span_type, name, elapsed_ms, "span");
    }
}

/// CloudWatch Logs sink via the aws CLI, so every session produces a
/// queryable execution trace (`filter trace_id = "..." | sort @timestamp`).
///
/// The put is spawned detached and its exit status ignored: tracing is
/// optional and must never break the main workflow.
pub struct CloudWatchSink {
    log_group: String,
    log_stream: String,
}

impl CloudWatchSink {
    /// Create the sink and best-effort ensure the group and stream exist.
    pub fn new(log_group: &str, log_stream: &str) -> Self {
        for args in [
            vec!["logs", "create-log-group", "--log-group-name", log_group],
            vec![
                "logs",
                "create-log-stream",
                "--log-group-name",
                log_group,
                "--log-stream-name",
                log_stream,
            ],
        ] {
            // ResourceAlreadyExists or missing permissions — fine either way.
            let _ = Command::new("aws")
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        Self {
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
        }
    }
}

impl SpanSink for CloudWatchSink {
    fn emit(&self, trace_id: &str, span_type: &str, name: &str, elapsed_ms: Option<u64>) {
        let mut event = serde_json::json!({
            "trace_id": trace_id,
            "span_type": span_type,
            "name": name,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(ms) = elapsed_ms {
            event["elapsed_ms"] = ms.into();
        }
        let log_event = format!(
            "timestamp={},message={}",
            chrono::Utc::now().timestamp_millis(),
            event
        );
        let _ = Command::new("aws")
            .args([
                "logs",
                "put-log-events",
                "--log-group-name",
                &self.log_group,
                "--log-stream-name",
                &self.log_stream,
                "--log-events",
                &log_event,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink_never_panics() {
        let sink = NoopSink;
        sink.emit("ab12cd34", "stage", "snapshot", Some(812));
        sink.emit("ab12cd34", "session", "start", None);
    }
}
