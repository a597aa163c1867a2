//! Terminal rendering for the agent's stream-json output.
//!
//! Claude Code's `--output-format stream-json` emits newline-delimited
//! JSON events. The renderer shows assistant text as it arrives and each
//! tool call as a live spinner with elapsed seconds, roughly matching the
//! look of the interactive UI. Non-JSON lines (stderr from other agents)
//! pass through verbatim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::telemetry::SpanSink;

/// Tool-input keys worth surfacing in the spinner label, in preference order.
const DETAIL_KEYS: &[&str] = &["file_path", "path", "command", "query", "pattern", "glob"];

struct ActiveTool {
    label: String,
    started: Instant,
    spinner: ProgressBar,
}

pub struct AgentRenderer {
    active: Option<ActiveTool>,
    trace_id: String,
    sink: Arc<dyn SpanSink>,
}

impl AgentRenderer {
    pub fn new(trace_id: &str, sink: Arc<dyn SpanSink>) -> Self {
        Self {
            active: None,
            trace_id: trace_id.to_string(),
            sink,
        }
    }

    /// Process one raw output line from the agent.
    pub fn feed(&mut self, line: &str) {
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(event) => self.handle(&event),
            Err(_) => {
                // Non-JSON line (e.g. agent stderr) — print directly.
                self.finish_tool();
                println!("{}", line);
            }
        }
    }

    /// Call after the agent exits to close any open tool state.
    pub fn finish(&mut self) {
        self.finish_tool();
    }

    fn handle(&mut self, event: &serde_json::Value) {
        match event["type"].as_str() {
            Some("assistant") => {
                for block in event["message"]["content"].as_array().into_iter().flatten() {
                    match block["type"].as_str() {
                        Some("text") => {
                            let text = block["text"].as_str().unwrap_or_default();
                            if !text.trim().is_empty() {
                                self.finish_tool();
                                print!("{}", text);
                            }
                        }
                        Some("tool_use") => {
                            self.finish_tool();
                            self.start_tool(block);
                        }
                        // thinking blocks: silently skip
                        _ => {}
                    }
                }
            }
            Some("tool" | "result") => self.finish_tool(),
            _ => {}
        }
    }

    fn start_tool(&mut self, block: &serde_json::Value) {
        let label = tool_label(block);
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("  {spinner} {msg}  {elapsed}")
                .expect("valid spinner template"),
        );
        spinner.set_message(label.clone());
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.active = Some(ActiveTool {
            label,
            started: Instant::now(),
            spinner,
        });
    }

    fn finish_tool(&mut self) {
        let Some(tool) = self.active.take() else {
            return;
        };
        tool.spinner.finish_and_clear();
        let elapsed = tool.started.elapsed();
        println!(
            "  {}",
            format!("◆ {}  {:.1}s", tool.label, elapsed.as_secs_f64()).dimmed()
        );
        self.sink.emit(
            &self.trace_id,
            "tool",
            &tool.label,
            Some(elapsed.as_millis() as u64),
        );
    }
}

/// Human-readable label for a tool_use block: tool name plus the most
/// interesting input value, tail-truncated to keep one line.
fn tool_label(block: &serde_json::Value) -> String {
    let name = block["name"].as_str().unwrap_or_default();
    let input = &block["input"];
    let detail = DETAIL_KEYS
        .iter()
        .find_map(|key| input[*key].as_str())
        .unwrap_or_default();

    if detail.is_empty() {
        return name.to_string();
    }
    let detail = if detail.chars().count() > 60 {
        let tail: String = detail
            .chars()
            .rev()
            .take(59)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("…{}", tail)
    } else {
        detail.to_string()
    };
    format!("{}: {}", name, detail)
}

/// Shows elapsed seconds in place while waiting for the first byte of
/// agent output, so a long CLI cold start doesn't look like a hang.
/// Stops silently the moment the agent produces its first line.
pub struct AgentHeartbeat {
    spinner: Option<ProgressBar>,
}

impl AgentHeartbeat {
    pub fn start() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("  {spinner} waiting for agent...  {elapsed}")
                .expect("valid spinner template"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner: Some(spinner),
        }
    }

    /// Call on the first agent output line — no-op if already stopped.
    pub fn stop(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

/// Prints elapsed wall-clock time after each named orchestration stage
/// and emits a stage span.
pub struct StageTimer {
    stage_start: Instant,
    trace_id: String,
    sink: Arc<dyn SpanSink>,
}

impl StageTimer {
    pub fn new(trace_id: &str, sink: Arc<dyn SpanSink>) -> Self {
        Self {
            stage_start: Instant::now(),
            trace_id: trace_id.to_string(),
            sink,
        }
    }

    /// Mark the end of a stage; the next stage starts now.
    pub fn mark(&mut self, label: &str) -> Duration {
        let elapsed = self.stage_start.elapsed();
        self.stage_start = Instant::now();
        println!(
            "  {}",
            format!("{}  {:.1}s", label, elapsed.as_secs_f64()).dimmed()
        );
        self.sink
            .emit(&self.trace_id, "stage", label, Some(elapsed.as_millis() as u64));
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NoopSink;

    fn renderer() -> AgentRenderer {
        AgentRenderer::new("ab12cd34", Arc::new(NoopSink))
    }

    #[test]
    fn test_tool_label_prefers_file_path() {
        let block = serde_json::json!({
            "name": "Edit",
            "input": {"file_path": "/workspace/main.py", "command": "ignored"}
        });
        assert_eq!(tool_label(&block), "Edit: /workspace/main.py");
    }

    #[test]
    fn test_tool_label_truncates_long_detail() {
        let long = "x".repeat(100);
        let block = serde_json::json!({"name": "Bash", "input": {"command": long}});
        let label = tool_label(&block);
        assert!(label.starts_with("Bash: …"));
        assert!(label.chars().count() <= "Bash: ".len() + 60);
    }

    #[test]
    fn test_tool_label_bare_name() {
        let block = serde_json::json!({"name": "TodoWrite", "input": {}});
        assert_eq!(tool_label(&block), "TodoWrite");
    }

    #[test]
    fn test_feed_tolerates_non_json() {
        let mut r = renderer();
        r.feed("plain stderr line");
        r.feed("");
        r.finish();
    }

    #[test]
    fn test_feed_tool_use_then_result_closes_tool() {
        let mut r = renderer();
        r.feed(
            &serde_json::json!({
                "type": "assistant",
                "message": {"content": [
                    {"type": "tool_use", "name": "Read", "input": {"file_path": "a.py"}}
                ]}
            })
            .to_string(),
        );
        assert!(r.active.is_some());
        r.feed(&serde_json::json!({"type": "result"}).to_string());
        assert!(r.active.is_none());
    }

    #[test]
    fn test_heartbeat_stop_is_idempotent() {
        let mut heartbeat = AgentHeartbeat::start();
        heartbeat.stop();
        heartbeat.stop();
    }

    #[test]
    fn test_stage_timer_advances() {
        let mut timer = StageTimer::new("ab12cd34", Arc::new(NoopSink));
        std::thread::sleep(Duration::from_millis(10));
        let first = timer.mark("snapshot");
        assert!(first >= Duration::from_millis(10));
        let second = timer.mark("boot");
        assert!(second < first);
    }
}
