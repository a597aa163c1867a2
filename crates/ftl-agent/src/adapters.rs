use anyhow::Result;

use ftl_sandbox::{ExecOutput, Sandbox};

use crate::{Agent, dispatch, shell_quote};

/// Claude Code in headless mode. stream-json output feeds the renderer.
pub struct ClaudeCodeAgent;

impl Agent for ClaudeCodeAgent {
    fn name(&self) -> &'static str {
        "claude-code"
    }

    fn run(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput> {
        let cmd = format!(
            "cd {} && claude -p {} --output-format stream-json --verbose \
             --dangerously-skip-permissions",
            workspace,
            shell_quote(task),
        );
        dispatch(sandbox, &cmd, on_line)
    }

    fn continue_task(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput> {
        // --continue resumes the most recent conversation in the workspace.
        let cmd = format!(
            "cd {} && claude -p --continue {} --output-format stream-json --verbose \
             --dangerously-skip-permissions",
            workspace,
            shell_quote(task),
        );
        dispatch(sandbox, &cmd, on_line)
    }
}

pub struct CodexAgent;

impl Agent for CodexAgent {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn run(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput> {
        // --approval-mode full-auto skips all confirmation prompts inside
        // the sandbox; no native continue, the workspace carries context.
        let cmd = format!(
            "cd {} && codex --approval-mode full-auto {}",
            workspace,
            shell_quote(task),
        );
        dispatch(sandbox, &cmd, on_line)
    }
}

pub struct AiderAgent;

impl Agent for AiderAgent {
    fn name(&self) -> &'static str {
        "aider"
    }

    fn run(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput> {
        // --yes auto-confirms; --no-git because ftl owns the diffing.
        // Aider keeps .aider.chat.history.md in the workspace, so a plain
        // re-run picks up prior context on follow-ups.
        let cmd = format!(
            "cd {} && aider --yes --no-git --message {}",
            workspace,
            shell_quote(task),
        );
        dispatch(sandbox, &cmd, on_line)
    }
}

pub struct KiroAgent;

impl Agent for KiroAgent {
    fn name(&self) -> &'static str {
        "kiro"
    }

    fn run(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput> {
        let cmd = format!(
            "cd {} && kiro-cli chat --no-interactive --trust-all-tools {}",
            workspace,
            shell_quote(task),
        );
        dispatch(sandbox, &cmd, on_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the commands a real sandbox would have run.
    #[derive(Default)]
    struct RecordingSandbox {
        commands: Mutex<Vec<String>>,
        streamed: Mutex<Vec<String>>,
    }

    impl Sandbox for RecordingSandbox {
        fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(ExecOutput::default())
        }

        fn exec_stream(
            &self,
            command: &str,
            on_line: &mut dyn FnMut(&str),
            _timeout: Duration,
        ) -> Result<ExecOutput> {
            self.streamed.lock().unwrap().push(command.to_string());
            on_line("streamed line");
            Ok(ExecOutput::default())
        }

        fn exec_as_root(&self, _command: &str) -> Result<ExecOutput> {
            panic!("adapters must never exec as root");
        }
    }

    #[test]
    fn test_claude_code_quotes_task() {
        let sandbox = RecordingSandbox::default();
        ClaudeCodeAgent
            .run("add a login form; please", "/workspace", &sandbox, None)
            .unwrap();
        let commands = sandbox.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("cd /workspace && claude -p 'add a login form; please'"));
        assert!(commands[0].contains("--dangerously-skip-permissions"));
    }

    #[test]
    fn test_claude_code_continue_flag() {
        let sandbox = RecordingSandbox::default();
        ClaudeCodeAgent
            .continue_task("tweak it", "/workspace", &sandbox, None)
            .unwrap();
        let commands = sandbox.commands.lock().unwrap();
        assert!(commands[0].contains("claude -p --continue 'tweak it'"));
    }

    #[test]
    fn test_streaming_uses_exec_stream() {
        let sandbox = RecordingSandbox::default();
        let mut lines = Vec::new();
        let mut on_line = |line: &str| lines.push(line.to_string());
        CodexAgent
            .run("task", "/workspace", &sandbox, Some(&mut on_line))
            .unwrap();
        assert!(sandbox.commands.lock().unwrap().is_empty());
        assert_eq!(sandbox.streamed.lock().unwrap().len(), 1);
        assert_eq!(lines, vec!["streamed line"]);
    }

    #[test]
    fn test_aider_owns_no_git() {
        let sandbox = RecordingSandbox::default();
        AiderAgent.run("t", "/workspace", &sandbox, None).unwrap();
        assert!(sandbox.commands.lock().unwrap()[0].contains("--no-git"));
    }
}
