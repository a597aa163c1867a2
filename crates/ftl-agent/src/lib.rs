// ftl-agent: thin adapters over vendor CLIs. Each one quotes the task,
// shells into the workspace, and invokes its CLI with non-interactive
// flags. Adapters never touch the host — everything runs through the
// sandbox's exec capability.

mod adapters;

use std::time::Duration;

use anyhow::Result;

use ftl_sandbox::{ExecOutput, Sandbox};

pub use adapters::{AiderAgent, ClaudeCodeAgent, CodexAgent, KiroAgent};

/// Wall-clock cap for a single agent run.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Known agent names, in registry order.
pub const AGENTS: &[&str] = &["claude-code", "codex", "aider", "kiro"];

/// Auth environment contract per agent: `required` keys fail the session
/// fast when absent from the host env; `forwarded` keys are passed along
/// when present.
pub struct AgentAuthVars {
    pub required: &'static [&'static str],
    pub forwarded: &'static [&'static str],
}

/// Keys each agent needs from the host environment.
pub const AGENT_AUTH_VARS: &[(&str, AgentAuthVars)] = &[
    (
        "claude-code",
        AgentAuthVars {
            required: &["ANTHROPIC_API_KEY"],
            forwarded: &[],
        },
    ),
    (
        "codex",
        AgentAuthVars {
            required: &["OPENAI_API_KEY"],
            forwarded: &[],
        },
    ),
    (
        "aider",
        AgentAuthVars {
            required: &[],
            forwarded: &["ANTHROPIC_API_KEY", "OPENAI_API_KEY"],
        },
    ),
    // Kiro authenticates via browser login persisted in the container.
    (
        "kiro",
        AgentAuthVars {
            required: &[],
            forwarded: &["AWS_REGION"],
        },
    ),
];

/// Language-neutral agent contract: run a task, or continue a prior one
/// in the same workspace. Streaming when a callback is supplied.
pub trait Agent {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput>;

    /// Follow-up in an existing session. Default: a fresh run — workspace
    /// state carries the context for agents without a native continue.
    fn continue_task(
        &self,
        task: &str,
        workspace: &str,
        sandbox: &dyn Sandbox,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ExecOutput> {
        self.run(task, workspace, sandbox, on_line)
    }
}

/// Look up an adapter by its registry name.
pub fn get_agent(name: &str) -> Result<Box<dyn Agent>> {
    match name {
        "claude-code" => Ok(Box::new(ClaudeCodeAgent)),
        "codex" => Ok(Box::new(CodexAgent)),
        "aider" => Ok(Box::new(AiderAgent)),
        "kiro" => Ok(Box::new(KiroAgent)),
        other => anyhow::bail!("Unknown agent: {:?}. Available: {:?}", other, AGENTS),
    }
}

/// Auth table entry for an agent, if it has one.
pub fn auth_vars(agent: &str) -> Option<&'static AgentAuthVars> {
    AGENT_AUTH_VARS
        .iter()
        .find(|(name, _)| *name == agent)
        .map(|(_, vars)| vars)
}

/// Quote a string for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Run through `exec_stream` when a callback is given, plain `exec`
/// otherwise. Shared by every adapter.
pub(crate) fn dispatch(
    sandbox: &dyn Sandbox,
    command: &str,
    on_line: Option<&mut dyn FnMut(&str)>,
) -> Result<ExecOutput> {
    match on_line {
        Some(callback) => sandbox.exec_stream(command, callback, AGENT_TIMEOUT),
        None => sandbox.exec(command, AGENT_TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        for name in AGENTS {
            assert_eq!(get_agent(name).unwrap().name(), *name);
        }
        assert!(get_agent("unknown").is_err());
    }

    #[test]
    fn test_every_agent_has_auth_vars() {
        for name in AGENTS {
            assert!(auth_vars(name).is_some(), "missing auth table for {}", name);
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple"), "'simple'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a b; rm -rf /"), "'a b; rm -rf /'");
    }
}
