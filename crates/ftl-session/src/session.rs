use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::warn;

use ftl_agent::{AGENTS, auth_vars, get_agent};
use ftl_core::FtlError;
use ftl_core::audit::{AuditEntry, AuditEvent, write_log};
use ftl_core::config::Config;
use ftl_core::naming::short_id;
use ftl_diff::{DiffEntry, DiffStatus, LineTag, apply_diffs, diff_to_text, lint_diffs, summarize};
use ftl_proxy::CredentialSwapProxy;
use ftl_sandbox::{BootOptions, DockerSandbox, Sandbox, StandbySlot};
use ftl_secrets::{build_shadow_map, load_from_secrets_manager};
use ftl_snapshot::{LocalSnapshotStore, SnapshotStore};

use crate::guardrail::apply_guardrail;
use crate::render::{AgentHeartbeat, AgentRenderer, StageTimer};
use crate::telemetry::{CloudWatchSink, NoopSink, SpanSink};
use crate::model;
use crate::tester::{generate_tests_from_diff, generate_tests_from_task, run_test_code};

/// One coding task from snapshot to merge or reject.
///
/// Active exactly while a sandbox is attached. Cleanup always parks the
/// sandbox to standby and stops the proxy, whichever exit path runs.
pub struct Session<'a> {
    config: Config,
    project_path: PathBuf,
    store: &'a dyn SnapshotStore,
    standby: &'a StandbySlot,
    sink: Arc<dyn SpanSink>,
    trace_id: String,
    task: String,
    snapshot_id: Option<String>,
    sandbox: Option<DockerSandbox>,
    proxy: Option<CredentialSwapProxy>,
    shadow_env: BTreeMap<String, String>,
    diffs: Option<Vec<DiffEntry>>,
}

impl<'a> Session<'a> {
    pub fn new(
        config: Config,
        project_path: &Path,
        store: &'a dyn SnapshotStore,
        standby: &'a StandbySlot,
    ) -> Self {
        Self {
            config,
            project_path: project_path.to_path_buf(),
            store,
            standby,
            sink: Arc::new(NoopSink),
            trace_id: String::new(),
            task: String::new(),
            snapshot_id: None,
            sandbox: None,
            proxy: None,
            shadow_env: BTreeMap::new(),
            diffs: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.sandbox.is_some()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Run the full flow for a task: snapshot, shadow map, proxy, boot,
    /// agent and tester in parallel, generated tests, audit entry.
    pub fn start(&mut self, task: &str) -> Result<()> {
        self.task = task.to_string();
        self.trace_id = short_id();
        if let Some(group) = self.config.cloudwatch_log_group.clone() {
            self.sink = Arc::new(CloudWatchSink::new(&group, &self.trace_id));
        }
        let mut timer = StageTimer::new(&self.trace_id, self.sink.clone());

        // 1. Snapshot
        println!("{}", "Snapshotting project...".bold());
        let snapshot_id = self.store.create(&self.project_path)?;
        println!("  Snapshot: {}", snapshot_id.cyan());
        self.snapshot_id = Some(snapshot_id.clone());
        timer.mark("snapshot");

        // 2. Shadow credentials
        let seed = self
            .config
            .secrets_manager_prefix
            .as_deref()
            .map(load_from_secrets_manager)
            .unwrap_or_default();
        let shadow = build_shadow_map(&self.project_path, &self.config.shadow_env, seed);
        if !shadow.is_empty() {
            println!("  Shadow credentials: {} keys injected", shadow.len());
        }
        self.shadow_env = shadow.inject_env.clone();

        // 3. Proxy. A proxy that fails to come up is degraded mode, not
        // a dead session: the agent still runs, shadow values just reach
        // upstreams unswapped.
        let mut proxy_env: Vec<(String, String)> = Vec::new();
        if !shadow.is_empty() {
            match Self::start_proxy(&shadow.swap_table) {
                Ok(proxy) => {
                    proxy_env = proxy.env_vars();
                    self.proxy = Some(proxy);
                }
                Err(e) => {
                    warn!(error = %e, "Proxy unavailable");
                    println!(
                        "  {}",
                        "Warning: credential-swap proxy unavailable — shadow values will \
                         reach upstream services unswapped."
                            .yellow()
                    );
                }
            }
        }

        // 4. Agent auth — fail fast before any container work.
        let agent_env = self.collect_agent_auth()?;

        // 5. Boot + trust store
        println!("{}", "Booting sandbox...".bold());
        let snapshot_path = LocalSnapshotStore::snapshot_path(&snapshot_id);
        let mut credentials = shadow.inject_env.clone();
        credentials.extend(proxy_env);
        let sandbox = DockerSandbox::boot(
            &BootOptions {
                snapshot_path: &snapshot_path,
                credentials: &credentials,
                agent_env: &agent_env,
                project_path: &self.project_path,
                setup: self.config.setup.as_deref(),
            },
            self.standby,
        )?;
        println!(
            "  Sandbox ready ({})",
            if sandbox.fresh() { "fresh" } else { "warm" }
        );
        if let Some(proxy) = &self.proxy {
            let installed = sandbox
                .exec_as_root(&proxy.trust_install_command())
                .map(|r| r.success())
                .unwrap_or(false);
            if !installed {
                warn!("CA install failed; HTTPS interception will not work this session");
            }
        }
        self.sandbox = Some(sandbox);
        timer.mark("boot");

        // 6. Parallel fan-out: agent and tester never wait on each other.
        println!("{}", format!("Running agent ({})...", self.config.agent).bold());
        let sandbox = self.sandbox.as_ref().expect("sandbox just attached");
        let agent_name = self.config.agent.clone();
        let tester_id = self.config.tester.clone();
        let task_text = self.task.clone();
        let trace_id = self.trace_id.clone();
        let sink = self.sink.clone();

        let (agent_result, test_code) = std::thread::scope(|scope| {
            let agent_worker = scope.spawn(|| {
                let agent = get_agent(&agent_name)?;
                let mut renderer = AgentRenderer::new(&trace_id, sink.clone());
                let mut heartbeat = AgentHeartbeat::start();
                let mut on_line = |line: &str| {
                    heartbeat.stop();
                    renderer.feed(line);
                };
                let result = agent.run(&task_text, "/workspace", sandbox, Some(&mut on_line));
                heartbeat.stop();
                renderer.finish();
                result
            });
            let tester_worker = scope.spawn(|| {
                // Agent-named testers need the finished diff; they run on
                // demand via `test` instead of in the fan-out.
                if tester_id.is_empty() || AGENTS.contains(&tester_id.as_str()) {
                    return None;
                }
                generate_tests_from_task(&task_text, &tester_id)
            });
            (agent_worker.join(), tester_worker.join())
        });

        // Agent problems are review-time information, not orchestration
        // failures: partial progress is often useful.
        match agent_result {
            Ok(Ok(output)) if output.success() => {}
            Ok(Ok(output)) => {
                println!(
                    "{}",
                    format!("Agent exited with code {}", output.exit_code).red()
                );
                if !output.stderr.is_empty() {
                    println!("{}", output.stderr.red());
                }
            }
            Ok(Err(e)) => println!("{}", format!("Agent failed: {}", e).red()),
            Err(_) => println!("{}", "Agent worker panicked".red()),
        }
        timer.mark("agent");

        // 7. Generated tests, best-effort.
        if let Ok(Some(code)) = test_code {
            println!("{}", format!("Running tests ({})...", self.config.tester).bold());
            if let Err(e) = run_test_code(&code, sandbox) {
                println!("  {}", format!("Test run failed: {}", e).yellow());
            }
            timer.mark("tests");
        }

        // 8. Audit
        let entry = AuditEntry::new(
            &self.trace_id,
            AuditEvent::SessionStart,
            &self.task,
            &snapshot_id,
            &self.project_path.to_string_lossy(),
        );
        if let Err(e) = write_log(&entry) {
            warn!(error = %e, "Failed to write audit log");
        }
        self.sink.emit(&self.trace_id, "session", "start", None);

        println!();
        println!(
            "{} Commands: {}",
            "Session active.".bold(),
            "test, diff, merge, reject".dimmed()
        );
        Ok(())
    }

    fn start_proxy(swap_table: &BTreeMap<String, String>) -> Result<CredentialSwapProxy> {
        let mut proxy = CredentialSwapProxy::new(swap_table)?;
        proxy.start()?;
        Ok(proxy)
    }

    /// Host env the agent needs, per the auth table plus config extras.
    fn collect_agent_auth(&self) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        if let Some(vars) = auth_vars(&self.config.agent) {
            for key in vars.required {
                match std::env::var(key) {
                    Ok(value) if !value.is_empty() => {
                        env.insert(key.to_string(), value);
                    }
                    _ => {
                        return Err(FtlError::MissingAgentAuth {
                            key: key.to_string(),
                        }
                        .into());
                    }
                }
            }
            for key in vars.forwarded {
                if let Ok(value) = std::env::var(key) {
                    env.insert(key.to_string(), value);
                }
            }
        }
        for key in &self.config.agent_env {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }
        Ok(env)
    }

    /// Send a follow-up instruction to the agent in the same workspace.
    /// Any cached diff is stale afterwards.
    pub fn follow_up(&mut self, instruction: &str) -> Result<()> {
        let sandbox = self.sandbox.as_ref().context("No active session")?;
        let agent = get_agent(&self.config.agent)?;
        let mut renderer = AgentRenderer::new(&self.trace_id, self.sink.clone());
        let mut heartbeat = AgentHeartbeat::start();
        let mut on_line = |line: &str| {
            heartbeat.stop();
            renderer.feed(line);
        };
        let result = agent.continue_task(instruction, "/workspace", sandbox, Some(&mut on_line));
        heartbeat.stop();
        renderer.finish();
        match result {
            Ok(output) if !output.success() => {
                println!(
                    "{}",
                    format!("Agent exited with code {}", output.exit_code).red()
                );
            }
            Ok(_) => {}
            Err(e) => println!("{}", format!("Agent failed: {}", e).red()),
        }
        self.diffs = None;
        Ok(())
    }

    /// Lazily compute and cache the structured diff.
    fn ensure_diffs(&mut self) -> Result<&[DiffEntry]> {
        if self.diffs.is_none() {
            let sandbox = self.sandbox.as_ref().context("No active session")?;
            let snapshot_id = self.snapshot_id.as_ref().context("No snapshot")?;
            let snapshot_path = LocalSnapshotStore::snapshot_path(snapshot_id);
            self.diffs = Some(sandbox.get_diff(&snapshot_path)?);
        }
        Ok(self.diffs.as_deref().expect("just computed"))
    }

    pub fn show_diff(&mut self) -> Result<()> {
        let diffs = self.ensure_diffs()?.to_vec();
        display_diff(&diffs);
        Ok(())
    }

    /// Manual verification: route to an agent or a model per the tester
    /// id. Tester failures never block anything.
    pub fn run_tests(&mut self) -> Result<()> {
        let tester_id = self.config.tester.clone();
        if tester_id.is_empty() {
            println!("{}", "No tester configured.".dimmed());
            return Ok(());
        }
        let diffs = self.ensure_diffs()?.to_vec();
        if diffs.is_empty() {
            println!("{}", "No changes to test.".dimmed());
            return Ok(());
        }
        let diff_text = diff_to_text(&diffs);
        let sandbox = self.sandbox.as_ref().context("No active session")?;
        println!("{}", format!("Running verification ({})...", tester_id).bold());

        if AGENTS.contains(&tester_id.as_str()) {
            let agent = get_agent(&tester_id)?;
            let task = format!(
                "Review the following code changes and write tests that try to break them. \
                 Focus on edge cases, null inputs, boundary conditions, and unexpected usage. \
                 Run the tests and report results.\n\n{}",
                diff_text
            );
            match agent.run(&task, "/workspace", sandbox, None) {
                Ok(output) if output.success() => println!("  {}", "Tests passed.".green()),
                Ok(output) => {
                    println!("  {}", "Tests failed:".yellow());
                    println!("{}", format!("{}{}", output.stdout, output.stderr).dimmed());
                }
                Err(e) => println!("  {}", format!("Tester failed: {}", e).red()),
            }
        } else {
            match generate_tests_from_diff(&diff_text, &tester_id) {
                Ok(code) => {
                    if let Err(e) = run_test_code(&code, sandbox) {
                        println!("  {}", format!("Test run failed: {}", e).yellow());
                    }
                }
                Err(e) => println!("  {}", format!("Tester API error: {}", e).red()),
            }
        }
        Ok(())
    }

    /// Guardrail or lint, interactive review, then write-back or discard.
    pub fn merge(&mut self) -> Result<()> {
        anyhow::ensure!(self.is_active(), "No active session");
        let diffs = self.ensure_diffs()?.to_vec();
        if diffs.is_empty() {
            println!("{}", "No changes detected.".dimmed());
            self.cleanup();
            return Ok(());
        }
        let diff_text = diff_to_text(&diffs);

        if let Some(guardrail_id) = self.config.guardrail_id.clone() {
            let version = self.config.guardrail_version.clone().unwrap_or_default();
            let (blocked, findings) = apply_guardrail(&guardrail_id, &version, &diff_text);
            if blocked {
                println!("{}", "Guardrail blocked the merge:".red().bold());
                for finding in findings {
                    println!("  {}", finding.red());
                }
                println!("{}", "Changes discarded.".red());
                self.audit(AuditEvent::Reject, "guardrail_blocked", None);
                self.cleanup();
                return Ok(());
            }
        } else {
            let violations = lint_diffs(&diffs, &self.shadow_env);
            display_violations(&violations);
        }

        display_diff(&diffs);
        self.audit(AuditEvent::Review, "shown", Some(diffs.len()));

        if self.review_loop(&diffs)? {
            println!("{}", "Approved. Merging changes...".green().bold());
            let applied = apply_diffs(&diffs, &self.project_path)?;
            println!("  {} file(s) written to the project.", applied);
            self.audit(AuditEvent::Merge, "merged", Some(applied));
            self.sink.emit(&self.trace_id, "session", "merge", None);
        } else {
            println!("{}", "Rejected. Changes discarded.".red().bold());
            self.audit(AuditEvent::Reject, "rejected", None);
            self.sink.emit(&self.trace_id, "session", "reject", None);
        }

        if let Some(snapshot_id) = &self.snapshot_id {
            println!(
                "{}",
                format!("Snapshot {} available for rollback.", snapshot_id).dimmed()
            );
        }
        self.cleanup();
        Ok(())
    }

    /// Approve / reject / free-text question loop over the rendered diff.
    fn review_loop(&self, diffs: &[DiffEntry]) -> Result<bool> {
        loop {
            println!();
            println!(
                "{}",
                "  [A]pprove  [R]eject  [Q]uit  or ask a question".bold()
            );
            print!("  > ");
            std::io::stdout().flush()?;
            let mut choice = String::new();
            if std::io::stdin().read_line(&mut choice)? == 0 {
                return Ok(false);
            }
            let choice = choice.trim();
            if choice.is_empty() {
                continue;
            }
            match choice.to_lowercase().as_str() {
                "a" | "approve" => return Ok(true),
                "r" | "reject" | "q" | "quit" | "exit" => return Ok(false),
                question => self.ask_about_diff(diffs, question),
            }
        }
    }

    /// Ask the planner model a question about the diff.
    fn ask_about_diff(&self, diffs: &[DiffEntry], question: &str) {
        let system = "You are reviewing code changes in a diff. Answer the user's question \
                      about these changes concisely.";
        let user = format!(
            "Here are the code changes:\n\n{}\n\nQuestion: {}",
            diff_to_text(diffs),
            question
        );
        match model::complete(&self.config.planner_model, system, &user) {
            Ok(answer) => println!("\n{}\n", answer),
            Err(e) => println!("{}", format!("Planner error: {}", e).red()),
        }
    }

    /// Discard the session without merging.
    pub fn reject(&mut self) {
        if !self.is_active() {
            return;
        }
        self.audit(AuditEvent::Reject, "rejected", None);
        self.sink.emit(&self.trace_id, "session", "reject", None);
        println!("{}", "Changes discarded.".red());
        self.cleanup();
    }

    fn audit(&self, event: AuditEvent, result: &str, files_changed: Option<usize>) {
        let mut entry = AuditEntry::new(
            &self.trace_id,
            event,
            &self.task,
            self.snapshot_id.as_deref().unwrap_or_default(),
            &self.project_path.to_string_lossy(),
        )
        .with_result(result);
        if let Some(n) = files_changed {
            entry = entry.with_files_changed(n);
        }
        if let Err(e) = write_log(&entry) {
            warn!(error = %e, "Failed to write audit log");
        }
    }

    /// Park the sandbox for reuse and stop the proxy. Every exit path
    /// funnels through here.
    fn cleanup(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            sandbox.standby(self.standby);
        }
        if let Some(mut proxy) = self.proxy.take() {
            proxy.stop();
        }
        self.diffs = None;
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Containers are deliberately left running for reuse; only the
        // in-memory references are cleared.
        self.cleanup();
    }
}

/// Render diffs with GitHub-style colors and a summary footer.
pub fn display_diff(diffs: &[DiffEntry]) {
    if diffs.is_empty() {
        println!("{}", "No changes detected.".dimmed());
        return;
    }

    for diff in diffs {
        let header = format!("── {}: {}", diff.status.label().to_uppercase(), diff.path);
        let header = match diff.status {
            DiffStatus::Created => header.green().bold(),
            DiffStatus::Modified => header.yellow().bold(),
            DiffStatus::Deleted => header.red().bold(),
        };
        println!("\n{}\n", header);
        for line in &diff.lines {
            match line.tag {
                LineTag::Insert => println!("  {}", format!("+ {}", line.text).green()),
                LineTag::Delete => println!("  {}", format!("- {}", line.text).red()),
                LineTag::Equal => println!("    {}", line.text.dimmed()),
            }
        }
    }

    let summary = summarize(diffs);
    println!();
    println!(
        "{} | {} | {} | {} | {} | {}",
        format!("{} file(s) changed", diffs.len()).bold(),
        format!("+{} insertions", summary.insertions).green(),
        format!("-{} deletions", summary.deletions).red(),
        format!("{} created", summary.created).green(),
        format!("{} modified", summary.modified).yellow(),
        format!("{} deleted", summary.deleted).red(),
    );
}

fn display_violations(violations: &[ftl_diff::LintViolation]) {
    if violations.is_empty() {
        println!("{}", "Credential lint: clean".green());
        return;
    }
    println!(
        "\n{}\n",
        format!("Credential lint: {} violation(s) found", violations.len())
            .red()
            .bold()
    );
    for violation in violations {
        println!(
            "  {} — {}",
            format!("{}:{}", violation.file_path, violation.line_num).red(),
            violation.reason
        );
        println!("    {}", violation.line_content.trim().dimmed());
    }
    println!();
    println!(
        "{}",
        "The agent wrote code that references credentials directly. Review carefully \
         before merging."
            .yellow()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_config() -> Config {
        Config {
            agent: "claude-code".to_string(),
            ..Config::default()
        }
    }

    #[test]
    #[serial(ftl_home)]
    fn test_new_session_is_inactive() {
        let store = LocalSnapshotStore::new();
        let standby = StandbySlot::new();
        let session = Session::new(test_config(), Path::new("/tmp/p"), &store, &standby);
        assert!(!session.is_active());
    }

    #[test]
    #[serial(ftl_home)]
    fn test_reject_without_session_is_noop() {
        let store = LocalSnapshotStore::new();
        let standby = StandbySlot::new();
        let mut session = Session::new(test_config(), Path::new("/tmp/p"), &store, &standby);
        session.reject();
        assert!(!session.is_active());
    }

    #[test]
    #[serial(process_env)]
    fn test_collect_agent_auth_fails_fast_when_key_missing() {
        unsafe { std::env::remove_var("ANTHROPIC_API_KEY") };
        let store = LocalSnapshotStore::new();
        let standby = StandbySlot::new();
        let session = Session::new(test_config(), Path::new("/tmp/p"), &store, &standby);
        let err = session.collect_agent_auth().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FtlError>(),
            Some(FtlError::MissingAgentAuth { .. })
        ));
    }

    #[test]
    #[serial(process_env)]
    fn test_collect_agent_auth_includes_extras() {
        unsafe { std::env::set_var("ANTHROPIC_API_KEY", "sk-ant-test") };
        unsafe { std::env::set_var("MY_EXTRA_VAR", "extra") };
        let store = LocalSnapshotStore::new();
        let standby = StandbySlot::new();
        let mut config = test_config();
        config.agent_env = vec!["MY_EXTRA_VAR".to_string()];
        let session = Session::new(config, Path::new("/tmp/p"), &store, &standby);

        let env = session.collect_agent_auth().unwrap();
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-ant-test");
        assert_eq!(env["MY_EXTRA_VAR"], "extra");

        unsafe { std::env::remove_var("ANTHROPIC_API_KEY") };
        unsafe { std::env::remove_var("MY_EXTRA_VAR") };
    }

    #[test]
    fn test_display_diff_empty() {
        display_diff(&[]);
    }
}
