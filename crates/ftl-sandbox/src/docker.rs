use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use ftl_core::ignore::IgnoreSet;
use ftl_diff::{DiffEntry, OverlayEntry, compute_diff};

use crate::record::{RecordLock, claim_record, write_record};
use crate::{ExecOutput, Sandbox, StandbySlot, interrupted, reset_interrupt};

pub const SANDBOX_IMAGE: &str = "ftl-sandbox:latest";

const ENV_FILE: &str = "/tmp/.ftl_env";
const SNAPSHOTS_MOUNT: &str = "/mnt/snapshots";
const SANDBOX_USER: &str = "ftl";

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(1800);
const SETUP_TIMEOUT: Duration = Duration::from_secs(300);
const DIFF_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const DIFF_WALKER_TEMPLATE: &str = include_str!("diff_walker.py.tera");

/// Everything `boot` needs to bring a container to a ready workspace.
pub struct BootOptions<'a> {
    /// Local snapshot directory; its basename is the snapshot id.
    pub snapshot_path: &'a Path,
    /// Shadow credentials plus proxy routing vars.
    pub credentials: &'a BTreeMap<String, String>,
    /// Auth env for the agent itself (e.g. ANTHROPIC_API_KEY).
    pub agent_env: &'a BTreeMap<String, String>,
    /// Keys the persistent container record.
    pub project_path: &'a Path,
    /// Run once as the sandbox user on fresh boot.
    pub setup: Option<&'a str>,
}

/// A booted Docker container with `/workspace` initialised from the
/// snapshot. Containers are deliberately left running on process exit so
/// the next invocation reuses them warm.
#[derive(Debug)]
pub struct DockerSandbox {
    container_id: String,
    fresh: bool,
}

impl DockerSandbox {
    /// Boot or reuse a container for the project.
    ///
    /// Lookup order, serialised by an advisory file lock: the on-disk
    /// record (claimed by deleting it), the in-process standby slot, then
    /// a newly created container. `fresh` is true only for the last.
    pub fn boot(opts: &BootOptions, standby: &StandbySlot) -> Result<Self> {
        which::which("docker").map_err(|_| {
            anyhow::anyhow!("'docker' not found. Install Docker and run 'ftl setup' first.")
        })?;

        let container_id = {
            let _lock = RecordLock::acquire(opts.project_path)?;
            let mut found = None;
            if let Some(id) = claim_record(opts.project_path) {
                if is_running(&id) {
                    debug!(container = %id, "Claimed recorded container");
                    found = Some(id);
                }
            }
            if found.is_none() {
                if let Some(id) = standby.take() {
                    if is_running(&id) {
                        debug!(container = %id, "Claimed standby container");
                        found = Some(id);
                    }
                }
            }
            found
        };

        let fresh = container_id.is_none();
        let container_id = match container_id {
            Some(id) => id,
            None => create_container()?,
        };

        let sandbox = Self {
            container_id,
            fresh,
        };
        sandbox.init_workspace(opts.snapshot_path, fresh)?;
        sandbox.write_env_file(opts.credentials, opts.agent_env)?;
        write_record(opts.project_path, &sandbox.container_id)?;

        if fresh {
            if let Some(setup) = opts.setup {
                let result = sandbox.exec(setup, SETUP_TIMEOUT)?;
                if !result.success() {
                    warn!(
                        exit = result.exit_code,
                        "Setup command failed; continuing with the bare image"
                    );
                }
            }
            sandbox.spawn_warmup();
        }

        Ok(sandbox)
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// True only when this boot created the container.
    pub fn fresh(&self) -> bool {
        self.fresh
    }

    /// Reset `/workspace` and overlay the snapshot into it.
    fn init_workspace(&self, snapshot_path: &Path, fresh: bool) -> Result<()> {
        if !fresh {
            let wipe = self.exec_as_root("find /workspace -mindepth 1 -delete")?;
            if !wipe.success() {
                anyhow::bail!("Failed to reset workspace: {}", wipe.stderr.trim());
            }
        }
        let snapshot_id = snapshot_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Snapshot path has no basename")?;
        let load = self.exec_as_root(&format!(
            "cp -a {mount}/{id}/. /workspace/ && rm -f /workspace/.ftl_meta \
             && chown -R {user}:{user} /workspace",
            mount = SNAPSHOTS_MOUNT,
            id = snapshot_id,
            user = SANDBOX_USER,
        ))?;
        if !load.success() {
            anyhow::bail!(
                "Failed to load snapshot {} into workspace: {}",
                snapshot_id,
                load.stderr.trim()
            );
        }
        Ok(())
    }

    /// Write the session env file the exec wrapper sources.
    fn write_env_file(
        &self,
        credentials: &BTreeMap<String, String>,
        agent_env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let body = render_env_file(credentials, agent_env);
        let result = self.exec_as_root(&format!(
            "cat > {env} << 'FTLEOF'\n{body}FTLEOF\nchown {user}:{user} {env} && chmod 600 {env}",
            env = ENV_FILE,
            body = body,
            user = SANDBOX_USER,
        ))?;
        if !result.success() {
            anyhow::bail!("Failed to write sandbox env file: {}", result.stderr.trim());
        }
        Ok(())
    }

    /// Detached agent-CLI invocation to seed the page cache, so the first
    /// real run doesn't pay the cold start.
    fn spawn_warmup(&self) {
        let _ = Command::new("docker")
            .args([
                "exec",
                "-d",
                "-u",
                SANDBOX_USER,
                &self.container_id,
                "sh",
                "-c",
                "claude --version >/dev/null 2>&1 || true",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    /// Structured diff between the snapshot and `/workspace`.
    ///
    /// Walking the mounted filesystem from the host is painfully slow over
    /// virtualised FS, so a rendered script walks both trees inside the
    /// container, md5-compares, and emits a JSON overlay list the diff
    /// engine consumes.
    pub fn get_diff(&self, snapshot_path: &Path) -> Result<Vec<DiffEntry>> {
        let snapshot_id = snapshot_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Snapshot path has no basename")?;
        let script = render_diff_walker(snapshot_id)?;

        let result = self.exec_as_root(&format!("python3 - << 'FTLEOF'\n{}\nFTLEOF", script))?;
        if !result.success() {
            anyhow::bail!("Diff capture failed in container: {}", result.stderr.trim());
        }
        let overlay: Vec<OverlayEntry> = serde_json::from_str(result.stdout.trim())
            .context("Diff capture produced unparseable output")?;
        compute_diff(&overlay, snapshot_path)
    }

    /// Release the container to the in-process slot, leaving it running.
    pub fn standby(self, slot: &StandbySlot) {
        slot.put(self.container_id);
    }

    /// Force-remove the container.
    pub fn destroy(self) {
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    fn docker_exec(&self, user: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", "-u", user, &self.container_id, "sh", "-c", command]);
        run_with_timeout(cmd, timeout)
    }
}

impl Sandbox for DockerSandbox {
    fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let wrapped = format!(". {} && {}", ENV_FILE, command);
        self.docker_exec(SANDBOX_USER, &wrapped, timeout)
    }

    fn exec_stream(
        &self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let wrapped = format!("{{ . {} && {}; }} 2>&1", ENV_FILE, command);
        let mut cmd = Command::new("docker");
        cmd.args([
            "exec",
            "-u",
            SANDBOX_USER,
            &self.container_id,
            "sh",
            "-c",
            &wrapped,
        ]);
        stream_with_timeout(cmd, on_line, timeout)
    }

    fn exec_as_root(&self, command: &str) -> Result<ExecOutput> {
        self.docker_exec("root", command, DEFAULT_EXEC_TIMEOUT)
    }
}

/// POSIX `export K='V'` lines, values single-quote escaped. Credentials
/// first, then agent env; later keys win on collision.
fn render_env_file(
    credentials: &BTreeMap<String, String>,
    agent_env: &BTreeMap<String, String>,
) -> String {
    let mut merged = credentials.clone();
    for (k, v) in agent_env {
        merged.insert(k.clone(), v.clone());
    }
    let mut body = String::new();
    for (key, value) in &merged {
        body.push_str(&format!("export {}='{}'\n", key, shell_escape(value)));
    }
    body
}

/// Escape a value for inclusion inside single quotes.
fn shell_escape(value: &str) -> String {
    value.replace('\'', r"'\''")
}

/// Render the in-container walker with the diff ignore set baked in.
fn render_diff_walker(snapshot_id: &str) -> Result<String> {
    let ignore: Vec<&str> = ftl_core::ignore::DIFF_IGNORE.to_vec();
    let mut context = tera::Context::new();
    context.insert("snapshot_id", snapshot_id);
    context.insert("ignore_names_json", &serde_json::to_string(&ignore)?);
    tera::Tera::one_off(DIFF_WALKER_TEMPLATE, &context, false)
        .context("Failed to render diff walker script")
}

fn is_running(container_id: &str) -> bool {
    Command::new("docker")
        .args(["inspect", "-f", "{{.State.Running}}", container_id])
        .output()
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).contains("true"))
        .unwrap_or(false)
}

fn create_container() -> Result<String> {
    let snapshots = ftl_core::paths::snapshots_dir();
    std::fs::create_dir_all(&snapshots)?;
    let output = Command::new("docker")
        .args([
            "run",
            "-d",
            "--network=bridge",
            "--add-host=host.docker.internal:host-gateway",
            "--memory=2g",
            "--cpus=2",
            "-v",
            &format!("{}:{}:ro", snapshots.display(), SNAPSHOTS_MOUNT),
            "-w",
            "/workspace",
            SANDBOX_IMAGE,
            "sleep",
            "infinity",
        ])
        .output()
        .context("Failed to run docker")?;
    if !output.status.success() {
        anyhow::bail!(
            "Failed to create sandbox container (is the {} image built? run 'ftl setup'):\n{}",
            SANDBOX_IMAGE,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command with a wall-clock cap. On expiry the process is killed
/// and the conventional timeout exit code 124 is reported.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ExecOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("Failed to spawn command")?;

    let stdout = child.stdout.take().context("stdout not piped")?;
    let stderr = child.stderr.take().context("stderr not piped")?;
    let out_reader = std::thread::spawn(move || read_all(stdout));
    let err_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ExecOutput {
                exit_code: 124,
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", timeout.as_secs()),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn read_all(mut source: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = source.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Streaming variant: merged output, per-line callback, and interrupt
/// handling. Ctrl-C kills the subprocess and surfaces as an error after
/// the kill, so partial output is preserved in the error path's caller.
fn stream_with_timeout(
    mut cmd: Command,
    on_line: &mut dyn FnMut(&str),
    timeout: Duration,
) -> Result<ExecOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().context("Failed to spawn command")?;
    let stdout = child.stdout.take().context("stdout not piped")?;

    let (tx, rx) = mpsc::channel::<String>();
    let reader = std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let deadline = Instant::now() + timeout;
    let mut collected = String::new();
    let exit_code = loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                on_line(&line);
                collected.push_str(&line);
                collected.push('\n');
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let status = child.wait()?;
                break status.code().unwrap_or(-1);
            }
        }
        if interrupted() {
            let _ = child.kill();
            let _ = child.wait();
            let _ = reader.join();
            reset_interrupt();
            anyhow::bail!("Interrupted");
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = reader.join();
            return Ok(ExecOutput {
                exit_code: 124,
                stdout: collected,
                stderr: format!("Command timed out after {}s", timeout.as_secs()),
            });
        }
        if let Some(status) = child.try_wait()? {
            // Drain anything the reader produced after the last poll.
            while let Ok(line) = rx.try_recv() {
                on_line(&line);
                collected.push_str(&line);
                collected.push('\n');
            }
            if reader.is_finished() {
                break status.code().unwrap_or(-1);
            }
        }
    };

    let _ = reader.join();
    while let Ok(line) = rx.try_recv() {
        on_line(&line);
        collected.push_str(&line);
        collected.push('\n');
    }

    Ok(ExecOutput {
        exit_code,
        stdout: collected,
        stderr: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_env_file_rendering() {
        let mut credentials = BTreeMap::new();
        credentials.insert("STRIPE_KEY".to_string(), "ftl_shadow_x_00".to_string());
        let mut agent_env = BTreeMap::new();
        agent_env.insert("ANTHROPIC_API_KEY".to_string(), "sk-ant-123".to_string());

        let body = render_env_file(&credentials, &agent_env);
        assert!(body.contains("export STRIPE_KEY='ftl_shadow_x_00'\n"));
        assert!(body.contains("export ANTHROPIC_API_KEY='sk-ant-123'\n"));
    }

    #[test]
    fn test_env_file_escapes_single_quotes() {
        let mut credentials = BTreeMap::new();
        credentials.insert("TRICKY".to_string(), "it's a 'value'".to_string());
        let body = render_env_file(&credentials, &BTreeMap::new());
        assert!(body.contains(r"export TRICKY='it'\''s a '\''value'\'''"));
    }

    #[test]
    fn test_diff_walker_renders() {
        let script = render_diff_walker("ab12cd34").unwrap();
        assert!(script.contains("/mnt/snapshots/ab12cd34"));
        assert!(script.contains("__pycache__"));
        assert!(script.contains("_ftl_test"));
        // The baked-in ignore list is valid JSON.
        let json_start = script.find("json.loads('''").unwrap() + "json.loads('''".len();
        let json_end = script[json_start..].find("'''").unwrap() + json_start;
        let parsed: Vec<String> = serde_json::from_str(&script[json_start..json_end]).unwrap();
        assert!(parsed.contains(&"node_modules".to_string()));
    }

    #[test]
    fn test_run_with_timeout_reports_124() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let started = Instant::now();
        let result = run_with_timeout(cmd, Duration::from_millis(300)).unwrap();
        assert_eq!(result.exit_code, 124);
        assert!(result.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[test]
    #[serial(interrupt)]
    fn test_stream_invokes_callback_per_line() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two"]);
        let mut seen = Vec::new();
        let result = stream_with_timeout(cmd, &mut |line| seen.push(line.to_string()),
            Duration::from_secs(5))
        .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(seen, vec!["one", "two"]);
        assert_eq!(result.stdout, "one\ntwo\n");
    }

    #[test]
    #[serial(interrupt)]
    fn test_stream_timeout_preserves_partial_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo early; sleep 5"]);
        let mut seen = Vec::new();
        let result = stream_with_timeout(cmd, &mut |line| seen.push(line.to_string()),
            Duration::from_millis(500))
        .unwrap();
        assert_eq!(result.exit_code, 124);
        assert_eq!(seen, vec!["early"]);
    }
}
