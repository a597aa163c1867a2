// ftl-sandbox: one reusable Docker container per project. Boot claims an
// existing container (on-disk record, then in-process standby) or creates
// a fresh one; the workspace is always reset from the snapshot mount.

mod docker;
mod interrupt;
mod record;

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

pub use docker::{BootOptions, DockerSandbox, SANDBOX_IMAGE};
pub use interrupt::{install_interrupt_handler, interrupted, reset_interrupt};
pub use record::{RecordLock, claim_record, read_record, write_record};

/// Result of a command run inside the sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command execution capability handed to agent adapters and the tester.
/// Adapters never touch the host; everything goes through here.
pub trait Sandbox {
    /// Run a command as the sandbox user with the session env sourced.
    fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Same, but stdout and stderr are merged and `on_line` is invoked for
    /// each output line as it is produced.
    fn exec_stream(
        &self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Run as root without the session env. Trust-store installation and
    /// diff capture only.
    fn exec_as_root(&self, command: &str) -> Result<ExecOutput>;
}

/// In-process slot holding a released-but-running container id.
///
/// This is the explicit home for what would otherwise be module-level
/// mutable state: the interactive shell creates one and threads it through
/// every session.
#[derive(Debug, Default)]
pub struct StandbySlot(Mutex<Option<String>>);

impl StandbySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, container_id: String) {
        *self.0.lock().expect("standby lock poisoned") = Some(container_id);
    }

    pub fn take(&self) -> Option<String> {
        self.0.lock().expect("standby lock poisoned").take()
    }
}
