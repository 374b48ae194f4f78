//! swtpm companion process for SBSA runs.
//!
//! The TPM emulator runs next to QEMU, bound to the same socket. Nothing waits
//! for it to be ready (QEMU retries the connection) and nothing times it out:
//! after QEMU exits the pipeline joins the companion, which keeps running until
//! it is interrupted from the terminal.

use std::path::Path;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::process::{Cmd, Executor};

/// Observable lifecycle of a companion process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionState {
    Running,
    Exited(i32),
    /// The process could not be started.
    Failed(String),
}

/// Command line for swtpm serving `socket`. State lives next to the socket.
pub fn swtpm_command(swtpm: &Path, socket: &Path) -> Cmd {
    let state_dir = socket
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    Cmd::new(swtpm)
        .arg("socket")
        .arg("--tpmstate")
        .arg(format!("dir={}", state_dir.display()))
        .arg("--ctrl")
        .arg(format!("type=unixio,path={}", socket.display()))
        .arg("--tpm2")
        .arg("--log")
        .arg("level=20")
}

/// Handle to a companion running on its own task.
pub struct CompanionHandle {
    state: watch::Receiver<CompanionState>,
    task: JoinHandle<()>,
}

impl CompanionHandle {
    /// Start `cmd` in the background. Startup failures are logged, never returned.
    pub fn spawn<E: Executor>(executor: E, cmd: Cmd) -> Self {
        info!("Starting TPM emulator: {}", cmd);
        let (tx, rx) = watch::channel(CompanionState::Running);

        let task = tokio::spawn(async move {
            let state = match executor.status(&cmd).await {
                Ok(0) => CompanionState::Exited(0),
                Ok(code) => {
                    error!("Failed to start TPM emulator (exit status {})", code);
                    CompanionState::Exited(code)
                }
                Err(e) => {
                    error!("Failed to start TPM emulator: {}", e);
                    CompanionState::Failed(e.to_string())
                }
            };
            let _ = tx.send(state);
        });

        Self { state: rx, task }
    }

    pub fn state(&self) -> CompanionState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CompanionState::Running
    }

    /// Wait for the companion to finish.
    pub async fn join(self) -> CompanionState {
        if let Err(e) = self.task.await {
            error!("TPM emulator task failed: {}", e);
            return CompanionState::Failed(e.to_string());
        }
        let state = self.state.borrow().clone();
        state
    }

    /// Stop waiting for the companion. Its child process is killed.
    pub fn abort(self) {
        self.task.abort();
    }
}
