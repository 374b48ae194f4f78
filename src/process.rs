//! Child process plumbing.
//!
//! Every external program (QEMU, cargo, the patch tool, swtpm) is described by
//! a [`Cmd`] and run through an [`Executor`]. Production code uses
//! [`SystemExecutor`]; tests swap in a recording fake.

use std::ffi::OsStr;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

/// A command line plus the environment it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: PathBuf,
    args: Vec<String>,
    dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: PathBuf::from(program.as_ref()),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        let path = path.display().to_string();
        self.arg(path)
    }

    /// Working directory for the child.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Environment variable set for this invocation only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished child.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub status: i32,
    pub stdout: String,
}

/// Runs commands to completion.
pub trait Executor: Clone + Send + Sync + 'static {
    /// Run with inherited stdio and return the normalized exit code.
    fn status(&self, cmd: &Cmd) -> impl Future<Output = io::Result<i32>> + Send;

    /// Run capturing stdout.
    fn output(&self, cmd: &Cmd) -> impl Future<Output = io::Result<Captured>> + Send;
}

/// Spawns real processes on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    async fn status(&self, cmd: &Cmd) -> io::Result<i32> {
        let status = cmd.to_tokio().status().await?;
        Ok(exit_code(status))
    }

    async fn output(&self, cmd: &Cmd) -> io::Result<Captured> {
        let output = cmd
            .to_tokio()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(Captured {
            status: exit_code(output.status),
            stdout,
        })
    }
}

/// Exit code of a finished process. A process killed by signal N reports
/// `128 + N`, the shell convention.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Resolve `program` the way the OS would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn which(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| {
            let candidate = dir.join(program);
            let mut candidates = vec![candidate.clone()];
            if !std::env::consts::EXE_EXTENSION.is_empty() {
                candidates.push(candidate.with_extension(std::env::consts::EXE_EXTENSION));
            }
            candidates
        })
        .find(|candidate| candidate.is_file())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_display_and_accessors() {
        let cmd = Cmd::new("python")
            .args(["patch.py", "-c"])
            .arg_path(Path::new("cfg.json"))
            .dir("/tools/patcher")
            .env("RUSTC_BOOTSTRAP", "1");
        assert_eq!(cmd.to_string(), "python patch.py -c cfg.json");
        assert_eq!(cmd.get_dir(), Some(Path::new("/tools/patcher")));
        assert_eq!(cmd.get_env("RUSTC_BOOTSTRAP"), Some("1"));
        assert_eq!(cmd.get_env("HOME"), None);
    }

    #[test]
    fn test_which_nonexistent() {
        assert!(which(Path::new("definitely_not_a_real_command_12345")).is_none());
        assert!(which(Path::new("/definitely/not/here")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_which_existing() {
        assert!(which(Path::new("sh")).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_executor_exit_codes() {
        let exec = SystemExecutor;
        let status = exec.status(&Cmd::new("sh").args(["-c", "exit 3"])).await.unwrap();
        assert_eq!(status, 3);

        let status = exec.status(&Cmd::new("sh").args(["-c", "kill -SEGV $$"])).await.unwrap();
        assert_eq!(status, 0x8B);

        let captured = exec.output(&Cmd::new("sh").args(["-c", "echo version 1.2.3"])).await.unwrap();
        assert_eq!(captured.status, 0);
        assert!(captured.stdout.contains("version 1.2.3"));
    }

    #[tokio::test]
    async fn test_fake_executor_routes_statuses() {
        let exec = testing::FakeExecutor::new()
            .with_status(7)
            .with_status_for("cargo", 0)
            .failing_spawn_for("swtpm");
        assert_eq!(exec.status(&Cmd::new("cargo")).await.unwrap(), 0);
        assert_eq!(exec.status(&Cmd::new("/usr/bin/qemu")).await.unwrap(), 7);
        assert!(exec.status(&Cmd::new("swtpm")).await.is_err());
        assert_eq!(exec.calls().len(), 3);
    }
}
