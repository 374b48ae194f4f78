//! QEMU version probing.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, error};

use crate::process::{Cmd, Executor};

/// Dotted version reported by `qemu-system-* --version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QemuVersion {
    components: Vec<u32>,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"version\s*(\d+(?:\.\d+)*)").expect("static regex"))
}

impl QemuVersion {
    pub fn new(components: Vec<u32>) -> Self {
        Self { components }
    }

    /// Parse the first `version X.Y.Z` in `output`.
    pub fn parse(output: &str) -> Option<Self> {
        let captures = version_pattern().captures(output)?;
        let components = captures[1]
            .split('.')
            .map(str::parse)
            .collect::<Result<Vec<u32>, _>>()
            .ok()?;
        Some(Self { components })
    }

    pub fn components(&self) -> &[u32] {
        &self.components
    }

    pub fn major(&self) -> Option<u32> {
        self.components.first().copied()
    }
}

impl fmt::Display for QemuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Ask `executable` for its version.
///
/// Returns `None` when there is no executable, it cannot be started, exits
/// non-zero or prints nothing that looks like a version.
pub async fn query_version<E: Executor>(executor: &E, executable: Option<&Path>) -> Option<QemuVersion> {
    let executable = executable.filter(|p| !p.as_os_str().is_empty())?;
    let cmd = Cmd::new(executable).arg("--version");

    let captured = match executor.output(&cmd).await {
        Ok(captured) => captured,
        Err(e) => {
            debug!("Could not query {}: {}", executable.display(), e);
            return None;
        }
    };

    if captured.status != 0 {
        error!("{}", captured.stdout);
        error!("{} --version exited with {}", executable.display(), captured.status);
        return None;
    }

    let version = QemuVersion::parse(&captured.stdout);
    debug!("Detected QEMU version: {:?}", version.as_ref().map(ToString::to_string));
    version
}
