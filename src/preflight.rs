//! Preflight checks for a pipeline run.
//!
//! Validates the tools and inputs a run depends on BEFORE anything is built,
//! so a missing patch repo does not surface ten minutes into a cargo build.
//!
//! # Checks Performed
//!
//! - **Emulator**: the QEMU binary resolves
//! - **Firmware**: the code image exists, or the build stage can produce it
//! - **Patch tool**: `patch.py` and its config exist
//! - **DXE core**: the repo exists when the build stage will run
//! - **TPM emulator**: `swtpm` resolves when the SBSA TPM companion is configured
//! - **OS image**: the extension is one QEMU can attach

use std::path::Path;

use crate::process::which;
use crate::qemu::Architecture;
use crate::settings::PipelineSettings;

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// Not blocking, but worth a look before running.
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn marker(self) -> &'static str {
        match self {
            CheckStatus::Pass => "[OK]",
            CheckStatus::Warn => "[WARN]",
            CheckStatus::Fail => "[FAIL]",
        }
    }
}

/// One prerequisite and what was found.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    /// How to fix a failed check.
    pub suggestion: Option<String>,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            suggestion: Some(suggestion.into()),
            ..Self::new(name, CheckStatus::Fail, message)
        }
    }

    /// Warnings do not block a run.
    pub fn passed(&self) -> bool {
        self.status != CheckStatus::Fail
    }

    /// Report line, plus the suggestion when there is one.
    pub fn render(&self) -> String {
        let mut line = format!("{} {}: {}", self.status.marker(), self.name, self.message);
        if let Some(suggestion) = &self.suggestion {
            line.push_str(&format!("\n     Suggestion: {}", suggestion));
        }
        line
    }
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }

    pub fn errors(&self) -> Vec<&CheckResult> {
        self.with_status(CheckStatus::Fail)
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.with_status(CheckStatus::Warn)
    }

    fn with_status(&self, status: CheckStatus) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.status == status).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed()).count()
    }

    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    pub fn print_summary(&self) {
        println!("=== Preflight ===\n");
        for check in &self.checks {
            println!("{}", check.render());
        }

        println!();
        let warnings = self.warnings().len();
        if self.is_ok() {
            println!(
                "Ready to run: {}/{} checks passed, {} warning(s)",
                self.passed_count(),
                self.total_count(),
                warnings
            );
        } else {
            println!(
                "Not ready: {} failed, {} warning(s), {} of {} passed",
                self.errors().len(),
                warnings,
                self.passed_count(),
                self.total_count()
            );
        }
    }
}

/// Run every check that applies to `settings`.
pub fn check_all(settings: &PipelineSettings) -> PreflightReport {
    let mut checks = vec![
        check_tool("QEMU", &settings.qemu_path, "Install QEMU or set QEMU_PATH / QEMU_DIR"),
        check_firmware(settings),
        check_file(
            "Patch tool",
            &settings.fw_patch_repo.join("patch.py"),
            "Clone the firmware patcher or set FW_PATCH_REPO",
        ),
        check_file("Patch config", &settings.patch_config, "Set PATCH_CONFIG"),
    ];

    if settings.needs_build() {
        checks.push(check_dir(
            "DXE core repo",
            &settings.dxe_core_repo,
            "Clone the DXE core repo or set DXE_CORE_REPO",
        ));
    } else if let Some(efi) = &settings.custom_efi {
        checks.push(check_file("Custom EFI", efi, "Fix CUSTOM_EFI"));
    }

    if settings.arch == Architecture::Sbsa && settings.tpm_socket.is_some() {
        checks.push(check_tool("swtpm", &settings.swtpm_path, "sudo apt install swtpm"));
    }

    if let Some(image) = &settings.os_image {
        checks.push(check_os_image(image));
    }

    PreflightReport { checks }
}

fn check_tool(name: &str, program: &Path, suggestion: &str) -> CheckResult {
    match which(program) {
        Some(path) => CheckResult::pass(name, format!("Found at {}", path.display())),
        None => CheckResult::fail(name, format!("{} not found", program.display()), suggestion),
    }
}

fn check_file(name: &str, path: &Path, suggestion: &str) -> CheckResult {
    if path.is_file() {
        CheckResult::pass(name, path.display().to_string())
    } else {
        CheckResult::fail(name, format!("Missing {}", path.display()), suggestion)
    }
}

fn check_dir(name: &str, path: &Path, suggestion: &str) -> CheckResult {
    if path.is_dir() {
        CheckResult::pass(name, path.display().to_string())
    } else {
        CheckResult::fail(name, format!("Missing {}", path.display()), suggestion)
    }
}

fn check_firmware(settings: &PipelineSettings) -> CheckResult {
    let code = &settings.firmware.code;
    if code.is_file() {
        CheckResult::pass("Firmware image", code.display().to_string())
    } else if settings.needs_build() {
        // The DXE core build does not produce the firmware volume itself.
        CheckResult::warn(
            "Firmware image",
            format!("{} not built yet; the patch stage will fail without it", code.display()),
        )
    } else {
        CheckResult::fail(
            "Firmware image",
            format!("Missing {}", code.display()),
            "Build the platform firmware or set PRE_COMPILED_ROM",
        )
    }
}

fn check_os_image(image: &Path) -> CheckResult {
    let ext = image
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "iso" | "vhd" | "qcow2" => CheckResult::pass("OS image", image.display().to_string()),
        _ => CheckResult::fail(
            "OS image",
            format!("Unknown OS storage type: {}", image.display()),
            "Use an .iso, .vhd or .qcow2 image",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use std::fs;
    use tempfile::TempDir;

    fn find<'a>(report: &'a PreflightReport, name: &str) -> Option<&'a CheckResult> {
        report.checks.iter().find(|c| c.name == name)
    }

    #[test]
    fn test_check_result_constructors() {
        assert!(CheckResult::pass("t", "ok").passed());
        let fail = CheckResult::fail("t", "bad", "fix it");
        assert!(!fail.passed());
        assert_eq!(fail.suggestion.as_deref(), Some("fix it"));
    }

    #[test]
    fn test_warning_has_own_marker() {
        let warn = CheckResult::warn("Firmware image", "not built yet");
        assert!(warn.passed());
        assert_eq!(warn.status, CheckStatus::Warn);
        assert_eq!(warn.render(), "[WARN] Firmware image: not built yet");
        assert_eq!(CheckResult::pass("QEMU", "found").render(), "[OK] QEMU: found");
        assert_eq!(
            CheckResult::fail("QEMU", "missing", "install it").render(),
            "[FAIL] QEMU: missing\n     Suggestion: install it"
        );

        let report = PreflightReport {
            checks: vec![warn, CheckResult::pass("QEMU", "found")],
        };
        assert!(report.is_ok());
        assert_eq!(report.warnings().len(), 1);
        assert!(report.errors().is_empty());
    }

    #[test]
    fn test_report_counts() {
        let mut report = PreflightReport::default();
        assert!(report.is_ok());
        report.checks.push(CheckResult::pass("a", "ok"));
        report.checks.push(CheckResult::fail("b", "bad", "fix"));
        assert!(!report.is_ok());
        assert_eq!(report.passed_count(), 1);
        assert_eq!(report.total_count(), 2);
        assert_eq!(report.errors()[0].name, "b");
    }

    #[test]
    fn test_check_all_with_workspace() {
        let dir = TempDir::new().unwrap();
        let patcher = dir.path().join("patcher");
        fs::create_dir_all(patcher.join("Configs")).unwrap();
        fs::write(patcher.join("patch.py"), "").unwrap();
        fs::write(patcher.join("Configs/QemuQ35.json"), "{}").unwrap();
        let rom = dir.path().join("QEMUQ35_CODE.fd");
        fs::write(&rom, b"fw").unwrap();
        let efi = dir.path().join("app.efi");
        fs::write(&efi, b"efi").unwrap();

        let config = MapConfig::new()
            .set("FW_PATCH_REPO", patcher.display().to_string())
            .set("PRE_COMPILED_ROM", rom.display().to_string())
            .set("CUSTOM_EFI", efi.display().to_string())
            .set("QEMU_PATH", "/definitely/not/qemu")
            .set("PATH_TO_OS", "/img/disk.vmdk");
        let settings = PipelineSettings::resolve(&config, dir.path()).unwrap();
        let report = check_all(&settings);

        assert!(find(&report, "Firmware image").unwrap().passed());
        assert!(find(&report, "Patch tool").unwrap().passed());
        assert!(find(&report, "Patch config").unwrap().passed());
        assert!(find(&report, "Custom EFI").unwrap().passed());
        assert!(find(&report, "DXE core repo").is_none());
        assert!(!find(&report, "QEMU").unwrap().passed());
        assert!(!find(&report, "OS image").unwrap().passed());
        assert!(find(&report, "swtpm").is_none());
        assert_eq!(report.errors().len(), 2);
    }

    #[test]
    fn test_build_needed_checks_dxe_core() {
        let dir = TempDir::new().unwrap();
        let config = MapConfig::new()
            .set("PLATFORM", "SBSA")
            .set("TPM_DEV", "/tmp/tpm/sock")
            .set("SWTPM_PATH", "/definitely/not/swtpm");
        let settings = PipelineSettings::resolve(&config, dir.path()).unwrap();
        let report = check_all(&settings);

        assert!(!find(&report, "DXE core repo").unwrap().passed());
        assert!(!find(&report, "swtpm").unwrap().passed());
        // Missing firmware is only a warning while a build is pending.
        assert_eq!(find(&report, "Firmware image").unwrap().status, CheckStatus::Warn);
    }
}
