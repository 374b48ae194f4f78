//! Resolved pipeline settings.
//!
//! Read once from a [`ConfigProvider`] when a run starts and immutable after
//! that. Every key is optional; missing keys take the defaults below.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{ConfigProvider, ConfigReader};
use crate::error::LaunchError;
use crate::qemu::Architecture;

/// Q35 keeps a serial port open by default so a debugger can attach later.
pub const DEFAULT_SERIAL_PORT: u16 = 50001;

/// Host ports forwarded to the guest when DFCI networking is in use.
pub const DFCI_FORWARD_PORTS: &[u16] = &[8270, 8271];

/// Firmware build flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    Debug,
    Release,
}

impl BuildTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildTarget::Debug => "DEBUG",
            BuildTarget::Release => "RELEASE",
        }
    }

    /// Cargo profile directory name.
    pub fn profile_dir(self) -> &'static str {
        match self {
            BuildTarget::Debug => "debug",
            BuildTarget::Release => "release",
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildTarget {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(BuildTarget::Debug),
            "RELEASE" => Ok(BuildTarget::Release),
            _ => Err(LaunchError::invalid("BUILD_TARGET", s, "expected DEBUG or RELEASE")),
        }
    }
}

/// Firmware images the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareLayout {
    /// Read-only code image; patched in place.
    pub code: PathBuf,
    /// Variable store handed to QEMU.
    pub vars: PathBuf,
    /// Scratch copy of `code` used as the patch reference.
    pub reference: PathBuf,
}

/// Everything one pipeline run needs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub arch: Architecture,
    pub build_target: BuildTarget,
    pub toolchain: String,
    pub workspace: PathBuf,

    // Build
    pub dxe_core_repo: PathBuf,
    pub crate_patches: Vec<PathBuf>,
    pub features: Option<String>,
    pub unstable_options: bool,

    // Patch
    pub fw_patch_repo: PathBuf,
    pub patch_config: PathBuf,
    pub patch_python: String,
    pub custom_efi: Option<PathBuf>,
    pub efi_file: PathBuf,
    pub firmware: FirmwareLayout,
    /// DFCI variable store replacing `firmware.vars` (Q35).
    pub dfci_var_store: Option<PathBuf>,

    // Run
    pub qemu_path: PathBuf,
    pub rom_path: Option<PathBuf>,
    pub os_image: Option<PathBuf>,
    pub virtual_drive: Option<PathBuf>,
    pub dfci_files: Option<PathBuf>,
    pub install_files: Option<PathBuf>,
    pub serial_port: Option<u16>,
    pub serial_logs: Vec<PathBuf>,
    pub gdb_port: Option<u16>,
    pub monitor_port: Option<u16>,
    pub accelerator: Option<String>,
    pub cpu_model: Option<String>,
    pub core_count: Option<u32>,
    pub smm_enabled: bool,
    pub headless: bool,
    pub enable_network: bool,
    pub boot_to_front_page: bool,
    pub alt_boot: bool,
    /// Q35 guest shutdown device. QEMU then exits with status 33, which the
    /// run stage reports as a failure.
    pub shutdown_after_run: bool,
    pub tpm_socket: Option<PathBuf>,
    pub swtpm_path: PathBuf,
    pub firmware_version: String,
}

impl PipelineSettings {
    /// Resolve settings from `provider`. Relative defaults hang off `workspace`.
    pub fn resolve(provider: &dyn ConfigProvider, workspace: &Path) -> Result<Self, LaunchError> {
        let cfg = ConfigReader::new(provider);

        let arch = match cfg.string("PLATFORM") {
            Some(p) => p.parse()?,
            None => Architecture::Q35,
        };
        let build_target = match cfg.string("BUILD_TARGET") {
            Some(t) => t.parse()?,
            None => BuildTarget::Debug,
        };
        let mut toolchain = cfg
            .string_or("TOOLCHAIN", arch.default_toolchain())
            .to_ascii_uppercase();
        if arch == Architecture::Sbsa && toolchain == "VS2022" {
            toolchain = arch.default_toolchain().to_string();
        }

        let dxe_core_repo = cfg
            .path("DXE_CORE_REPO")
            .unwrap_or_else(|| workspace.join("../dxe-core-qemu"));
        let fw_patch_repo = cfg
            .path("FW_PATCH_REPO")
            .unwrap_or_else(|| workspace.join("../fw-patcher"));
        let patch_config = cfg
            .path("PATCH_CONFIG")
            .unwrap_or_else(|| fw_patch_repo.join("Configs").join(arch.patch_config()));

        let custom_efi = cfg.path("CUSTOM_EFI");
        let efi_file = custom_efi.clone().unwrap_or_else(|| {
            dxe_core_repo
                .join("target")
                .join(arch.uefi_target())
                .join(build_target.profile_dir())
                .join(format!("qemu_{}_dxe_core.efi", arch.slug()))
        });

        let firmware = firmware_layout(&cfg, arch, build_target, &toolchain, workspace);

        let qemu_dir = cfg.path("QEMU_DIR");
        let qemu_path = match (cfg.path("QEMU_PATH"), &qemu_dir) {
            (Some(path), _) => path,
            (None, Some(dir)) => dir.join(arch.qemu_binary()),
            (None, None) => PathBuf::from(arch.qemu_binary()),
        };
        let rom_path = qemu_dir.map(|dir| dir.join("share"));

        let serial_port = match cfg.port("SERIAL_PORT")? {
            Some(port) => Some(port),
            None if arch == Architecture::Q35 => Some(DEFAULT_SERIAL_PORT),
            None => None,
        };

        Ok(Self {
            arch,
            build_target,
            toolchain,
            workspace: workspace.to_path_buf(),
            dxe_core_repo,
            crate_patches: cfg.list("CRATE_PATCHES").into_iter().map(PathBuf::from).collect(),
            features: cfg.string("FEATURES"),
            unstable_options: cfg.flag("UNSTABLE_OPTIONS", true),
            fw_patch_repo,
            patch_config,
            patch_python: cfg.string_or("PATCH_PYTHON", "python"),
            custom_efi,
            efi_file,
            firmware,
            dfci_var_store: cfg.path("DFCI_VAR_STORE"),
            qemu_path,
            rom_path,
            os_image: cfg.path("PATH_TO_OS"),
            virtual_drive: cfg.path("VIRTUAL_DRIVE_PATH"),
            dfci_files: cfg.path("DFCI_FILES"),
            install_files: cfg.path("INSTALL_FILES"),
            serial_port,
            serial_logs: cfg.list("SERIAL_LOG_FILES").into_iter().map(PathBuf::from).collect(),
            gdb_port: cfg.port("GDB_SERVER")?,
            monitor_port: cfg.port("MONITOR_PORT")?,
            accelerator: cfg.string("QEMU_ACCEL"),
            cpu_model: cfg.string("CPU_MODEL"),
            core_count: cfg.number("QEMU_CORE_NUM")?,
            smm_enabled: cfg.flag("SMM_ENABLED", true),
            headless: cfg.flag("QEMU_HEADLESS", false),
            enable_network: cfg.flag("ENABLE_NETWORK", false),
            boot_to_front_page: cfg.flag("BOOT_TO_FRONT_PAGE", false),
            alt_boot: cfg.flag("ALT_BOOT_ENABLE", false),
            shutdown_after_run: cfg.flag("SHUTDOWN_AFTER_RUN", false),
            tpm_socket: cfg.path("TPM_DEV"),
            swtpm_path: cfg.path("SWTPM_PATH").unwrap_or_else(|| PathBuf::from("swtpm")),
            firmware_version: cfg.string_or("VERSION", "Unknown"),
        })
    }

    /// The build stage is skipped when a custom EFI replaces the DXE core.
    pub fn needs_build(&self) -> bool {
        self.custom_efi.is_none()
    }

    /// Variable store QEMU actually gets.
    pub fn active_var_store(&self) -> &Path {
        self.dfci_var_store.as_deref().unwrap_or(&self.firmware.vars)
    }

    /// `Vol+` / `Vol-` markers reported in the chassis version string.
    pub fn boot_selection(&self) -> String {
        let mut selection = String::new();
        if self.boot_to_front_page {
            selection.push_str("Vol+");
        }
        if self.alt_boot {
            selection.push_str("Vol-");
        }
        selection
    }
}

fn firmware_layout(
    cfg: &ConfigReader<'_>,
    arch: Architecture,
    target: BuildTarget,
    toolchain: &str,
    workspace: &Path,
) -> FirmwareLayout {
    let fv_dir = match cfg.path("BUILD_OUTPUT_BASE") {
        Some(base) => base.join("FV"),
        None => workspace
            .join("Build")
            .join(arch.build_package())
            .join(format!("{}_{}", target, toolchain))
            .join("FV"),
    };

    let code = cfg
        .path("PRE_COMPILED_ROM")
        .unwrap_or_else(|| fv_dir.join(arch.code_image()));
    let vars = code
        .parent()
        .map(|dir| dir.join(arch.vars_image()))
        .unwrap_or_else(|| PathBuf::from(arch.vars_image()));
    let reference = code.with_extension("ref.fd");

    FirmwareLayout { code, vars, reference }
}
