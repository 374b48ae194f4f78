//! Machine topologies supported by the launcher.
//!
//! Everything that differs between Q35 and SBSA lives behind [`Platform`]. The
//! builder picks the implementation once, when it is constructed, and asks it
//! for tokens instead of branching on the architecture in every method.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::LaunchError;

use super::smbios::SmbiosFields;

/// Q35 always carries an isa-debug-exit device at this port.
pub const DEBUG_EXIT_DEVICE: &str = "isa-debug-exit,iobase=0xf4,iosize=0x04";

/// Instruction set extensions enabled on top of the Q35 CPU model.
const Q35_CPU_FEATURES: &str =
    "+rdrand,+umip,+smep,+pdpe1gb,+popcnt,+sse,+sse2,+sse3,+ssse3,+sse4.2,+sse4.1";

const Q35_DEFAULT_CPU: &str = "qemu64";

/// The two supported QEMU machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// x86_64 Q35 chipset with OVMF-style split flash.
    Q35,
    /// AArch64 SBSA reference board.
    Sbsa,
}

impl Architecture {
    /// Capability set for this architecture.
    pub fn platform(self) -> &'static dyn Platform {
        match self {
            Architecture::Q35 => &Q35,
            Architecture::Sbsa => &Sbsa,
        }
    }

    /// Default emulator binary name.
    pub fn qemu_binary(self) -> &'static str {
        match self {
            Architecture::Q35 => "qemu-system-x86_64",
            Architecture::Sbsa => "qemu-system-aarch64",
        }
    }

    /// Platform package directory under `Build/`.
    pub fn build_package(self) -> &'static str {
        match self {
            Architecture::Q35 => "QemuQ35PkgX64",
            Architecture::Sbsa => "QemuSbsaPkg",
        }
    }

    /// File name of the read-only firmware code image.
    pub fn code_image(self) -> &'static str {
        match self {
            Architecture::Q35 => "QEMUQ35_CODE.fd",
            Architecture::Sbsa => "QEMU_EFI.fd",
        }
    }

    /// File name of the writable variable store.
    pub fn vars_image(self) -> &'static str {
        match self {
            Architecture::Q35 => "QEMUQ35_VARS.fd",
            Architecture::Sbsa => "SECURE_FLASH0.fd",
        }
    }

    /// UEFI target triple the DXE core is compiled for.
    pub fn uefi_target(self) -> &'static str {
        match self {
            Architecture::Q35 => "x86_64-unknown-uefi",
            Architecture::Sbsa => "aarch64-unknown-uefi",
        }
    }

    /// Short lowercase name used by make targets and artifact names.
    pub fn slug(self) -> &'static str {
        match self {
            Architecture::Q35 => "q35",
            Architecture::Sbsa => "sbsa",
        }
    }

    /// Default patch tool configuration file name.
    pub fn patch_config(self) -> &'static str {
        match self {
            Architecture::Q35 => "QemuQ35.json",
            Architecture::Sbsa => "QemuSbsa.json",
        }
    }

    /// Toolchain used when none is configured.
    pub fn default_toolchain(self) -> &'static str {
        match self {
            Architecture::Q35 => "VS2022",
            Architecture::Sbsa => "GCC5",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Q35 => write!(f, "Q35"),
            Architecture::Sbsa => write!(f, "SBSA"),
        }
    }
}

impl FromStr for Architecture {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "Q35" => Ok(Architecture::Q35),
            "SBSA" => Ok(Architecture::Sbsa),
            _ => Err(LaunchError::invalid("PLATFORM", s, "expected Q35 or SBSA")),
        }
    }
}

/// Accelerators accepted in the Q35 machine string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Kvm,
    Tcg,
    Whpx,
}

impl Accelerator {
    /// Case-insensitive lookup. Anything outside the whitelist yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "kvm" => Some(Accelerator::Kvm),
            "tcg" => Some(Accelerator::Tcg),
            "whpx" => Some(Accelerator::Whpx),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Kvm => "kvm",
            Accelerator::Tcg => "tcg",
            Accelerator::Whpx => "whpx",
        }
    }
}

/// Per-architecture device topology.
pub trait Platform: Send + Sync {
    fn architecture(&self) -> Architecture;

    /// Tokens injected when the builder is created.
    fn baseline_args(&self) -> &'static [&'static str];

    /// Value of `-machine`.
    fn machine(&self, smm_enabled: bool, accel: Option<Accelerator>) -> String;

    /// Value of `-cpu`.
    fn cpu(&self, model: Option<&str>) -> String;

    /// `-drive` values for the flash units, in unit order.
    fn firmware_drives(&self, code: &Path, vars: Option<&Path>) -> Vec<String>;

    /// Tokens attaching a non-ISO OS disk image.
    fn os_disk_args(&self, image: &Path, format: &str) -> Vec<String>;

    /// TPM interface device, if the platform declares one.
    fn tpm_device(&self) -> Option<&'static str>;

    /// Tokens for an enabled display.
    fn display_args(&self) -> &'static [&'static str];

    /// NIC model used when virtio is not requested.
    fn legacy_nic(&self) -> &'static str {
        "e1000"
    }

    /// Guest-initiated shutdown device, if available.
    fn shutdown_device(&self) -> Option<&'static str>;

    fn smbios_defaults(&self) -> SmbiosFields;
}

/// Intel Q35 chipset.
pub struct Q35;

impl Platform for Q35 {
    fn architecture(&self) -> Architecture {
        Architecture::Q35
    }

    fn baseline_args(&self) -> &'static [&'static str] {
        &[
            "-debugcon",
            "stdio",
            "-global",
            "ICH9-LPC.disable_s3=1",
            "-global",
            "isa-debugcon.iobase=0x402",
            "-device",
            DEBUG_EXIT_DEVICE,
        ]
    }

    fn machine(&self, smm_enabled: bool, accel: Option<Accelerator>) -> String {
        let smm = if smm_enabled { "on" } else { "off" };
        match accel {
            Some(accel) => format!("q35,smm={},accel={}", smm, accel.as_str()),
            None => format!("q35,smm={}", smm),
        }
    }

    fn cpu(&self, model: Option<&str>) -> String {
        format!("{},{}", model.unwrap_or(Q35_DEFAULT_CPU), Q35_CPU_FEATURES)
    }

    fn firmware_drives(&self, code: &Path, vars: Option<&Path>) -> Vec<String> {
        let mut drives = vec![format!(
            "if=pflash,format=raw,unit=0,file={},readonly=on",
            code.display()
        )];
        if let Some(vars) = vars {
            drives.push(format!("if=pflash,format=raw,unit=1,file={}", vars.display()));
        }
        drives
    }

    fn os_disk_args(&self, image: &Path, format: &str) -> Vec<String> {
        vec![
            "-drive".into(),
            format!("file={},format={},if=none,id=os_nvme", image.display(), format),
            "-device".into(),
            "nvme,serial=nvme-1,drive=os_nvme".into(),
        ]
    }

    fn tpm_device(&self) -> Option<&'static str> {
        Some("tpm-tis,tpmdev=tpm0")
    }

    fn display_args(&self) -> &'static [&'static str] {
        &["-vga", "cirrus"]
    }

    fn shutdown_device(&self) -> Option<&'static str> {
        Some(DEBUG_EXIT_DEVICE)
    }

    fn smbios_defaults(&self) -> SmbiosFields {
        SmbiosFields::for_board("patina-q35-patched", "QEMU Q35", "40-41-42-43", "Q35")
    }
}

/// Arm SBSA reference platform.
pub struct Sbsa;

impl Platform for Sbsa {
    fn architecture(&self) -> Architecture {
        Architecture::Sbsa
    }

    fn baseline_args(&self) -> &'static [&'static str] {
        &[]
    }

    fn machine(&self, _smm_enabled: bool, _accel: Option<Accelerator>) -> String {
        "sbsa-ref".to_string()
    }

    fn cpu(&self, _model: Option<&str>) -> String {
        "max,sve=off,sme=off".to_string()
    }

    // Unit 0 is the secure variable flash, unit 1 the read-only code.
    fn firmware_drives(&self, code: &Path, vars: Option<&Path>) -> Vec<String> {
        let mut drives = Vec::with_capacity(2);
        if let Some(vars) = vars {
            drives.push(format!("if=pflash,format=raw,unit=0,file={}", vars.display()));
        }
        drives.push(format!(
            "if=pflash,format=raw,unit=1,file={},readonly=on",
            code.display()
        ));
        drives
    }

    fn os_disk_args(&self, image: &Path, format: &str) -> Vec<String> {
        vec![
            "-drive".into(),
            format!("file={},format={},if=none,id=os_disk", image.display(), format),
            "-device".into(),
            "ahci,id=ahci".into(),
            "-device".into(),
            "ide-hd,drive=os_disk,bus=ahci.0".into(),
        ]
    }

    // SBSA attaches the TPM backend only, with no interface device.
    fn tpm_device(&self) -> Option<&'static str> {
        None
    }

    fn display_args(&self) -> &'static [&'static str] {
        &[]
    }

    fn shutdown_device(&self) -> Option<&'static str> {
        None
    }

    fn smbios_defaults(&self) -> SmbiosFields {
        SmbiosFields::for_board("patina-sbsa-patched", "QEMU SBSA", "42-42-42-42", "SBSA")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_from_str() {
        assert_eq!("q35".parse::<Architecture>().unwrap(), Architecture::Q35);
        assert_eq!(" SBSA ".parse::<Architecture>().unwrap(), Architecture::Sbsa);
        assert!("riscv".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_accelerator_whitelist() {
        assert_eq!(Accelerator::parse("KVM"), Some(Accelerator::Kvm));
        assert_eq!(Accelerator::parse("Whpx"), Some(Accelerator::Whpx));
        assert_eq!(Accelerator::parse("hvf"), None);
        assert_eq!(Accelerator::parse(""), None);
    }

    #[test]
    fn test_platform_matches_architecture() {
        for arch in [Architecture::Q35, Architecture::Sbsa] {
            assert_eq!(arch.platform().architecture(), arch);
        }
    }

    #[test]
    fn test_sbsa_has_no_shutdown_device() {
        assert!(Architecture::Sbsa.platform().shutdown_device().is_none());
        assert!(Architecture::Q35.platform().shutdown_device().is_some());
    }
}
