//! QEMU command construction for UEFI firmware.
//!
//! - [`LaunchBuilder`] - idempotent, architecture-aware argument builder
//! - [`Architecture`] / [`Platform`] - Q35 vs SBSA device topology
//! - [`query_version`] - `--version` query feeding exit-code quirks

mod arch;
mod builder;
mod smbios;
mod version;

pub use arch::{Accelerator, Architecture, Platform, Q35, Sbsa, DEBUG_EXIT_DEVICE};
pub use builder::{Applied, LaunchBuilder, LaunchSpec, LOCALHOST};
pub use smbios::{SmbiosFields, SMBIOS_KEYS};
pub use version::{query_version, QemuVersion};
