//! Exit-code quirks of the emulator.

use crate::qemu::QemuVersion;

/// `STATUS_ACCESS_VIOLATION`, reported by QEMU on Windows when it tears down.
pub const ACCESS_VIOLATION: i32 = 0xC000_0005_u32 as i32;

/// 128 + SIGSEGV. QEMU 4.x segfaults on shutdown.
pub const SEGFAULT: i32 = 0x8B;

/// Status of a guest shutdown through the Q35 `isa-debug-exit` device.
/// Not remapped: with `SHUTDOWN_AFTER_RUN` the run stage fails with 33.
pub const GUEST_SHUTDOWN: i32 = 33;

/// Map known-benign emulator exit codes to success.
///
/// Without a known version only the access-violation rule applies.
/// [`GUEST_SHUTDOWN`] passes through unchanged.
pub fn normalize_exit(code: i32, version: Option<&QemuVersion>) -> i32 {
    match code {
        ACCESS_VIOLATION => 0,
        SEGFAULT if version.and_then(QemuVersion::major) == Some(4) => 0,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32) -> QemuVersion {
        QemuVersion::new(vec![major, 2, 0])
    }

    #[test]
    fn test_access_violation_always_success() {
        assert_eq!(normalize_exit(ACCESS_VIOLATION, None), 0);
        assert_eq!(normalize_exit(ACCESS_VIOLATION, Some(&v(4))), 0);
        assert_eq!(normalize_exit(ACCESS_VIOLATION, Some(&v(9))), 0);
    }

    #[test]
    fn test_segfault_only_on_v4() {
        assert_eq!(normalize_exit(SEGFAULT, Some(&v(4))), 0);
        assert_eq!(normalize_exit(SEGFAULT, Some(&v(7))), SEGFAULT);
        assert_eq!(normalize_exit(SEGFAULT, Some(&v(40))), SEGFAULT);
        assert_eq!(normalize_exit(SEGFAULT, None), SEGFAULT);
    }

    #[test]
    fn test_other_codes_unchanged() {
        assert_eq!(normalize_exit(0, None), 0);
        assert_eq!(normalize_exit(1, Some(&v(4))), 1);
    }

    #[test]
    fn test_guest_shutdown_is_not_success() {
        assert_eq!(normalize_exit(GUEST_SHUTDOWN, Some(&v(8))), GUEST_SHUTDOWN);
        assert_eq!(normalize_exit(GUEST_SHUTDOWN, Some(&v(4))), GUEST_SHUTDOWN);
        assert_eq!(normalize_exit(GUEST_SHUTDOWN, None), GUEST_SHUTDOWN);
    }
}
