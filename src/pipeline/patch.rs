//! Patch stage: splice the EFI into the firmware image.
//!
//! The patch tool reads a reference copy of the current image and writes the
//! result over the original. The reference copy only lives for one invocation.

use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::process::{Cmd, Executor};
use crate::settings::PipelineSettings;

/// `<python> patch.py -c <config> -i <efi> -r <reference> -o <code>`, run in the patch repo.
pub fn patch_command(settings: &PipelineSettings) -> Cmd {
    Cmd::new(&settings.patch_python)
        .arg("patch.py")
        .arg("-c")
        .arg_path(&settings.patch_config)
        .arg("-i")
        .arg_path(&settings.efi_file)
        .arg("-r")
        .arg_path(&settings.firmware.reference)
        .arg("-o")
        .arg_path(&settings.firmware.code)
        .dir(&settings.fw_patch_repo)
}

/// Run the patch tool. Returns its exit status.
pub async fn run_patch<E: Executor>(executor: &E, settings: &PipelineSettings) -> Result<i32> {
    let what = if settings.custom_efi.is_some() {
        "Custom EFI"
    } else {
        "DXE Core"
    };
    info!("[2]. Patching {}...", what);

    let firmware = &settings.firmware;
    fs::copy(&firmware.code, &firmware.reference).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            firmware.code.display(),
            firmware.reference.display()
        )
    })?;

    let cmd = patch_command(settings);
    let status = executor.status(&cmd).await;

    if let Err(e) = fs::remove_file(&firmware.reference) {
        warn!("Failed to remove {}: {}", firmware.reference.display(), e);
    }

    status.with_context(|| format!("Failed to run {}", cmd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::process::testing::FakeExecutor;
    use std::path::Path;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> PipelineSettings {
        let rom = dir.path().join("QEMUQ35_CODE.fd");
        fs::write(&rom, b"firmware").unwrap();
        let config = MapConfig::new()
            .set("PRE_COMPILED_ROM", rom.display().to_string())
            .set("CUSTOM_EFI", "/tmp/app.efi")
            .set("FW_PATCH_REPO", "/tools/patcher");
        PipelineSettings::resolve(&config, dir.path()).unwrap()
    }

    #[test]
    fn test_patch_command_contract() {
        let dir = TempDir::new().unwrap();
        let settings = fixture(&dir);
        let cmd = patch_command(&settings);
        assert_eq!(cmd.program(), Path::new("python"));
        assert_eq!(
            cmd.get_args(),
            [
                "patch.py".to_string(),
                "-c".to_string(),
                "/tools/patcher/Configs/QemuQ35.json".to_string(),
                "-i".to_string(),
                "/tmp/app.efi".to_string(),
                "-r".to_string(),
                settings.firmware.reference.display().to_string(),
                "-o".to_string(),
                settings.firmware.code.display().to_string(),
            ]
        );
        assert_eq!(cmd.get_dir(), Some(Path::new("/tools/patcher")));
    }

    #[tokio::test]
    async fn test_reference_removed_after_success() {
        let dir = TempDir::new().unwrap();
        let settings = fixture(&dir);
        let exec = FakeExecutor::new();

        assert_eq!(run_patch(&exec, &settings).await.unwrap(), 0);
        assert!(!settings.firmware.reference.exists());
        assert!(settings.firmware.code.exists());
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_reference_removed_after_failure() {
        let dir = TempDir::new().unwrap();
        let settings = fixture(&dir);

        let exec = FakeExecutor::new().with_status(2);
        assert_eq!(run_patch(&exec, &settings).await.unwrap(), 2);
        assert!(!settings.firmware.reference.exists());

        let exec = FakeExecutor::new().failing_spawn();
        assert!(run_patch(&exec, &settings).await.is_err());
        assert!(!settings.firmware.reference.exists());
    }

    #[tokio::test]
    async fn test_missing_image_is_error() {
        let dir = TempDir::new().unwrap();
        let config = MapConfig::new().set("PRE_COMPILED_ROM", dir.path().join("absent.fd").display().to_string());
        let settings = PipelineSettings::resolve(&config, dir.path()).unwrap();
        let exec = FakeExecutor::new();
        assert!(run_patch(&exec, &settings).await.is_err());
        assert!(exec.calls().is_empty());
    }
}
