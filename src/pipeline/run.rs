//! Run stage: boot the firmware under QEMU.

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::companion::{swtpm_command, CompanionHandle};
use super::console::{ConsoleGuard, ConsoleMode};
use super::exit::normalize_exit;
use crate::launch::prepare_var_store;
use crate::process::Executor;
use crate::qemu::{Architecture, LaunchSpec, QemuVersion};
use crate::settings::PipelineSettings;
use crate::Timer;

/// Run `spec` to completion and return its normalized exit status.
///
/// On SBSA with a TPM socket configured, swtpm is started alongside QEMU and
/// joined once QEMU has exited. The console is restored on every path out.
pub async fn run_emulator<E, C>(
    executor: &E,
    console: &mut C,
    settings: &PipelineSettings,
    spec: &LaunchSpec,
    version: Option<&QemuVersion>,
) -> Result<i32>
where
    E: Executor,
    C: ConsoleMode + ?Sized,
{
    info!("[3]. Running QEMU...");
    prepare_var_store(settings)?;

    let companion = match (&settings.tpm_socket, settings.arch) {
        (Some(socket), Architecture::Sbsa) => Some(CompanionHandle::spawn(
            executor.clone(),
            swtpm_command(&settings.swtpm_path, socket),
        )),
        _ => None,
    };

    let timer = Timer::start("Time to kick off QEMU");
    let status = {
        let _guard = ConsoleGuard::acquire(console);
        timer.finish();
        executor.status(&spec.to_cmd()).await
    };

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            if let Some(companion) = companion {
                companion.abort();
            }
            return Err(e).with_context(|| format!("Failed to run {}", spec.executable.display()));
        }
    };

    if let Some(companion) = companion {
        if companion.is_running() {
            warn!("Terminate the TPM emulator with Ctrl+C now");
        }
        let state = companion.join().await;
        info!("TPM emulator finished: {:?}", state);
    }

    let normalized = normalize_exit(status, version);
    if normalized != status {
        info!("QEMU exit status {:#x} treated as success", status);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::launch::compose;
    use crate::pipeline::console::testing::FakeConsole;
    use crate::pipeline::exit::{ACCESS_VIOLATION, SEGFAULT};
    use crate::process::testing::FakeExecutor;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn settings(config: MapConfig) -> PipelineSettings {
        PipelineSettings::resolve(&config, Path::new("/ws")).unwrap()
    }

    async fn run(exec: &FakeExecutor, console: &mut FakeConsole, s: &PipelineSettings, v: Option<&QemuVersion>) -> Result<i32> {
        let spec = compose(s, v).unwrap();
        run_emulator(exec, console, s, &spec, v).await
    }

    #[tokio::test]
    async fn test_exit_normalization() {
        let s = settings(MapConfig::new());
        let mut console = FakeConsole::default();
        let v4 = QemuVersion::new(vec![4, 2, 0]);
        let v8 = QemuVersion::new(vec![8, 0]);

        let exec = FakeExecutor::new().with_status(ACCESS_VIOLATION);
        assert_eq!(run(&exec, &mut console, &s, None).await.unwrap(), 0);

        let exec = FakeExecutor::new().with_status(SEGFAULT);
        assert_eq!(run(&exec, &mut console, &s, Some(&v4)).await.unwrap(), 0);
        assert_eq!(run(&exec, &mut console, &s, Some(&v8)).await.unwrap(), SEGFAULT);
        assert_eq!(run(&exec, &mut console, &s, None).await.unwrap(), SEGFAULT);

        let exec = FakeExecutor::new().with_status(3);
        assert_eq!(run(&exec, &mut console, &s, Some(&v4)).await.unwrap(), 3);
        assert_eq!(console.saves, 5);
        assert_eq!(console.restores, 5);
    }

    #[tokio::test]
    async fn test_console_restored_when_spawn_fails() {
        let s = settings(MapConfig::new());
        let mut console = FakeConsole::default();
        let exec = FakeExecutor::new().failing_spawn();
        assert!(run(&exec, &mut console, &s, None).await.is_err());
        assert_eq!(console.restores, 1);
    }

    #[tokio::test]
    async fn test_sbsa_tpm_starts_companion() {
        let s = settings(
            MapConfig::new()
                .set("PLATFORM", "SBSA")
                .set("TPM_DEV", "/tmp/tpm/sock"),
        );
        let mut console = FakeConsole::default();
        let exec = FakeExecutor::new();
        assert_eq!(run(&exec, &mut console, &s, None).await.unwrap(), 0);

        let programs: Vec<String> = exec.calls().iter().map(|c| c.program().display().to_string()).collect();
        assert!(programs.contains(&"swtpm".to_string()));
        assert!(programs.contains(&"qemu-system-aarch64".to_string()));
    }

    #[tokio::test]
    async fn test_companion_failure_does_not_abort_run() {
        let s = settings(
            MapConfig::new()
                .set("PLATFORM", "SBSA")
                .set("TPM_DEV", "/tmp/tpm/sock"),
        );
        let mut console = FakeConsole::default();
        let exec = FakeExecutor::new().failing_spawn_for("swtpm");
        assert_eq!(run(&exec, &mut console, &s, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_q35_tpm_has_no_companion() {
        let s = settings(MapConfig::new().set("TPM_DEV", "/tmp/tpm/sock"));
        let mut console = FakeConsole::default();
        let exec = FakeExecutor::new();
        run(&exec, &mut console, &s, None).await.unwrap();
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dfci_store_seeded_before_run() {
        let dir = TempDir::new().unwrap();
        let code = dir.path().join("QEMUQ35_CODE.fd");
        fs::write(&code, b"code").unwrap();
        fs::write(dir.path().join("QEMUQ35_VARS.fd"), b"vars").unwrap();
        let store = dir.path().join("dfci.fd");

        let s = PipelineSettings::resolve(
            &MapConfig::new()
                .set("PRE_COMPILED_ROM", code.display().to_string())
                .set("DFCI_VAR_STORE", store.display().to_string()),
            dir.path(),
        )
        .unwrap();
        let mut console = FakeConsole::default();
        let exec = FakeExecutor::new();
        run(&exec, &mut console, &s, None).await.unwrap();
        assert_eq!(fs::read(&store).unwrap(), b"vars");
    }
}
