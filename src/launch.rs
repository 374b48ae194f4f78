//! Turns [`PipelineSettings`] into a QEMU command line.

use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::qemu::{Architecture, LaunchBuilder, LaunchSpec, QemuVersion};
use crate::settings::{PipelineSettings, DFCI_FORWARD_PORTS};

/// Guest memory with and without an OS image to boot.
const MEMORY_WITH_OS_MB: u32 = 8192;
const MEMORY_FIRMWARE_ONLY_MB: u32 = 2048;

/// Assemble the emulator invocation for `settings`.
///
/// `version` is the queried emulator version and only feeds the SMBIOS system
/// version. Fails only on an OS image with an unknown extension.
pub fn compose(settings: &PipelineSettings, version: Option<&QemuVersion>) -> Result<LaunchSpec> {
    let arch = settings.arch;
    let mut builder = LaunchBuilder::new(&settings.qemu_path, arch);

    let memory = if settings.os_image.is_some() {
        MEMORY_WITH_OS_MB
    } else {
        MEMORY_FIRMWARE_ONLY_MB
    };

    builder
        .with_cpu(settings.cpu_model.as_deref(), settings.core_count)
        .with_machine(settings.smm_enabled, settings.accelerator.as_deref())
        .with_memory(memory)
        .with_firmware(&settings.firmware.code, Some(settings.active_var_store()));

    if let Some(rom_path) = &settings.rom_path {
        builder.with_rom_path(rom_path);
    }
    if let Some(os_image) = &settings.os_image {
        builder.with_os_storage(os_image)?;
    }

    builder.with_usb_controller().with_usb_mouse();

    match arch {
        Architecture::Q35 => {
            if let Some(dfci) = &settings.dfci_files {
                builder.with_usb_storage(dfci, Some("dfci_disk"));
            }
            if let Some(install) = &settings.install_files {
                builder.with_usb_storage(install, Some("install_disk"));
            }
        }
        Architecture::Sbsa => {
            builder.with_usb_keyboard();
        }
    }

    if let Some(drive) = &settings.virtual_drive {
        builder.with_virtual_drive(drive);
    }
    builder.with_display(!settings.headless);

    match arch {
        Architecture::Q35 => {
            let forward_ports: &[u16] = if settings.enable_network && settings.dfci_var_store.is_some() {
                DFCI_FORWARD_PORTS
            } else {
                &[]
            };
            let use_virtio = settings.boot_to_front_page || settings.alt_boot;
            builder.with_network(settings.enable_network, forward_ports, use_virtio);
        }
        Architecture::Sbsa => {
            builder.with_network(false, &[], false);
        }
    }

    let mut smbios = vec![
        ("smbios0_version", settings.firmware_version.clone()),
        ("smbios3_version", settings.boot_selection()),
    ];
    if let Some(version) = version {
        smbios.push(("smbios1_version", version.to_string()));
    }
    builder.with_smbios(smbios);

    if let Some(socket) = &settings.tpm_socket {
        builder.with_tpm(socket);
    }

    builder
        .with_gdb_server(settings.gdb_port)
        .with_serial_port(settings.serial_port, &settings.serial_logs)
        .with_monitor_port(settings.monitor_port)
        .with_shutdown_from_guest(settings.shutdown_after_run);

    let spec = builder.build();
    info!("QEMU command: {}", spec);
    Ok(spec)
}

/// Seed the DFCI variable store from the default vars image on first use.
pub fn prepare_var_store(settings: &PipelineSettings) -> Result<()> {
    let Some(store) = &settings.dfci_var_store else {
        return Ok(());
    };
    if store.is_file() {
        return Ok(());
    }
    debug!(
        "Seeding DFCI var store {} from {}",
        store.display(),
        settings.firmware.vars.display()
    );
    fs::copy(&settings.firmware.vars, store).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            settings.firmware.vars.display(),
            store.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::error::LaunchError;
    use std::path::{Path, PathBuf};

    fn settings(config: MapConfig) -> PipelineSettings {
        PipelineSettings::resolve(&config, Path::new("/ws")).unwrap()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_q35_firmware_only() {
        let spec = compose(&settings(MapConfig::new()), None).unwrap();
        assert_eq!(spec.executable, PathBuf::from("qemu-system-x86_64"));
        assert_eq!(value_after(&spec.args, "-m"), Some("2048"));
        assert_eq!(value_after(&spec.args, "-net"), Some("none"));
        assert_eq!(value_after(&spec.args, "-serial"), Some("tcp:127.0.0.1:50001,server,nowait"));
        assert_eq!(value_after(&spec.args, "-vga"), Some("cirrus"));
        assert!(!spec.args.iter().any(|a| a.starts_with("usb-kbd")));
    }

    #[test]
    fn test_os_image_bumps_memory() {
        let spec = compose(&settings(MapConfig::new().set("PATH_TO_OS", "/img/win.qcow2")), None).unwrap();
        assert_eq!(value_after(&spec.args, "-m"), Some("8192"));
        assert!(spec.args.contains(&"nvme,serial=nvme-1,drive=os_nvme".to_string()));
    }

    #[test]
    fn test_unknown_os_image_is_fatal() {
        let err = compose(&settings(MapConfig::new().set("PATH_TO_OS", "/img/disk.vmdk")), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::UnknownOsStorage(_))
        ));
    }

    #[test]
    fn test_sbsa_composition() {
        let spec = compose(
            &settings(
                MapConfig::new()
                    .set("PLATFORM", "SBSA")
                    .set("QEMU_HEADLESS", "true")
                    .set("ENABLE_NETWORK", "true")
                    .set("TPM_DEV", "/tmp/tpm/swtpm.sock"),
            ),
            Some(&QemuVersion::new(vec![9, 1, 0])),
        )
        .unwrap();
        assert_eq!(value_after(&spec.args, "-machine"), Some("sbsa-ref"));
        assert_eq!(value_after(&spec.args, "-net"), Some("none"));
        assert_eq!(value_after(&spec.args, "-display"), Some("none"));
        assert_eq!(value_after(&spec.args, "-serial"), Some("stdio"));
        assert!(spec.args.iter().any(|a| a.starts_with("usb-kbd")));
        assert!(!spec.args.iter().any(|a| a.starts_with("tpm-tis")));
        assert!(spec.args.iter().any(|a| a.contains("version=\"9.1.0\"")));
    }

    #[test]
    fn test_q35_dfci_network() {
        let spec = compose(
            &settings(
                MapConfig::new()
                    .set("ENABLE_NETWORK", "true")
                    .set("DFCI_VAR_STORE", "/tmp/dfci.fd")
                    .set("BOOT_TO_FRONT_PAGE", "true")
                    .set("SHUTDOWN_AFTER_RUN", "true")
                    .set("VERSION", "1.2.3"),
            ),
            None,
        )
        .unwrap();
        assert_eq!(
            value_after(&spec.args, "-netdev"),
            Some("user,id=net0,hostfwd=tcp::8270-:8270,hostfwd=tcp::8271-:8271")
        );
        assert!(spec.args.contains(&"virtio-net-pci,netdev=net0".to_string()));
        assert!(spec.args.contains(&"if=pflash,format=raw,unit=1,file=/tmp/dfci.fd".to_string()));
        assert!(spec.args.iter().any(|a| a.contains("version=\"1.2.3\"")));
        assert!(spec.args.iter().any(|a| a.contains("version=\"Vol+\"")));
        let exit_devices = spec
            .args
            .iter()
            .filter(|a| a.starts_with("isa-debug-exit"))
            .count();
        assert_eq!(exit_devices, 2);
    }

    #[test]
    fn test_prepare_var_store_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let fv = dir.path().join("FV");
        fs::create_dir_all(&fv).unwrap();
        fs::write(fv.join("QEMUQ35_VARS.fd"), b"vars").unwrap();
        let store = dir.path().join("dfci.fd");

        let config = MapConfig::new()
            .set("BUILD_OUTPUT_BASE", dir.path().display().to_string())
            .set("DFCI_VAR_STORE", store.display().to_string());
        let s = PipelineSettings::resolve(&config, dir.path()).unwrap();

        prepare_var_store(&s).unwrap();
        assert_eq!(fs::read(&store).unwrap(), b"vars");

        fs::write(&store, b"modified").unwrap();
        prepare_var_store(&s).unwrap();
        assert_eq!(fs::read(&store).unwrap(), b"modified");
    }
}
