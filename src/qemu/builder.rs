//! QEMU command line builder.
//!
//! [`LaunchBuilder`] accumulates an ordered list of QEMU arguments for one
//! architecture. Most methods configure a single feature and are idempotent:
//! the first call wins and later calls are logged and ignored, which lets
//! callers apply overrides first and defaults after. Arguments are only ever
//! appended.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::{debug, error, info};

use crate::error::LaunchError;
use crate::process::Cmd;

use super::arch::{Accelerator, Architecture, Platform};

/// Default bind address for TCP endpoints (GDB, serial, monitor).
pub const LOCALHOST: &str = "127.0.0.1";

bitflags! {
    /// Features already applied to a builder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Applied: u16 {
        const ROM_PATH = 1 << 0;
        const MACHINE = 1 << 1;
        const CPU = 1 << 2;
        const FIRMWARE = 1 << 3;
        const USB_CONTROLLER = 1 << 4;
        const USB_MOUSE = 1 << 5;
        const USB_KEYBOARD = 1 << 6;
        const MEMORY = 1 << 7;
        const NETWORK = 1 << 8;
        const SMBIOS = 1 << 9;
        const TPM = 1 << 10;
        const DISPLAY = 1 << 11;
        const GDB_SERVER = 1 << 12;
        const SERIAL_PORT = 1 << 13;
        const MONITOR_PORT = 1 << 14;
    }
}

/// Finished command: executable plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Convert into a runnable command.
    pub fn to_cmd(&self) -> Cmd {
        Cmd::new(&self.executable).args(&self.args)
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Builder for QEMU command lines.
pub struct LaunchBuilder {
    executable: PathBuf,
    platform: &'static dyn Platform,
    args: Vec<String>,
    applied: Applied,
    usb_storage_index: u32,
}

fn is_empty(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

impl LaunchBuilder {
    pub fn new(executable: impl Into<PathBuf>, arch: Architecture) -> Self {
        let platform = arch.platform();
        Self {
            executable: executable.into(),
            platform,
            args: platform.baseline_args().iter().map(|s| s.to_string()).collect(),
            applied: Applied::empty(),
            usb_storage_index: 0,
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.platform.architecture()
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Mark `feature` applied. Returns false when it already was.
    fn claim(&mut self, feature: Applied, what: &str) -> bool {
        if self.applied.contains(feature) {
            debug!("{} already configured, skipping", what);
            return false;
        }
        self.applied.insert(feature);
        true
    }

    fn push<S: Into<String>>(&mut self, flag: &str, value: S) {
        self.args.push(flag.to_string());
        self.args.push(value.into());
    }

    /// Directory QEMU searches for option ROMs and firmware blobs.
    pub fn with_rom_path(&mut self, rom_dir: impl AsRef<Path>) -> &mut Self {
        let rom_dir = rom_dir.as_ref();
        if self.applied.contains(Applied::ROM_PATH) {
            debug!("ROM path already added, skipping");
            return self;
        }
        if is_empty(rom_dir) {
            return self;
        }
        self.applied.insert(Applied::ROM_PATH);
        debug!("Setting ROM path to: {}", rom_dir.display());
        self.push("-L", rom_dir.display().to_string());
        self
    }

    /// Machine type. Unrecognized accelerators are dropped.
    pub fn with_machine(&mut self, smm_enabled: bool, accel: Option<&str>) -> &mut Self {
        if !self.claim(Applied::MACHINE, "Machine") {
            return self;
        }
        let accel = accel.and_then(Accelerator::parse);
        let machine = self.platform.machine(smm_enabled, accel);
        self.push("-machine", machine);
        if smm_enabled {
            self.push("-global", "driver=cfi.pflash01,property=secure,value=on");
        }
        self
    }

    pub fn with_cpu(&mut self, model: Option<&str>, core_count: Option<u32>) -> &mut Self {
        if !self.claim(Applied::CPU, "CPU") {
            return self;
        }
        let cpu = self.platform.cpu(model);
        self.push("-cpu", cpu);
        if let Some(cores) = core_count.filter(|&n| n > 0) {
            self.push("-smp", cores.to_string());
        }
        self
    }

    /// Flash units for the firmware code and variable store.
    pub fn with_firmware(&mut self, code: impl AsRef<Path>, vars: Option<&Path>) -> &mut Self {
        let code = code.as_ref();
        if self.applied.contains(Applied::FIRMWARE) {
            debug!("Firmware already configured, skipping");
            return self;
        }
        if is_empty(code) {
            return self;
        }
        self.applied.insert(Applied::FIRMWARE);
        let vars = vars.filter(|v| !is_empty(v));
        debug!(
            "Configuring firmware - CODE: {}, VARS: {:?}",
            code.display(),
            vars.map(Path::display).map(|d| d.to_string())
        );
        for drive in self.platform.firmware_drives(code, vars) {
            self.push("-drive", drive);
        }
        self
    }

    pub fn with_usb_controller(&mut self) -> &mut Self {
        if self.claim(Applied::USB_CONTROLLER, "USB controller") {
            self.push("-device", "qemu-xhci,id=usb");
        }
        self
    }

    pub fn with_usb_mouse(&mut self) -> &mut Self {
        if self.claim(Applied::USB_MOUSE, "USB mouse") {
            self.push("-device", "usb-mouse,id=input0,bus=usb.0,port=1");
        }
        self
    }

    pub fn with_usb_keyboard(&mut self) -> &mut Self {
        if self.claim(Applied::USB_KEYBOARD, "USB keyboard") {
            self.push("-device", "usb-kbd,id=input1,bus=usb.0,port=2");
        }
        self
    }

    /// Raw-format USB mass storage. See [`Self::with_usb_storage_as`].
    pub fn with_usb_storage(&mut self, drive: impl AsRef<Path>, id: Option<&str>) -> &mut Self {
        self.with_usb_storage_as(drive, id, "raw")
    }

    /// USB mass storage backed by a disk image or a host directory.
    ///
    /// May be called any number of times. Without an `id` one is generated
    /// (`usb_storage_0`, `usb_storage_1`, ...). Paths that are neither a file
    /// nor a directory are ignored.
    pub fn with_usb_storage_as(
        &mut self,
        drive: impl AsRef<Path>,
        id: Option<&str>,
        format: &str,
    ) -> &mut Self {
        let drive = drive.as_ref();
        if is_empty(drive) {
            return self;
        }

        let id = match id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let id = format!("usb_storage_{}", self.usb_storage_index);
                self.usb_storage_index += 1;
                id
            }
        };

        debug!(
            "Adding USB storage device: {} (id={}, format={})",
            drive.display(),
            id,
            format
        );

        let file = if drive.is_file() {
            drive.display().to_string()
        } else if drive.is_dir() {
            format!("fat:rw:{}", drive.display())
        } else {
            return self;
        };

        self.push(
            "-drive",
            format!("file={},format={},media=disk,if=none,id={}", file, format, id),
        );
        self.push("-device", format!("usb-storage,bus=usb.0,drive={}", id));
        self
    }

    /// Mount a disk image as virtio block device, or a directory as FAT.
    pub fn with_virtual_drive(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref();
        if is_empty(path) {
            return self;
        }

        if path.is_file() {
            debug!("Mounting virtual drive file: {}", path.display());
            self.push("-drive", format!("file={},if=virtio", path.display()));
        } else if path.is_dir() {
            debug!("Mounting virtual drive directory as FAT filesystem: {}", path.display());
            self.push("-drive", format!("file=fat:rw:{},format=raw,media=disk", path.display()));
        } else {
            error!(
                "Virtual drive path is invalid (not a file or directory): {}",
                path.display()
            );
        }
        self
    }

    /// Guest memory in megabytes.
    pub fn with_memory(&mut self, size_mb: u32) -> &mut Self {
        if self.claim(Applied::MEMORY, "Memory") {
            self.push("-m", size_mb.to_string());
        }
        self
    }

    /// Attach the OS image: `.vhd` (raw), `.qcow2` or `.iso`.
    ///
    /// Any other extension is an error and leaves the builder untouched.
    pub fn with_os_storage(&mut self, image: impl AsRef<Path>) -> Result<&mut Self, LaunchError> {
        let image = image.as_ref();
        if is_empty(image) {
            return Ok(self);
        }
        debug!("Configuring OS storage: {}", image.display());

        let extension = image
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase().replace('"', ""))
            .unwrap_or_default();

        match extension.as_str() {
            "iso" => self.push("-cdrom", image.display().to_string()),
            "vhd" => self.args.extend(self.platform.os_disk_args(image, "raw")),
            "qcow2" => self.args.extend(self.platform.os_disk_args(image, "qcow2")),
            _ => return Err(LaunchError::UnknownOsStorage(image.to_path_buf())),
        }
        Ok(self)
    }

    /// User-mode networking, or none at all.
    ///
    /// Each forwarded port maps host:port to guest:port over TCP.
    pub fn with_network(&mut self, enabled: bool, forward_ports: &[u16], use_virtio: bool) -> &mut Self {
        if !self.claim(Applied::NETWORK, "Network") {
            return self;
        }
        if !enabled {
            debug!("Networking disabled");
            self.push("-net", "none");
            return self;
        }

        let mut netdev = String::from("user,id=net0");
        if !forward_ports.is_empty() {
            debug!("Configuring port forwarding: {:?}", forward_ports);
        }
        for port in forward_ports {
            netdev.push_str(&format!(",hostfwd=tcp::{}-:{}", port, port));
        }
        self.push("-netdev", netdev);

        let nic = if use_virtio {
            "virtio-net-pci"
        } else {
            self.platform.legacy_nic()
        };
        self.push("-device", format!("{},netdev=net0", nic));
        self
    }

    /// SMBIOS type 0/1/3 tables. `overrides` win key by key over the
    /// architecture defaults.
    pub fn with_smbios<K, V>(&mut self, overrides: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        if !self.claim(Applied::SMBIOS, "SMBIOS") {
            return self;
        }
        let mut fields = self.platform.smbios_defaults();
        fields.merge(overrides);
        self.args.extend(fields.to_args());
        self
    }

    /// Emulated TPM reachable through a swtpm control socket.
    pub fn with_tpm(&mut self, socket: impl AsRef<Path>) -> &mut Self {
        let socket = socket.as_ref();
        if self.applied.contains(Applied::TPM) {
            debug!("TPM already configured, skipping");
            return self;
        }
        if is_empty(socket) {
            return self;
        }
        self.applied.insert(Applied::TPM);
        self.push("-chardev", format!("socket,id=chrtpm,path={}", socket.display()));
        self.push("-tpmdev", "emulator,id=tpm0,chardev=chrtpm");
        if let Some(device) = self.platform.tpm_device() {
            self.push("-device", device);
        }
        self
    }

    pub fn with_display(&mut self, enabled: bool) -> &mut Self {
        if !self.claim(Applied::DISPLAY, "Display") {
            return self;
        }
        if !enabled {
            debug!("Display disabled (headless mode)");
            self.push("-display", "none");
        } else {
            self.args
                .extend(self.platform.display_args().iter().map(|s| s.to_string()));
        }
        self
    }

    pub fn with_gdb_server(&mut self, port: Option<u16>) -> &mut Self {
        self.with_gdb_server_at(port, LOCALHOST)
    }

    pub fn with_gdb_server_at(&mut self, port: Option<u16>, ip: &str) -> &mut Self {
        if self.applied.contains(Applied::GDB_SERVER) {
            debug!("GDB server already configured, skipping");
            return self;
        }
        if let Some(port) = port.filter(|&p| p != 0) {
            self.applied.insert(Applied::GDB_SERVER);
            info!("Enabling GDB server on tcp:{}:{}", ip, port);
            self.push("-gdb", format!("tcp:{}:{}", ip, port));
        }
        self
    }

    pub fn with_serial_port(&mut self, port: Option<u16>, log_files: &[PathBuf]) -> &mut Self {
        self.with_serial_port_at(port, log_files, LOCALHOST)
    }

    /// Serial console on a TCP server socket, or on stdio plus log files.
    pub fn with_serial_port_at(&mut self, port: Option<u16>, log_files: &[PathBuf], ip: &str) -> &mut Self {
        if !self.claim(Applied::SERIAL_PORT, "Serial port") {
            return self;
        }
        match port.filter(|&p| p != 0) {
            Some(port) => self.push("-serial", format!("tcp:{}:{},server,nowait", ip, port)),
            None => {
                self.push("-serial", "stdio");
                for log in log_files {
                    self.push("-serial", format!("file:{}", log.display()));
                }
            }
        }
        self
    }

    pub fn with_monitor_port(&mut self, port: Option<u16>) -> &mut Self {
        self.with_monitor_port_at(port, LOCALHOST)
    }

    pub fn with_monitor_port_at(&mut self, port: Option<u16>, ip: &str) -> &mut Self {
        if self.applied.contains(Applied::MONITOR_PORT) {
            debug!("Monitor port already configured, skipping");
            return self;
        }
        if let Some(port) = port.filter(|&p| p != 0) {
            self.applied.insert(Applied::MONITOR_PORT);
            self.push("-monitor", format!("tcp:{}:{},server,nowait", ip, port));
        }
        self
    }

    /// Let the guest power off QEMU through isa-debug-exit (Q35 only).
    pub fn with_shutdown_from_guest(&mut self, enabled: bool) -> &mut Self {
        if enabled {
            if let Some(device) = self.platform.shutdown_device() {
                self.push("-device", device);
            }
        }
        self
    }

    /// Append arguments verbatim.
    pub fn with_custom<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Snapshot of the accumulated command.
    pub fn build(&self) -> LaunchSpec {
        LaunchSpec {
            executable: self.executable.clone(),
            args: self.args.clone(),
        }
    }
}

impl fmt::Display for LaunchBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.build(), f)
    }
}
