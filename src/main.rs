//! fwrun CLI
//!
//! Builds the DXE core, patches it into the platform firmware and boots the
//! result under QEMU.
//!
//! # Usage
//!
//! ```bash
//! # Build, patch and boot Q35
//! fwrun pipeline
//!
//! # SBSA release build with a local crate patch
//! fwrun pipeline --platform sbsa --build-target release --crate-patch ../patina
//!
//! # Boot the current firmware image without rebuilding
//! fwrun run --os ~/images/windows.qcow2
//!
//! # Print the QEMU command line a run would use
//! fwrun command --set QEMU_HEADLESS=true
//!
//! # Check prerequisites
//! fwrun preflight
//! ```
//!
//! Settings come from, highest priority first: `--set`, command flags,
//! `--config <file.toml>`, then `FWRUN_*` environment variables.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fwrun::config::{EnvConfig, LayeredConfig, MapConfig};
use fwrun::pipeline::{HostConsole, Pipeline};
use fwrun::preflight;
use fwrun::process::SystemExecutor;
use fwrun::qemu::query_version;
use fwrun::settings::PipelineSettings;
use fwrun::Timer;

#[derive(Parser)]
#[command(name = "fwrun")]
#[command(author, version, about = "Build, patch and boot DXE core firmware under QEMU", long_about = None)]
struct Cli {
    /// Flat TOML table of settings
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override a setting, e.g. --set QEMU_HEADLESS=true (repeatable)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    overrides: Vec<(String, String)>,

    /// Directory relative defaults are resolved against [default: current directory]
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the DXE core, patch it into the firmware and boot QEMU
    Pipeline(SettingArgs),

    /// Boot QEMU with the current firmware image
    Run(SettingArgs),

    /// Print the QEMU command line
    Command(SettingArgs),

    /// Print the QEMU version
    Version(SettingArgs),

    /// Check prerequisites and print a report
    Preflight(SettingArgs),
}

#[derive(Args, Default)]
struct SettingArgs {
    /// Q35 or SBSA
    #[arg(long)]
    platform: Option<String>,

    /// DEBUG or RELEASE
    #[arg(long)]
    build_target: Option<String>,

    #[arg(long)]
    toolchain: Option<String>,

    /// OS image to boot (.iso, .vhd, .qcow2)
    #[arg(long)]
    os: Option<PathBuf>,

    #[arg(long)]
    serial_port: Option<u16>,

    #[arg(long)]
    gdb_port: Option<u16>,

    #[arg(long)]
    monitor_port: Option<u16>,

    /// Cargo features for the DXE core build
    #[arg(long)]
    features: Option<String>,

    /// Local crate to patch into the DXE core build (repeatable)
    #[arg(long)]
    crate_patch: Vec<PathBuf>,

    /// Patch tool configuration
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Firmware image to patch instead of the build output
    #[arg(long)]
    pre_compiled_rom: Option<PathBuf>,

    /// EFI to patch in instead of building the DXE core
    #[arg(long)]
    custom_efi: Option<PathBuf>,

    #[arg(long)]
    fw_patch_repo: Option<PathBuf>,

    #[arg(long)]
    dxe_core_repo: Option<PathBuf>,

    #[arg(long)]
    qemu_path: Option<PathBuf>,

    /// Run QEMU without a display
    #[arg(long)]
    headless: bool,
}

impl SettingArgs {
    /// Flags given on the command line, as config keys.
    fn overlay(&self) -> MapConfig {
        let mut map = MapConfig::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                map.insert(key, value);
            }
        };
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

        put("PLATFORM", self.platform.clone());
        put("BUILD_TARGET", self.build_target.clone());
        put("TOOLCHAIN", self.toolchain.clone());
        put("PATH_TO_OS", path(&self.os));
        put("SERIAL_PORT", self.serial_port.map(|p| p.to_string()));
        put("GDB_SERVER", self.gdb_port.map(|p| p.to_string()));
        put("MONITOR_PORT", self.monitor_port.map(|p| p.to_string()));
        put("FEATURES", self.features.clone());
        put("PATCH_CONFIG", path(&self.config_file));
        put("PRE_COMPILED_ROM", path(&self.pre_compiled_rom));
        put("CUSTOM_EFI", path(&self.custom_efi));
        put("FW_PATCH_REPO", path(&self.fw_patch_repo));
        put("DXE_CORE_REPO", path(&self.dxe_core_repo));
        put("QEMU_PATH", path(&self.qemu_path));
        if !self.crate_patch.is_empty() {
            let patches: Vec<String> = self.crate_patch.iter().map(|p| p.display().to_string()).collect();
            put("CRATE_PATCHES", Some(patches.join(",")));
        }
        if self.headless {
            put("QEMU_HEADLESS", Some("true".to_string()));
        }
        map
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_ascii_uppercase(), value.to_string()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::Pipeline(args) => cmd_pipeline(resolve_settings(&cli, args)?).await,
        Commands::Run(args) => cmd_run(resolve_settings(&cli, args)?).await,
        Commands::Command(args) => cmd_command(resolve_settings(&cli, args)?).await,
        Commands::Version(args) => cmd_version(resolve_settings(&cli, args)?).await,
        Commands::Preflight(args) => cmd_preflight(resolve_settings(&cli, args)?),
    }
}

fn resolve_settings(cli: &Cli, args: &SettingArgs) -> Result<PipelineSettings> {
    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let mut overrides = MapConfig::new();
    for (key, value) in &cli.overrides {
        overrides.insert(key.clone(), value.clone());
    }

    let mut layers = LayeredConfig::new().with(overrides).with(args.overlay());
    if let Some(path) = &cli.config {
        layers = layers.with(MapConfig::load(path)?);
    }
    let layers = layers.with(EnvConfig::default());

    let settings = PipelineSettings::resolve(&layers, &workspace)?;
    Ok(settings)
}

async fn cmd_pipeline(settings: PipelineSettings) -> Result<i32> {
    let total = Timer::start("Total");
    let mut pipeline = Pipeline::new(settings, SystemExecutor, HostConsole::new());
    let outcome = pipeline.run().await?;
    total.finish();
    Ok(outcome.status)
}

async fn cmd_run(settings: PipelineSettings) -> Result<i32> {
    let mut pipeline = Pipeline::new(settings, SystemExecutor, HostConsole::new());
    let outcome = pipeline.run_emulator().await?;
    Ok(outcome.status)
}

async fn cmd_command(settings: PipelineSettings) -> Result<i32> {
    let pipeline = Pipeline::new(settings, SystemExecutor, HostConsole::new());
    let (spec, _) = pipeline.prepare().await?;
    println!("{}", spec);
    Ok(0)
}

async fn cmd_version(settings: PipelineSettings) -> Result<i32> {
    match query_version(&SystemExecutor, Some(&settings.qemu_path)).await {
        Some(version) => {
            println!("{} {}", settings.qemu_path.display(), version);
            Ok(0)
        }
        None => {
            println!("{}: version unknown", settings.qemu_path.display());
            Ok(1)
        }
    }
}

fn cmd_preflight(settings: PipelineSettings) -> Result<i32> {
    let report = preflight::check_all(&settings);
    report.print_summary();
    Ok(if report.is_ok() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwrun::config::ConfigProvider;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("qemu_headless=true").unwrap(),
            ("QEMU_HEADLESS".to_string(), "true".to_string())
        );
        assert_eq!(parse_key_value("FEATURES=a=b").unwrap().1, "a=b");
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_overlay_keys() {
        let args = SettingArgs {
            platform: Some("sbsa".to_string()),
            crate_patch: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            headless: true,
            serial_port: Some(1234),
            ..Default::default()
        };
        let map = args.overlay();
        assert_eq!(map.value("PLATFORM").as_deref(), Some("sbsa"));
        assert_eq!(map.value("CRATE_PATCHES").as_deref(), Some("/a,/b"));
        assert_eq!(map.value("QEMU_HEADLESS").as_deref(), Some("true"));
        assert_eq!(map.value("SERIAL_PORT").as_deref(), Some("1234"));
        assert_eq!(map.value("PATH_TO_OS"), None);
    }

    #[test]
    fn test_set_beats_flags() {
        let cli = Cli::parse_from([
            "fwrun",
            "--workspace",
            "/ws",
            "command",
            "--platform",
            "q35",
            "--set",
            "PLATFORM=SBSA",
        ]);
        let Commands::Command(args) = &cli.command else {
            panic!("expected command");
        };
        let settings = resolve_settings(&cli, args).unwrap();
        assert_eq!(settings.arch, fwrun::qemu::Architecture::Sbsa);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
