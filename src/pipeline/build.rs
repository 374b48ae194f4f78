//! Build stage: compile the DXE core with `cargo make`.

use anyhow::{Context, Result};
use tracing::info;

use crate::process::{Cmd, Executor};
use crate::settings::{BuildTarget, PipelineSettings};

const UNSTABLE_FLAG: &str = "-Zunstable-options";

/// `cargo [-Zunstable-options] -C <repo> make <target> [--crate-patch <p>]... [--features <f>]`
pub fn build_command(settings: &PipelineSettings) -> Cmd {
    let make_target = match settings.build_target {
        BuildTarget::Debug => settings.arch.slug().to_string(),
        BuildTarget::Release => format!("{}-release", settings.arch.slug()),
    };

    let mut cmd = Cmd::new("cargo");
    if settings.unstable_options {
        // -C needs nightly cargo features; RUSTC_BOOTSTRAP unlocks them on stable.
        cmd = cmd.arg(UNSTABLE_FLAG).env("RUSTC_BOOTSTRAP", "1");
    }
    cmd = cmd
        .arg("-C")
        .arg_path(&settings.dxe_core_repo)
        .arg("make")
        .arg(make_target);

    for patch in &settings.crate_patches {
        cmd = cmd.arg("--crate-patch").arg_path(patch);
    }
    if let Some(features) = &settings.features {
        cmd = cmd.arg("--features").arg(features);
    }
    cmd
}

/// Run the build. Returns the exit status of cargo.
pub async fn run_build<E: Executor>(executor: &E, settings: &PipelineSettings) -> Result<i32> {
    let cmd = build_command(settings);
    info!("[1]. Building DXE core...");
    info!("  {}", cmd);
    executor
        .status(&cmd)
        .await
        .with_context(|| format!("Failed to run {}", cmd.program().display()))
}
