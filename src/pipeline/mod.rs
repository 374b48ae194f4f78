//! Build → patch → run orchestration.
//!
//! Stages run one after another on the calling task. The first stage that
//! exits non-zero stops the pipeline and its status becomes the result.
//!
//! ```text
//! Idle → (Build)? → Patch → Run → Done
//! ```

pub mod build;
pub mod companion;
pub mod console;
pub mod exit;
pub mod patch;
pub mod run;

use std::fmt;

use anyhow::Result;
use tracing::{error, info};

use crate::launch;
use crate::process::Executor;
use crate::qemu::{query_version, LaunchSpec, QemuVersion};
use crate::settings::PipelineSettings;
use crate::Timer;

pub use companion::{CompanionHandle, CompanionState};
pub use console::{ConsoleGuard, ConsoleMode, HostConsole};
pub use exit::normalize_exit;

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Patch,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Patch => "patch",
            Stage::Run => "run",
        };
        f.write_str(name)
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Exit status of the last stage that ran.
    pub status: i32,
    /// Stage that stopped the pipeline, if any.
    pub failed: Option<Stage>,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Drives the stages for one set of settings.
pub struct Pipeline<E: Executor, C: ConsoleMode> {
    settings: PipelineSettings,
    executor: E,
    console: C,
}

impl<E: Executor, C: ConsoleMode> Pipeline<E, C> {
    pub fn new(settings: PipelineSettings, executor: E, console: C) -> Self {
        Self {
            settings,
            executor,
            console,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Stages a full run goes through.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(3);
        if self.settings.needs_build() {
            stages.push(Stage::Build);
        }
        stages.push(Stage::Patch);
        stages.push(Stage::Run);
        stages
    }

    /// Query the emulator version and compose its command line.
    ///
    /// An OS image with an unknown extension fails here, before any stage.
    pub async fn prepare(&self) -> Result<(LaunchSpec, Option<QemuVersion>)> {
        let version = query_version(&self.executor, Some(&self.settings.qemu_path)).await;
        match &version {
            Some(v) => info!("QEMU version: {}", v),
            None => info!("QEMU version unknown"),
        }
        let spec = launch::compose(&self.settings, version.as_ref())?;
        Ok((spec, version))
    }

    /// Run every stage, stopping at the first failure.
    pub async fn run(&mut self) -> Result<Outcome> {
        let (spec, version) = self.prepare().await?;

        let mut status = 0;
        for stage in self.stages() {
            status = self.run_stage(stage, &spec, version.as_ref()).await?;
            if status != 0 {
                error!("{} stage failed with exit status {}", stage, status);
                return Ok(Outcome {
                    status,
                    failed: Some(stage),
                });
            }
        }
        Ok(Outcome { status, failed: None })
    }

    /// Run only the emulator against the current firmware image.
    pub async fn run_emulator(&mut self) -> Result<Outcome> {
        let (spec, version) = self.prepare().await?;
        let status = self.run_stage(Stage::Run, &spec, version.as_ref()).await?;
        Ok(Outcome {
            status,
            failed: (status != 0).then_some(Stage::Run),
        })
    }

    async fn run_stage(&mut self, stage: Stage, spec: &LaunchSpec, version: Option<&QemuVersion>) -> Result<i32> {
        match stage {
            Stage::Build => {
                let timer = Timer::start("Build");
                let status = build::run_build(&self.executor, &self.settings).await?;
                timer.finish();
                Ok(status)
            }
            Stage::Patch => patch::run_patch(&self.executor, &self.settings).await,
            Stage::Run => {
                run::run_emulator(&self.executor, &mut self.console, &self.settings, spec, version).await
            }
        }
    }
}
