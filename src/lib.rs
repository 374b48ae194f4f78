//! Firmware build → patch → QEMU boot runner.
//!
//! Builds the DXE core, splices it into a platform firmware image and boots
//! the result under QEMU (Q35 or SBSA).
//!
//! # Layout
//!
//! - [`qemu`]: command-line builder, per-machine platforms, version query
//! - [`launch`]: turns [`settings::PipelineSettings`] into a QEMU command line
//! - [`pipeline`]: build, patch and run stages plus the orchestrator
//! - [`config`] / [`settings`]: layered configuration and its resolved form
//! - [`preflight`]: checks run before anything expensive starts

pub mod config;
pub mod error;
pub mod launch;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod settings;
pub mod timer;

pub use error::LaunchError;
pub use timer::Timer;
