//! clusterbox: lifecycle management for a local single-node cluster VM.
//!
//! Turns a declarative hardware/software specification into a running,
//! reachable virtual machine hosting a single-node container-orchestration
//! cluster, on whichever virtualization the host offers: a lightweight
//! virtualization subsystem or a general-purpose hypervisor.
//!
//! The crate is organised around five parts:
//!
//! - [`command`]: process/script execution with safe output capture under
//!   timeout, plus a declarative regex output-parsing mini-language.
//! - [`planner`]: evaluates a VM spec against host telemetry, producing
//!   minimum/recommended/maximum tiers.
//! - [`vm`]: virtual disks, the VM state machine, two provider backends,
//!   and the manager that reconciles configuration against the host.
//! - [`telemetry`]: the numeric hardware facts the planner consumes.
//! - Ambient pieces: [`error`], [`logging`], [`paths`], [`settings`].

pub mod command;
pub mod error;
pub mod logging;
pub mod paths;
pub mod planner;
pub mod settings;
pub mod telemetry;
pub mod vm;

pub use error::{Error, Result};
