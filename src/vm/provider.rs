//! The provider contract both VM backends implement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::CommandCapture;
use crate::error::Result;
use crate::vm::endpoint::VmEndpoint;
use crate::vm::instance::VmInstance;
use crate::vm::spec::VmSpec;

/// Which backend a VM is configured to use. Persisted configuration only —
/// runtime dispatch goes through the [`VirtualMachine`] trait, never this
/// enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Host-integrated lightweight virtualization subsystem, driven through
    /// a distribution-manager CLI.
    Subsystem,
    /// General-purpose hypervisor launched as an ordinary process.
    Hypervisor,
}

/// One named local VM. The two providers implement this identically as far
/// as callers can observe.
///
/// Start/Stop of a given VM name are not internally synchronized: callers
/// serialize operations per name. Concurrent Start/Stop on the same name is
/// undefined by contract.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> &VmSpec;

    /// Instance created by the last `start` on this object, if any.
    fn current_instance(&self) -> Option<&VmInstance>;
    fn current_endpoint(&self) -> Option<&VmEndpoint>;

    /// Whether all three disks exist (artifact AND service for each).
    async fn exists(&self) -> Result<bool>;

    /// Live check against the OS — never trusts in-memory state alone.
    async fn is_running(&self) -> Result<bool>;

    /// Idempotent: when the VM is already running, the existing instance is
    /// returned unchanged and no second backing process is spawned. Any
    /// failure during the start sequence marks the instance `Failed` and is
    /// surfaced; a half-started VM is never exposed as Running.
    async fn start(&mut self) -> Result<VmInstance>;

    /// Idempotent when not running. Always runs host-side network cleanup,
    /// even when graceful termination fails; an unexpected termination
    /// failure falls back to a forced kill recorded as `Failed`.
    async fn stop(&mut self) -> Result<()>;

    /// Run a command inside the running guest under the engine's timeout
    /// contract, returning the drained capture.
    async fn execute_command(
        &self,
        command: &str,
        timeout_secs: u64,
    ) -> Result<CommandCapture>;

    /// Stop if running, then delete all disks and the endpoint descriptor.
    async fn delete(&mut self) -> Result<()>;
}
