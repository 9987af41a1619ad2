//! Virtual disks: one storage artifact plus an optional backing service,
//! per VM per function.
//!
//! A disk "exists" only when both halves are present — the storage artifact
//! on the host AND the backing service registration. A partial state left by
//! a previous crash is reported as absent so callers never act on a
//! half-created disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What a disk is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskFunction {
    /// Guest root filesystem and control-plane tooling.
    Os,
    /// Single-node orchestration runtime and its content-addressed image
    /// store.
    Cluster,
    /// User/application persistent storage.
    Data,
}

impl DiskFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFunction::Os => "os",
            DiskFunction::Cluster => "cluster",
            DiskFunction::Data => "data",
        }
    }

    pub const ALL: [DiskFunction; 3] = [DiskFunction::Os, DiskFunction::Cluster, DiskFunction::Data];
}

impl std::fmt::Display for DiskFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing-service name for a (vm, function) pair.
pub fn service_name(vm_name: &str, function: DiskFunction) -> String {
    format!("{vm_name}-{function}")
}

/// Directory holding all artifacts of one VM.
pub fn vm_dir(vms_root: &Path, vm_name: &str) -> PathBuf {
    vms_root.join(vm_name)
}

/// One virtual disk, implemented per provider.
///
/// Functions whose content is not reached through an independently
/// startable virtualization unit implement the service operations as
/// no-ops and report the service half as trivially registered.
#[async_trait]
pub trait VirtualDisk: Send + Sync {
    fn vm_name(&self) -> &str;
    fn function(&self) -> DiskFunction;
    /// Path of the storage artifact on the host.
    fn artifact_path(&self) -> &Path;
    fn size_gb(&self) -> u64;
    fn ssd_required(&self) -> bool;

    fn service_name(&self) -> String {
        service_name(self.vm_name(), self.function())
    }

    /// Storage-artifact half of existence.
    async fn artifact_present(&self) -> Result<bool>;
    /// Backing-service half of existence.
    async fn service_registered(&self) -> Result<bool>;

    /// Both halves required; one without the other is absent.
    async fn exists(&self) -> Result<bool> {
        Ok(self.artifact_present().await? && self.service_registered().await?)
    }

    /// Clone a base image into a new artifact, inject the public key for
    /// remote access and run the provider's init script in the guest.
    /// Fails with `AlreadyExists` if this (vm, function) already exists.
    async fn create_from_os_image(&self, base_image: &Path, public_key: &str) -> Result<()>;

    /// Create an empty artifact plus service registration, for Cluster and
    /// Data disks. Fails with `AlreadyExists` on collision.
    async fn create_blank(&self) -> Result<()>;

    /// Grow the artifact. Fails with `NotSupported` where the provider
    /// cannot do it — never a silent no-op.
    async fn resize(&self, new_size_gb: u64) -> Result<()>;

    /// Stop the backing service if any, then remove the artifact. Safe to
    /// call when already stopped or partially created.
    async fn delete(&self) -> Result<()>;

    async fn start_service(&self) -> Result<()>;
    async fn stop_service(&self) -> Result<()>;
    async fn is_service_running(&self) -> Result<bool>;
}
