//! Create/find/list/delete plus reconciliation of configured VMs against
//! what is actually on disk and registered with the OS.
//!
//! The manager holds no persistent bookkeeping of its own. Everything it
//! reports is re-derived from the filesystem and the OS on each call, which
//! is what lets a restarted managing process pick up a VM another run
//! created or left running.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::planner;
use crate::telemetry::HostTelemetry;
use crate::vm::disk::DiskFunction;
use crate::vm::hypervisor::{HypervisorContext, HypervisorVm};
use crate::vm::provider::{ProviderKind, VirtualMachine};
use crate::vm::spec::VmSpec;
use crate::vm::subsystem::{SubsystemContext, SubsystemVm};

/// Observed condition of one disk of one configured VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskReport {
    pub function: DiskFunction,
    pub artifact_present: bool,
    pub service_registered: bool,
}

/// Result of reconciling one configured VM against the host. Partial
/// states (artifact without service or the reverse) are reported rather
/// than papered over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub name: String,
    pub disks: Vec<DiskReport>,
    pub exists: bool,
    pub running: bool,
}

/// Provider wiring for constructing VMs. Exactly one backend is active per
/// manager; the kind is persisted configuration, never runtime dispatch.
#[derive(Clone)]
pub enum ProviderContext {
    Subsystem(SubsystemContext),
    Hypervisor(HypervisorContext),
}

impl ProviderContext {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderContext::Subsystem(_) => ProviderKind::Subsystem,
            ProviderContext::Hypervisor(_) => ProviderKind::Hypervisor,
        }
    }
}

pub struct VmManager {
    provider: ProviderContext,
    vms_root: PathBuf,
}

impl VmManager {
    pub fn new(provider: ProviderContext, vms_root: impl Into<PathBuf>) -> Self {
        Self { provider, vms_root: vms_root.into() }
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Build the lifecycle object for a spec without touching the host.
    pub fn vm(&self, spec: VmSpec) -> Box<dyn VirtualMachine> {
        match &self.provider {
            ProviderContext::Subsystem(ctx) => Box::new(SubsystemVm::new(spec, ctx.clone())),
            ProviderContext::Hypervisor(ctx) => Box::new(HypervisorVm::new(spec, ctx.clone())),
        }
    }

    /// Provision all three disks of a new VM.
    ///
    /// The host is vetted by the planner first; an unsupported host is an
    /// error here, not a warning. Disk creation fans out as independent
    /// tasks, all are awaited, then each result is inspected — one disk
    /// failing never cancels its siblings mid-write.
    pub async fn create(
        &self,
        spec: VmSpec,
        host: &HostTelemetry,
        base_image: &Path,
        public_key: &str,
    ) -> Result<Box<dyn VirtualMachine>> {
        spec.validate()?;
        let verdict = planner::evaluate(&spec, host);
        if !verdict.supported {
            return Err(Error::InvalidSpec(format!(
                "host cannot support vm `{}`: {}",
                spec.name, verdict.reason
            )));
        }

        match &self.provider {
            ProviderContext::Subsystem(ctx) => {
                let vm = SubsystemVm::new(spec, ctx.clone());
                self.provision(vm.name(), vm.disks(), base_image, public_key).await?;
                Ok(Box::new(vm))
            }
            ProviderContext::Hypervisor(ctx) => {
                let vm = HypervisorVm::new(spec, ctx.clone());
                self.provision(vm.name(), vm.disks(), base_image, public_key).await?;
                Ok(Box::new(vm))
            }
        }
    }

    /// Find a configured VM on this host. Existence means every disk has
    /// both its artifact and its backing service; a half-created leftover
    /// from a crash reads as absent.
    pub async fn find(&self, spec: VmSpec) -> Result<Option<Box<dyn VirtualMachine>>> {
        let vm = self.vm(spec);
        if vm.exists().await? {
            Ok(Some(vm))
        } else {
            Ok(None)
        }
    }

    /// Names of VMs that have a directory under the VM root. A name here
    /// does not imply full existence; pair with [`VmManager::reconcile`].
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.vms_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(Error::io(&self.vms_root, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&self.vms_root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| Error::io(entry.path(), e))?
                .is_dir();
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Stop (if running) and remove a VM, its disks, and its endpoint.
    pub async fn delete(&self, spec: VmSpec) -> Result<()> {
        let mut vm = self.vm(spec);
        vm.delete().await
    }

    /// Compare each configured spec against the host: per-disk artifact and
    /// service presence, plus liveness of the backing process or service.
    pub async fn reconcile(&self, specs: &[VmSpec]) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            let report = match &self.provider {
                ProviderContext::Subsystem(ctx) => {
                    let vm = SubsystemVm::new(spec.clone(), ctx.clone());
                    self.report_for(&name, vm.disks(), &vm).await?
                }
                ProviderContext::Hypervisor(ctx) => {
                    let vm = HypervisorVm::new(spec.clone(), ctx.clone());
                    self.report_for(&name, vm.disks(), &vm).await?
                }
            };
            if !report.exists {
                warn!(vm = %report.name, "reconcile: vm incomplete on this host");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Fan-out/fan-in disk provisioning. All three tasks run to completion
    /// regardless of sibling failures; the aggregate verdict comes from
    /// inspecting every result afterwards.
    async fn provision(
        &self,
        name: &str,
        disks: [&dyn crate::vm::disk::VirtualDisk; 3],
        base_image: &Path,
        public_key: &str,
    ) -> Result<()> {
        let [os, cluster, data] = disks;
        let vm_exists = os.exists().await?
            && cluster.exists().await?
            && data.exists().await?;
        if vm_exists {
            return Err(Error::AlreadyExists(format!("vm `{name}`")));
        }

        let tasks = vec![
            os.create_from_os_image(base_image, public_key),
            cluster.create_blank(),
            data.create_blank(),
        ];
        let results = join_all(tasks).await;

        let mut failures = Vec::new();
        for (disk, result) in [os, cluster, data].into_iter().zip(results) {
            if let Err(e) = result {
                failures.push(format!("{} disk: {e}", disk.function()));
            }
        }
        if !failures.is_empty() {
            return Err(Error::VmOperationFailed {
                name: name.to_string(),
                operation: "create",
                message: failures.join("; "),
            });
        }
        info!(vm = %name, "vm created");
        Ok(())
    }

    async fn report_for(
        &self,
        name: &str,
        disks: [&dyn crate::vm::disk::VirtualDisk; 3],
        vm: &dyn VirtualMachine,
    ) -> Result<ReconcileReport> {
        let mut disk_reports = Vec::with_capacity(disks.len());
        let mut exists = true;
        for disk in disks {
            let artifact_present = disk.artifact_present().await?;
            let service_registered = disk.service_registered().await?;
            exists &= artifact_present && service_registered;
            disk_reports.push(DiskReport {
                function: disk.function(),
                artifact_present,
                service_registered,
            });
        }
        let running = vm.is_running().await?;
        Ok(ReconcileReport {
            name: name.to_string(),
            disks: disk_reports,
            exists,
            running,
        })
    }
}
