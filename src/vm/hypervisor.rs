//! Provider backed by a general-purpose hypervisor: a virtual-machine
//! monitor launched as an ordinary process and configured entirely through
//! command-line arguments.
//!
//! Disk artifacts are plain images managed with the disk-image tool; there
//! is no independently startable unit behind them, so their service
//! operations are no-ops and the service half of existence is trivially
//! satisfied by the artifact. The VM's identity on a live host is the
//! monitor process whose launch arguments embed the OS disk path; liveness
//! and recovery both come from scanning the process table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::command::{CommandCapture, CommandDriver, CommandRequest, OutputParser};
use crate::error::{Error, Result};
use crate::vm::disk::{vm_dir, DiskFunction, VirtualDisk};
use crate::vm::endpoint::VmEndpoint;
use crate::vm::instance::{InstanceState, VmInstance};
use crate::vm::provider::VirtualMachine;
use crate::vm::recover;
use crate::vm::spec::VmSpec;

const CREATE_TIMEOUT_SECS: u64 = 600;
const SSH_TIMEOUT_SECS: u64 = 120;
const LIST_TIMEOUT_SECS: u64 = 30;
const STOP_WAIT: Duration = Duration::from_secs(30);

/// SSH options shared by every in-guest invocation. Guest images are
/// ephemeral, so host keys change on every fresh create.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

#[derive(Clone)]
pub struct HypervisorContext {
    pub hypervisor: String,
    pub disk_tool: String,
    pub process_lister: String,
    pub driver: Arc<dyn CommandDriver>,
    pub vms_root: PathBuf,
    pub endpoints_dir: PathBuf,
    pub scripts_root: PathBuf,
    pub guest_ready_timeout_secs: u64,
}

impl HypervisorContext {
    async fn process_table(&self) -> Result<String> {
        let capture = self
            .driver
            .run_capture(
                CommandRequest::new(self.process_lister.clone(), &["axww"])
                    .timeout_secs(LIST_TIMEOUT_SECS),
            )
            .await?;
        Ok(capture.stdout)
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

pub struct HypervisorDisk {
    ctx: HypervisorContext,
    vm_name: String,
    function: DiskFunction,
    artifact: PathBuf,
    size_gb: u64,
    ssd_required: bool,
}

impl HypervisorDisk {
    pub fn new(
        ctx: HypervisorContext,
        vm_name: &str,
        function: DiskFunction,
        size_gb: u64,
        ssd_required: bool,
    ) -> Self {
        let artifact = vm_dir(&ctx.vms_root, vm_name).join(format!("{function}.img"));
        Self { ctx, vm_name: vm_name.to_string(), function, artifact, size_gb, ssd_required }
    }

    fn seed_dir(&self) -> PathBuf {
        vm_dir(&self.ctx.vms_root, &self.vm_name).join("seed")
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.artifact.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        Ok(())
    }

    async fn disk_tool(&self, args: &[&str]) -> Result<()> {
        self.ctx
            .driver
            .run_capture(
                CommandRequest::new(self.ctx.disk_tool.clone(), args)
                    .timeout_secs(CREATE_TIMEOUT_SECS),
            )
            .await?;
        Ok(())
    }

    /// First-boot configuration equivalent to cloud-init: the public key
    /// and the init script both land in the seed the monitor attaches.
    async fn write_seed(&self, public_key: &str) -> Result<()> {
        let seed = self.seed_dir();
        tokio::fs::create_dir_all(&seed)
            .await
            .map_err(|e| Error::io(&seed, e))?;

        let init_path = self.ctx.scripts_root.join("init-hypervisor-node.sh");
        let init_body = tokio::fs::read_to_string(&init_path)
            .await
            .map_err(|_| Error::NotFound(format!("init script {}", init_path.display())))?;

        let user_data = format!(
            "#cloud-config\n\
             ssh_authorized_keys:\n  - {public_key}\n\
             write_files:\n\
             - path: /opt/clusterbox/init-node.sh\n\
             \x20 permissions: '0755'\n\
             \x20 content: |\n{}\
             runcmd:\n- [sh, /opt/clusterbox/init-node.sh]\n",
            indent(&init_body, "    "),
        );
        let user_data_path = seed.join("user-data");
        tokio::fs::write(&user_data_path, user_data)
            .await
            .map_err(|e| Error::io(&user_data_path, e))?;
        let meta_data_path = seed.join("meta-data");
        tokio::fs::write(&meta_data_path, format!("local-hostname: {}\n", self.vm_name))
            .await
            .map_err(|e| Error::io(&meta_data_path, e))?;
        Ok(())
    }
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines().map(|l| format!("{prefix}{l}\n")).collect()
}

#[async_trait]
impl VirtualDisk for HypervisorDisk {
    fn vm_name(&self) -> &str {
        &self.vm_name
    }

    fn function(&self) -> DiskFunction {
        self.function
    }

    fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    fn size_gb(&self) -> u64 {
        self.size_gb
    }

    fn ssd_required(&self) -> bool {
        self.ssd_required
    }

    async fn artifact_present(&self) -> Result<bool> {
        Ok(self.artifact.is_file())
    }

    /// No independently startable unit backs a hypervisor disk; the service
    /// half of existence is satisfied together with the artifact.
    async fn service_registered(&self) -> Result<bool> {
        self.artifact_present().await
    }

    async fn create_from_os_image(&self, base_image: &Path, public_key: &str) -> Result<()> {
        if self.exists().await? {
            return Err(Error::AlreadyExists(format!(
                "disk {} for vm `{}`",
                self.function, self.vm_name
            )));
        }
        if !base_image.is_file() {
            return Err(Error::NotFound(format!(
                "base image {} does not exist",
                base_image.display()
            )));
        }
        self.ensure_parent_dir().await?;

        let base = base_image.to_string_lossy().into_owned();
        let artifact = self.artifact.to_string_lossy().into_owned();
        self.disk_tool(&[
            "create", "-f", "qcow2", "-b", base.as_str(), "-F", "qcow2", artifact.as_str(),
        ])
        .await?;

        self.write_seed(public_key).await?;
        info!(vm = %self.vm_name, function = %self.function, "disk cloned from os image");
        Ok(())
    }

    async fn create_blank(&self) -> Result<()> {
        if self.exists().await? {
            return Err(Error::AlreadyExists(format!(
                "disk {} for vm `{}`",
                self.function, self.vm_name
            )));
        }
        self.ensure_parent_dir().await?;

        let artifact = self.artifact.to_string_lossy().into_owned();
        let size = format!("{}G", self.size_gb);
        self.disk_tool(&["create", "-f", "qcow2", artifact.as_str(), size.as_str()])
            .await?;
        info!(vm = %self.vm_name, function = %self.function, "blank disk created");
        Ok(())
    }

    async fn resize(&self, new_size_gb: u64) -> Result<()> {
        if !self.artifact_present().await? {
            return Err(Error::NotFound(format!(
                "disk {} for vm `{}`",
                self.function, self.vm_name
            )));
        }
        let artifact = self.artifact.to_string_lossy().into_owned();
        let size = format!("{new_size_gb}G");
        self.disk_tool(&["resize", artifact.as_str(), size.as_str()]).await
    }

    async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.artifact).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&self.artifact, e)),
        }
        if self.function == DiskFunction::Os {
            match tokio::fs::remove_dir_all(self.seed_dir()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(self.seed_dir(), e)),
            }
        }
        Ok(())
    }

    async fn start_service(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_service(&self) -> Result<()> {
        Ok(())
    }

    async fn is_service_running(&self) -> Result<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

pub struct HypervisorVm {
    spec: VmSpec,
    ctx: HypervisorContext,
    os_disk: HypervisorDisk,
    cluster_disk: HypervisorDisk,
    data_disk: HypervisorDisk,
    current: Option<VmInstance>,
    endpoint: Option<VmEndpoint>,
}

impl HypervisorVm {
    pub fn new(spec: VmSpec, ctx: HypervisorContext) -> Self {
        let os_disk = HypervisorDisk::new(ctx.clone(), &spec.name, DiskFunction::Os, 10, true);
        let cluster_disk = HypervisorDisk::new(
            ctx.clone(),
            &spec.name,
            DiskFunction::Cluster,
            spec.cluster_disk.size_gb,
            spec.cluster_disk.ssd_required,
        );
        let data_disk = HypervisorDisk::new(
            ctx.clone(),
            &spec.name,
            DiskFunction::Data,
            spec.data_disk.size_gb,
            spec.data_disk.ssd_required,
        );
        Self { spec, ctx, os_disk, cluster_disk, data_disk, current: None, endpoint: None }
    }

    pub fn disks(&self) -> [&dyn VirtualDisk; 3] {
        [&self.os_disk, &self.cluster_disk, &self.data_disk]
    }

    /// The monitor invocation. The OS disk path and the forwarded ports are
    /// embedded in the arguments on purpose: they are the pattern recovery
    /// matches against a live process table.
    fn launch_args(&self) -> Vec<String> {
        let ports = &self.spec.ports;
        vec![
            "-name".into(),
            self.spec.name.clone(),
            "-machine".into(),
            "virt".into(),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            self.spec.processors.to_string(),
            "-m".into(),
            self.spec.memory_gb.saturating_mul(1000).to_string(),
            "-drive".into(),
            format!("file={},if=virtio", self.os_disk.artifact_path().display()),
            "-drive".into(),
            format!("file={},if=virtio", self.cluster_disk.artifact_path().display()),
            "-drive".into(),
            format!("file={},if=virtio", self.data_disk.artifact_path().display()),
            "-netdev".into(),
            format!(
                "user,id=n0,hostfwd=tcp::{}-:22,hostfwd=tcp::{}-:6443,hostfwd=tcp::{}-:80,hostfwd=tcp::{}-:443",
                ports.ssh, ports.api, ports.http, ports.https
            ),
            "-device".into(),
            "virtio-net-pci,netdev=n0".into(),
            "-display".into(),
            "none".into(),
        ]
    }

    /// Run a command in the guest over ssh through the forwarded port.
    async fn ssh(&self, command: &str, timeout_secs: u64) -> Result<CommandCapture> {
        let port = self.spec.ports.ssh.to_string();
        let mut args: Vec<&str> = SSH_OPTS.to_vec();
        args.extend(["-p", port.as_str(), "root@127.0.0.1", command]);
        self.ctx
            .driver
            .run_capture(CommandRequest::new("ssh", &args).timeout_secs(timeout_secs))
            .await
    }

    async fn find_process(&self) -> Result<Option<recover::HypervisorProcess>> {
        let table = self.ctx.process_table().await?;
        Ok(recover::find_hypervisor_process(
            &table,
            &self.ctx.hypervisor,
            self.os_disk.artifact_path(),
        ))
    }

    async fn wait_for_guest(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.ctx.guest_ready_timeout_secs);
        loop {
            match self.ssh("true", 10).await {
                Ok(capture) if capture.exit_code == 0 => return Ok(()),
                Ok(_) | Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Ok(capture) => {
                    return Err(Error::VmOperationFailed {
                        name: self.spec.name.clone(),
                        operation: "start",
                        message: format!(
                            "guest ssh not ready within {}s (last exit {})",
                            self.ctx.guest_ready_timeout_secs, capture.exit_code
                        ),
                    })
                }
                Err(e) => {
                    return Err(Error::VmOperationFailed {
                        name: self.spec.name.clone(),
                        operation: "start",
                        message: format!(
                            "guest ssh not ready within {}s: {e}",
                            self.ctx.guest_ready_timeout_secs
                        ),
                    })
                }
            }
        }
    }

    async fn introspect_ip(&self) -> Result<String> {
        let capture = self.ssh("hostname -I", SSH_TIMEOUT_SECS).await?;
        let mut ip: Option<String> = None;
        OutputParser::new()
            .value(r"(\d+\.\d+\.\d+\.\d+)", |target: &mut Option<String>, v| {
                *target = Some(v.to_string())
            })
            .parse(&mut ip, &capture.stdout);
        ip.ok_or_else(|| Error::VmOperationFailed {
            name: self.spec.name.clone(),
            operation: "start",
            message: format!("no guest IP in `hostname -I` output: {:?}", capture.stdout),
        })
    }

    async fn introspect_credentials(&self) -> Result<String> {
        let capture = self.ssh("cat /etc/rancher/k3s/k3s.yaml", SSH_TIMEOUT_SECS).await?;
        if capture.exit_code != 0 || capture.stdout.trim().is_empty() {
            return Err(Error::VmOperationFailed {
                name: self.spec.name.clone(),
                operation: "start",
                message: "cluster credentials not readable in guest".into(),
            });
        }
        Ok(capture.stdout)
    }

    /// Rebuild a Running instance from a live monitor started by a previous
    /// run of this process. Fallible like `start_sequence` and funneled
    /// through the same Failed-instance handling.
    async fn recover_running(&mut self, instance: &mut VmInstance) -> Result<()> {
        let ip = self.introspect_ip().await?;
        let credentials = self.introspect_credentials().await?;
        instance.mark_running(ip.clone(), credentials.clone());
        self.endpoint = Some(VmEndpoint {
            vm_name: self.spec.name.clone(),
            ip,
            ports: self.spec.ports,
            credentials,
        });
        Ok(())
    }

    async fn start_sequence(&mut self, instance: &mut VmInstance) -> Result<u32> {
        for disk in [&self.os_disk, &self.cluster_disk, &self.data_disk] {
            if !disk.exists().await? {
                return Err(Error::NotFound(format!(
                    "disk {} of vm `{}` (create the VM first)",
                    disk.function(),
                    self.spec.name
                )));
            }
        }

        // Service steps are no-ops for this provider but keep the same
        // dependency order as the subsystem flavor.
        self.data_disk.start_service().await?;
        self.cluster_disk.start_service().await?;

        let args: Vec<String> = self.launch_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let pid = self
            .ctx
            .driver
            .spawn_detached(CommandRequest::new(self.ctx.hypervisor.clone(), &arg_refs))
            .await?;
        instance.service_id = pid.to_string();

        self.wait_for_guest().await?;
        let ip = self.introspect_ip().await?;
        let credentials = self.introspect_credentials().await?;
        instance.mark_running(ip.clone(), credentials.clone());

        let endpoint = VmEndpoint {
            vm_name: self.spec.name.clone(),
            ip,
            ports: self.spec.ports,
            credentials,
        };
        endpoint.save(&self.ctx.endpoints_dir).await?;
        self.endpoint = Some(endpoint);
        Ok(pid)
    }

    async fn force_kill(&self, pid: u32) {
        let pid_str = pid.to_string();
        let result = self
            .ctx
            .driver
            .run_capture(
                CommandRequest::new("kill", &["-9", pid_str.as_str()])
                    .timeout_secs(LIST_TIMEOUT_SECS),
            )
            .await;
        if let Err(e) = result {
            warn!(vm = %self.spec.name, pid, error = %e, "force kill failed");
        }
    }

    async fn wait_until_gone(&self) -> Result<bool> {
        let deadline = Instant::now() + STOP_WAIT;
        loop {
            if self.find_process().await?.is_none() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl VirtualMachine for HypervisorVm {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn spec(&self) -> &VmSpec {
        &self.spec
    }

    fn current_instance(&self) -> Option<&VmInstance> {
        self.current.as_ref()
    }

    fn current_endpoint(&self) -> Option<&VmEndpoint> {
        self.endpoint.as_ref()
    }

    async fn exists(&self) -> Result<bool> {
        for disk in self.disks() {
            if !disk.exists().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.find_process().await?.is_some())
    }

    async fn start(&mut self) -> Result<VmInstance> {
        if let Some(process) = self.find_process().await? {
            if let Some(instance) = &self.current {
                if instance.state == InstanceState::Running {
                    info!(vm = %self.spec.name, "start: already running");
                    return Ok(instance.clone());
                }
            }
            // A monitor from a previous run of this process: rebuild the
            // instance from the live guest. A failed rebuild is recorded
            // exactly like a failed cold start.
            let mut instance = VmInstance::starting(process.pid.to_string());
            return match self.recover_running(&mut instance).await {
                Ok(()) => {
                    self.current = Some(instance.clone());
                    Ok(instance)
                }
                Err(e) => {
                    instance.mark_failed(e.to_string());
                    self.current = Some(instance);
                    Err(Error::VmOperationFailed {
                        name: self.spec.name.clone(),
                        operation: "start",
                        message: e.to_string(),
                    })
                }
            };
        }

        self.spec.validate()?;
        let mut instance = VmInstance::starting("pending");

        match self.start_sequence(&mut instance).await {
            Ok(pid) => {
                info!(vm = %self.spec.name, pid, ip = ?instance.ip, "vm running");
                self.current = Some(instance.clone());
                Ok(instance)
            }
            Err(e) => {
                instance.mark_failed(e.to_string());
                self.current = Some(instance);
                Err(Error::VmOperationFailed {
                    name: self.spec.name.clone(),
                    operation: "start",
                    message: e.to_string(),
                })
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(process) = self.find_process().await? else {
            if let Some(instance) = self.current.as_mut() {
                instance.mark_stopped();
            }
            return Ok(());
        };

        if let Some(instance) = self.current.as_mut() {
            instance.mark_stopping();
        }

        let graceful = self.ssh("poweroff", LIST_TIMEOUT_SECS).await;

        // Host-side cleanup on every path.
        if let Err(e) = VmEndpoint::remove(&self.ctx.endpoints_dir, &self.spec.name).await {
            warn!(vm = %self.spec.name, error = %e, "endpoint descriptor cleanup failed");
        }
        self.endpoint = None;

        let exited = match graceful {
            // poweroff drops the connection; any exit code is acceptable as
            // long as the process actually goes away.
            Ok(_) => self.wait_until_gone().await?,
            Err(e) => {
                warn!(vm = %self.spec.name, error = %e, "graceful poweroff failed");
                false
            }
        };

        if exited {
            if let Some(instance) = self.current.as_mut() {
                instance.mark_stopped();
            }
            info!(vm = %self.spec.name, "vm stopped");
            Ok(())
        } else {
            self.force_kill(process.pid).await;
            if let Some(instance) = self.current.as_mut() {
                instance.mark_failed("graceful shutdown failed; monitor killed");
            }
            Err(Error::VmOperationFailed {
                name: self.spec.name.clone(),
                operation: "stop",
                message: "graceful shutdown failed; monitor killed".into(),
            })
        }
    }

    async fn execute_command(&self, command: &str, timeout_secs: u64) -> Result<CommandCapture> {
        self.ssh(command, timeout_secs).await
    }

    async fn delete(&mut self) -> Result<()> {
        if self.is_running().await? {
            self.stop().await?;
        }
        for disk in [&self.data_disk, &self.cluster_disk, &self.os_disk] {
            disk.delete().await?;
        }
        VmEndpoint::remove(&self.ctx.endpoints_dir, &self.spec.name).await?;
        let dir = vm_dir(&self.ctx.vms_root, &self.spec.name);
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "vm directory not removed"),
        }
        info!(vm = %self.spec.name, "vm deleted");
        Ok(())
    }
}
