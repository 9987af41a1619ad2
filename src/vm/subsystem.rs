//! Provider backed by the host-integrated lightweight virtualization
//! subsystem, driven entirely through its distribution-manager CLI.
//!
//! Every disk function is a separately registered distribution named
//! `<vm>-<function>`; the artifact is the distribution's backing image
//! under the VM directory. Starting a distribution is an exec through the
//! CLI; terminating it is the CLI's terminate verb. Liveness is always
//! re-derived from the CLI's running-listing, never from memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::command::{CommandCapture, CommandDriver, CommandRequest, OutputEncoding, OutputParser};
use crate::error::{Error, Result};
use crate::vm::disk::{service_name, vm_dir, DiskFunction, VirtualDisk};
use crate::vm::endpoint::VmEndpoint;
use crate::vm::instance::{InstanceState, VmInstance};
use crate::vm::provider::VirtualMachine;
use crate::vm::recover;
use crate::vm::spec::VmSpec;

const CREATE_TIMEOUT_SECS: u64 = 600;
const EXEC_TIMEOUT_SECS: u64 = 120;
const LIST_TIMEOUT_SECS: u64 = 30;

/// Shared wiring for everything the subsystem provider runs.
#[derive(Clone)]
pub struct SubsystemContext {
    pub cli: String,
    pub port_proxy_tool: String,
    pub encoding: OutputEncoding,
    pub driver: Arc<dyn CommandDriver>,
    pub vms_root: PathBuf,
    pub endpoints_dir: PathBuf,
    pub scripts_root: PathBuf,
}

impl SubsystemContext {
    fn cli_request(&self, args: &[&str], timeout_secs: u64) -> CommandRequest {
        CommandRequest::new(self.cli.clone(), args)
            .timeout_secs(timeout_secs)
            .encoding(self.encoding)
    }

    async fn list_registered(&self) -> Result<String> {
        let capture = self
            .driver
            .run_capture(self.cli_request(&["--list", "--all", "--verbose"], LIST_TIMEOUT_SECS))
            .await?;
        Ok(capture.stdout)
    }

    async fn list_running(&self) -> Result<String> {
        let capture = self
            .driver
            .run_capture(self.cli_request(&["--list", "--running", "--verbose"], LIST_TIMEOUT_SECS))
            .await?;
        Ok(capture.stdout)
    }

    /// Run a shell command inside a registered distribution.
    async fn exec_in(&self, service: &str, shell_command: &str, timeout_secs: u64) -> Result<CommandCapture> {
        self.driver
            .run_capture(self.cli_request(
                &["-d", service, "sh", "-c", shell_command],
                timeout_secs,
            ))
            .await
    }

    /// Run a CLI verb and require a clean exit.
    async fn run_checked(&self, args: &[&str], timeout_secs: u64) -> Result<()> {
        let capture = self
            .driver
            .run_capture(self.cli_request(args, timeout_secs))
            .await?;
        if capture.exit_code != 0 {
            return Err(Error::CommandReportedError {
                command: self.cli.clone(),
                exit_code: capture.exit_code,
                stderr: capture.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

pub struct SubsystemDisk {
    ctx: SubsystemContext,
    vm_name: String,
    function: DiskFunction,
    artifact: PathBuf,
    size_gb: u64,
    ssd_required: bool,
    /// Host-side init script run inside the guest after an OS-image create.
    init_script: Option<String>,
}

impl SubsystemDisk {
    pub fn new(
        ctx: SubsystemContext,
        vm_name: &str,
        function: DiskFunction,
        size_gb: u64,
        ssd_required: bool,
    ) -> Self {
        let artifact = vm_dir(&ctx.vms_root, vm_name).join(format!("{function}.vhdx"));
        Self {
            ctx,
            vm_name: vm_name.to_string(),
            function,
            artifact,
            size_gb,
            ssd_required,
            init_script: match function {
                DiskFunction::Os => Some("init-subsystem-node.sh".to_string()),
                _ => None,
            },
        }
    }

    async fn register(&self) -> Result<()> {
        let service = self.service_name();
        let artifact = self.artifact.to_string_lossy().into_owned();
        self.ctx
            .run_checked(
                &["--import-in-place", service.as_str(), artifact.as_str()],
                CREATE_TIMEOUT_SECS,
            )
            .await
    }

    async fn ensure_absent_or_fail(&self) -> Result<()> {
        if self.exists().await? {
            return Err(Error::AlreadyExists(format!(
                "disk {} for vm `{}`",
                self.function, self.vm_name
            )));
        }
        // A half-created leftover from a crash is reclaimed, not an error.
        if self.artifact_present().await? || self.service_registered().await? {
            warn!(vm = %self.vm_name, function = %self.function,
                  "reclaiming half-created disk");
            self.delete().await?;
        }
        Ok(())
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.artifact.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualDisk for SubsystemDisk {
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

    async fn service_registered(&self) -> Result<bool> {
        let listing = self.ctx.list_registered().await?;
        Ok(recover::find_service(&listing, &self.service_name()).is_some())
    }

    async fn create_from_os_image(&self, base_image: &Path, public_key: &str) -> Result<()> {
        self.ensure_absent_or_fail().await?;
        if !base_image.is_file() {
            return Err(Error::NotFound(format!(
                "base image {} does not exist",
                base_image.display()
            )));
        }
        self.ensure_parent_dir().await?;
        tokio::fs::copy(base_image, &self.artifact)
            .await
            .map_err(|e| Error::io(&self.artifact, e))?;

        self.register().await?;

        // Key injection first so the init script can already rely on remote
        // access being possible.
        let inject = format!(
            "mkdir -p /root/.ssh && chmod 700 /root/.ssh && \
             printf '%s\\n' '{key}' >> /root/.ssh/authorized_keys && \
             chmod 600 /root/.ssh/authorized_keys",
            key = public_key.replace('\'', "'\\''"),
        );
        self.ctx
            .exec_in(&self.service_name(), &inject, EXEC_TIMEOUT_SECS)
            .await?;

        if let Some(script) = &self.init_script {
            let path = self.ctx.scripts_root.join(script);
            let body = tokio::fs::read_to_string(&path)
                .await
                .map_err(|_| Error::NotFound(format!("init script {}", path.display())))?;
            self.ctx
                .exec_in(&self.service_name(), &body, CREATE_TIMEOUT_SECS)
                .await?;
        }

        // Provisioning booted the distribution; a freshly created VM must
        // read as stopped until its first start.
        self.stop_service().await?;

        info!(vm = %self.vm_name, function = %self.function, "disk created from os image");
        Ok(())
    }

    async fn create_blank(&self) -> Result<()> {
        self.ensure_absent_or_fail().await?;
        self.ensure_parent_dir().await?;

        // Sparse artifact; real blocks are consumed as the guest writes.
        let file = tokio::fs::File::create(&self.artifact)
            .await
            .map_err(|e| Error::io(&self.artifact, e))?;
        file.set_len(self.size_gb * 1_000_000_000)
            .await
            .map_err(|e| Error::io(&self.artifact, e))?;

        self.register().await?;
        info!(vm = %self.vm_name, function = %self.function, "blank disk created");
        Ok(())
    }

    async fn resize(&self, _new_size_gb: u64) -> Result<()> {
        Err(Error::NotSupported(
            "the subsystem provider cannot resize a registered distribution image".into(),
        ))
    }

    async fn delete(&self) -> Result<()> {
        // Service teardown first; both steps tolerate already-gone state.
        if self.service_registered().await? {
            let service = self.service_name();
            let _ = self
                .ctx
                .driver
                .run_capture(
                    self.ctx.cli_request(&["--terminate", service.as_str()], LIST_TIMEOUT_SECS),
                )
                .await;
            self.ctx
                .run_checked(&["--unregister", service.as_str()], EXEC_TIMEOUT_SECS)
                .await?;
        }
        match tokio::fs::remove_file(&self.artifact).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.artifact, e)),
        }
    }

    async fn start_service(&self) -> Result<()> {
        // Exec of a trivial command boots the distribution if needed.
        self.ctx
            .exec_in(&self.service_name(), "true", EXEC_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    async fn stop_service(&self) -> Result<()> {
        let service = self.service_name();
        self.ctx
            .run_checked(&["--terminate", service.as_str()], EXEC_TIMEOUT_SECS)
            .await
    }

    async fn is_service_running(&self) -> Result<bool> {
        let listing = self.ctx.list_running().await?;
        Ok(recover::service_is_running(&listing, &self.service_name()))
    }
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

pub struct SubsystemVm {
    spec: VmSpec,
    ctx: SubsystemContext,
    os_disk: SubsystemDisk,
    cluster_disk: SubsystemDisk,
    data_disk: SubsystemDisk,
    current: Option<VmInstance>,
    endpoint: Option<VmEndpoint>,
}

impl SubsystemVm {
    pub fn new(spec: VmSpec, ctx: SubsystemContext) -> Self {
        // The OS disk is mandatory even though the subsystem boots the
        // distribution itself; its registration is the VM's identity.
        let os_disk = SubsystemDisk::new(ctx.clone(), &spec.name, DiskFunction::Os, 10, true);
        let cluster_disk = SubsystemDisk::new(
            ctx.clone(),
            &spec.name,
            DiskFunction::Cluster,
            spec.cluster_disk.size_gb,
            spec.cluster_disk.ssd_required,
        );
        let data_disk = SubsystemDisk::new(
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

    fn os_service(&self) -> String {
        service_name(&self.spec.name, DiskFunction::Os)
    }

    async fn introspect_ip(&self) -> Result<String> {
        let capture = self
            .ctx
            .exec_in(&self.os_service(), "hostname -I", EXEC_TIMEOUT_SECS)
            .await?;
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
        let capture = self
            .ctx
            .exec_in(
                &self.os_service(),
                "cat /etc/rancher/k3s/k3s.yaml",
                EXEC_TIMEOUT_SECS,
            )
            .await?;
        if capture.exit_code != 0 || capture.stdout.trim().is_empty() {
            return Err(Error::VmOperationFailed {
                name: self.spec.name.clone(),
                operation: "start",
                message: "cluster credentials not readable in guest".into(),
            });
        }
        Ok(capture.stdout)
    }

    async fn add_port_forwards(&self, guest_ip: &str) -> Result<()> {
        for port in [self.spec.ports.api, self.spec.ports.http, self.spec.ports.https] {
            let listen = format!("listenport={port}");
            let addr = format!("connectaddress={guest_ip}");
            let connect = format!("connectport={port}");
            self.ctx
                .driver
                .run_capture(
                    CommandRequest::new(
                        self.ctx.port_proxy_tool.clone(),
                        &[
                            "interface",
                            "portproxy",
                            "add",
                            "v4tov4",
                            listen.as_str(),
                            addr.as_str(),
                            connect.as_str(),
                        ],
                    )
                    .timeout_secs(LIST_TIMEOUT_SECS),
                )
                .await?;
        }
        Ok(())
    }

    /// Best-effort teardown of the forwarding created at start. Runs on
    /// every stop path, including failed ones.
    async fn remove_port_forwards(&self) {
        for port in [self.spec.ports.api, self.spec.ports.http, self.spec.ports.https] {
            let listen = format!("listenport={port}");
            let result = self
                .ctx
                .driver
                .run_capture(
                    CommandRequest::new(
                        self.ctx.port_proxy_tool.clone(),
                        &["interface", "portproxy", "delete", "v4tov4", listen.as_str()],
                    )
                    .timeout_secs(LIST_TIMEOUT_SECS),
                )
                .await;
            if let Err(e) = result {
                warn!(vm = %self.spec.name, port, error = %e, "port-forward cleanup failed");
            }
        }
    }

    /// Rebuild a Running instance from the live guest, for a VM started by a
    /// previous run of this process. Fallible like `start_sequence` and
    /// funneled through the same Failed-instance handling.
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

    /// The fallible middle of `start`; any error here is converted into a
    /// Failed instance by the caller.
    async fn start_sequence(&mut self, instance: &mut VmInstance) -> Result<()> {
        for disk in [&self.os_disk, &self.cluster_disk, &self.data_disk] {
            if !disk.exists().await? {
                return Err(Error::NotFound(format!(
                    "disk {} of vm `{}` (create the VM first)",
                    disk.function(),
                    self.spec.name
                )));
            }
        }

        // Dependency order: data, then the cluster disk's orchestrator,
        // then the OS distribution itself.
        self.data_disk.start_service().await?;
        self.cluster_disk.start_service().await?;
        self.os_disk.start_service().await?;

        let ip = self.introspect_ip().await?;
        let credentials = self.introspect_credentials().await?;
        self.add_port_forwards(&ip).await?;

        instance.mark_running(ip.clone(), credentials.clone());

        let endpoint = VmEndpoint {
            vm_name: self.spec.name.clone(),
            ip,
            ports: self.spec.ports,
            credentials,
        };
        endpoint.save(&self.ctx.endpoints_dir).await?;
        self.endpoint = Some(endpoint);
        Ok(())
    }
}

#[async_trait]
impl VirtualMachine for SubsystemVm {
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
        let listing = self.ctx.list_running().await?;
        Ok(recover::service_is_running(&listing, &self.os_service()))
    }

    async fn start(&mut self) -> Result<VmInstance> {
        if self.is_running().await? {
            if let Some(instance) = &self.current {
                if instance.state == InstanceState::Running {
                    info!(vm = %self.spec.name, "start: already running");
                    return Ok(instance.clone());
                }
            }
            // Running but unknown to this process: rebuild the instance from
            // the OS and the guest, without touching the backing services. A
            // failed rebuild is recorded exactly like a failed cold start.
            let mut instance = VmInstance::starting(self.os_service());
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
        let mut instance = VmInstance::starting(self.os_service());

        match self.start_sequence(&mut instance).await {
            Ok(()) => {
                info!(vm = %self.spec.name, ip = ?instance.ip, "vm running");
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
        if !self.is_running().await? {
            if let Some(instance) = self.current.as_mut() {
                instance.mark_stopped();
            }
            return Ok(());
        }

        if let Some(instance) = self.current.as_mut() {
            instance.mark_stopping();
        }

        // Every service gets its graceful termination attempt even when an
        // earlier one fails; failures are aggregated afterwards.
        let mut failures = Vec::new();
        for disk in [&self.os_disk, &self.cluster_disk, &self.data_disk] {
            if let Err(e) = disk.stop_service().await {
                failures.push(format!("{} service: {e}", disk.function()));
            }
        }

        // Host-side cleanup happens on every path, including the failed one.
        self.remove_port_forwards().await;
        if let Err(e) = VmEndpoint::remove(&self.ctx.endpoints_dir, &self.spec.name).await {
            warn!(vm = %self.spec.name, error = %e, "endpoint descriptor cleanup failed");
        }
        self.endpoint = None;

        if failures.is_empty() {
            if let Some(instance) = self.current.as_mut() {
                instance.mark_stopped();
            }
            info!(vm = %self.spec.name, "vm stopped");
            Ok(())
        } else {
            let message = failures.join("; ");
            // Forced fallback: tear the whole subsystem session down so the
            // state is Failed, never unknown.
            warn!(vm = %self.spec.name, error = %message, "graceful stop failed, forcing shutdown");
            let _ = self
                .ctx
                .driver
                .run_capture(self.ctx.cli_request(&["--shutdown"], LIST_TIMEOUT_SECS))
                .await;
            if let Some(instance) = self.current.as_mut() {
                instance.mark_failed(format!("graceful stop failed: {message}"));
            }
            Err(Error::VmOperationFailed {
                name: self.spec.name.clone(),
                operation: "stop",
                message,
            })
        }
    }

    async fn execute_command(&self, command: &str, timeout_secs: u64) -> Result<CommandCapture> {
        self.ctx
            .exec_in(&self.os_service(), command, timeout_secs)
            .await
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
            // Leftover foreign files in the VM dir are not ours to remove.
            Err(e) => warn!(dir = %dir.display(), error = %e, "vm directory not removed"),
        }
        info!(vm = %self.spec.name, "vm deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::runner::MockCommandDriver;
    use crate::vm::spec::{DiskRequirement, PortMap};

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            processors: 2,
            memory_gb: 4,
            gpu: None,
            cluster_disk: DiskRequirement { size_gb: 10, ssd_required: true },
            data_disk: DiskRequirement { size_gb: 20, ssd_required: false },
            ports: PortMap::default(),
        }
    }

    fn ctx(driver: MockCommandDriver) -> SubsystemContext {
        SubsystemContext {
            cli: "wsl".to_string(),
            port_proxy_tool: "netsh".to_string(),
            encoding: OutputEncoding::Utf8,
            driver: Arc::new(driver),
            vms_root: PathBuf::from("/nonexistent/vms"),
            endpoints_dir: PathBuf::from("/nonexistent/endpoints"),
            scripts_root: PathBuf::from("/nonexistent/scripts"),
        }
    }

    fn capture(stdout: &str) -> CommandCapture {
        CommandCapture { exit_code: 0, stdout: stdout.to_string(), stderr: String::new() }
    }

    #[tokio::test]
    async fn is_running_comes_from_the_running_listing_not_memory() {
        let mut driver = MockCommandDriver::new();
        driver
            .expect_run_capture()
            .withf(|req| req.args == ["--list", "--running", "--verbose"])
            .times(2)
            .returning(|_| {
                Ok(capture("  NAME       STATE      VERSION\n  dev-box-os Running    2\n"))
            });

        let vm = SubsystemVm::new(spec("dev-box"), ctx(driver));
        assert!(vm.current_instance().is_none(), "no in-memory instance to lean on");
        assert!(vm.is_running().await.unwrap());
        assert!(vm.is_running().await.unwrap(), "each call re-asks the OS");
    }

    #[tokio::test]
    async fn is_running_is_false_for_another_vms_service() {
        let mut driver = MockCommandDriver::new();
        driver.expect_run_capture().returning(|_| {
            Ok(capture("  NAME        STATE      VERSION\n  other-os    Running    2\n"))
        });

        let vm = SubsystemVm::new(spec("dev-box"), ctx(driver));
        assert!(!vm.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn execute_command_targets_the_os_distribution() {
        let mut driver = MockCommandDriver::new();
        driver
            .expect_run_capture()
            .withf(|req| {
                req.command == "wsl"
                    && req.args == ["-d", "dev-box-os", "sh", "-c", "uname -a"]
            })
            .returning(|_| Ok(capture("Linux dev-box 6.6.0\n")));

        let vm = SubsystemVm::new(spec("dev-box"), ctx(driver));
        let out = vm.execute_command("uname -a", 30).await.unwrap();
        assert!(out.stdout.contains("Linux"));
    }

    #[tokio::test]
    async fn resize_is_not_supported_on_this_provider() {
        let vm = SubsystemVm::new(spec("dev-box"), ctx(MockCommandDriver::new()));
        let err = vm.disks()[1].resize(40).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)), "got {err:?}");
    }
}
