//! clusterbox CLI: provision, start, stop and reconcile the local cluster VM.
//!
//! Presentation only — every operation is a thin wrapper over the library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use clusterbox::command::{CommandRunner, OutputEncoding};
use clusterbox::paths::AppPaths;
use clusterbox::planner;
use clusterbox::settings::Settings;
use clusterbox::telemetry;
use clusterbox::vm::hypervisor::HypervisorContext;
use clusterbox::vm::subsystem::SubsystemContext;
use clusterbox::vm::{ProviderContext, ProviderKind, VmManager, VmSpec};

#[derive(Parser, Debug)]
#[command(name = "clusterbox", version, about = "Local single-node cluster VM manager")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate this host against a spec, or print the supported tiers.
    Check {
        /// TOML file describing the VM; omit to print the
        /// minimum/recommended/maximum tiers for this host.
        #[arg(long)]
        spec: Option<PathBuf>,
    },
    /// Provision the VM's disks.
    Create {
        #[arg(long)]
        spec: PathBuf,
        /// Base OS image the OS disk is cloned from.
        #[arg(long)]
        base_image: PathBuf,
        /// Public key file granting ssh access to the guest.
        #[arg(long)]
        public_key: PathBuf,
    },
    /// Start the VM and print its endpoint.
    Start {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Stop the VM.
    Stop {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Stop (if needed) and remove the VM, its disks and its endpoint.
    Delete {
        #[arg(long)]
        spec: PathBuf,
    },
    /// List VM directories present on this host.
    List,
    /// Reconcile a spec against the host: disks, services, liveness.
    Status {
        #[arg(long)]
        spec: PathBuf,
    },
}

fn load_spec(path: &PathBuf) -> Result<VmSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading spec file {}", path.display()))?;
    let spec: VmSpec =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    spec.validate()?;
    Ok(spec)
}

/// Host facts for the planner: sysinfo basics plus GPU inventory from the
/// configured tool.
async fn probe_host(settings: &Settings) -> clusterbox::telemetry::HostTelemetry {
    let mut host = telemetry::probe_host();
    host.gpus = telemetry::probe_gpus(&CommandRunner::new(), &settings.tools.gpu_tool).await;
    host
}

fn build_manager(paths: &AppPaths, settings: &Settings) -> VmManager {
    let driver = Arc::new(CommandRunner::new());
    let scripts_root = settings
        .scripts_root
        .clone()
        .unwrap_or_else(|| paths.scripts.clone());

    let provider = match settings.provider() {
        ProviderKind::Subsystem => ProviderContext::Subsystem(SubsystemContext {
            cli: settings.tools.distribution_cli.clone(),
            port_proxy_tool: settings.tools.port_proxy_tool.clone(),
            encoding: OutputEncoding::Utf16Le,
            driver,
            vms_root: paths.vms.clone(),
            endpoints_dir: paths.endpoints.clone(),
            scripts_root,
        }),
        ProviderKind::Hypervisor => ProviderContext::Hypervisor(HypervisorContext {
            hypervisor: settings.tools.hypervisor.clone(),
            disk_tool: settings.tools.disk_tool.clone(),
            process_lister: settings.tools.process_lister.clone(),
            driver,
            vms_root: paths.vms.clone(),
            endpoints_dir: paths.endpoints.clone(),
            scripts_root,
            guest_ready_timeout_secs: settings.guest_ready_timeout_secs(),
        }),
    };
    VmManager::new(provider, paths.vms.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = clusterbox::logging::init();
    let args = Args::parse();

    let paths = AppPaths::resolve().context("cannot resolve home directory")?;
    paths.ensure().context("creating application directories")?;
    let settings = Settings::load(&paths.config)?;
    let manager = build_manager(&paths, &settings);

    match args.command {
        Command::Check { spec } => {
            let host = probe_host(&settings).await;
            match spec {
                Some(path) => {
                    let spec = load_spec(&path)?;
                    let verdict = planner::evaluate(&spec, &host);
                    if verdict.supported {
                        println!("supported");
                    } else {
                        println!("not supported: {}", verdict.reason);
                    }
                }
                None => {
                    let tiers = planner::recommended_vm_specs(&host);
                    for (label, tier) in [
                        ("minimum", &tiers.minimum),
                        ("recommended", &tiers.recommended),
                        ("maximum", &tiers.maximum),
                    ] {
                        let status = if tier.supported { "ok" } else { "unsupported" };
                        let note = if tier.reason.is_empty() {
                            String::new()
                        } else {
                            format!(" ({})", tier.reason)
                        };
                        println!(
                            "{label}: {} cpu / {} GB / {}+{} GB disk — {status}{note}",
                            tier.spec.processors,
                            tier.spec.memory_gb,
                            tier.spec.cluster_disk.size_gb,
                            tier.spec.data_disk.size_gb,
                        );
                    }
                }
            }
        }
        Command::Create { spec, base_image, public_key } => {
            let spec = load_spec(&spec)?;
            let key = std::fs::read_to_string(&public_key)
                .with_context(|| format!("reading public key {}", public_key.display()))?;
            let host = probe_host(&settings).await;
            let vm = manager.create(spec, &host, &base_image, key.trim()).await?;
            println!("created `{}`", vm.name());
        }
        Command::Start { spec } => {
            let spec = load_spec(&spec)?;
            let Some(mut vm) = manager.find(spec).await? else {
                bail!("vm does not exist on this host; run `create` first");
            };
            let instance = vm.start().await?;
            match &instance.ip {
                Some(ip) => println!("running at {ip} (ssh port {})", vm.spec().ports.ssh),
                None => println!("started (no IP reported)"),
            }
        }
        Command::Stop { spec } => {
            let spec = load_spec(&spec)?;
            let Some(mut vm) = manager.find(spec).await? else {
                bail!("vm does not exist on this host");
            };
            vm.stop().await?;
            println!("stopped");
        }
        Command::Delete { spec } => {
            let spec = load_spec(&spec)?;
            manager.delete(spec).await?;
            println!("deleted");
        }
        Command::List => {
            for name in manager.list().await? {
                println!("{name}");
            }
        }
        Command::Status { spec } => {
            let spec = load_spec(&spec)?;
            let reports = manager.reconcile(std::slice::from_ref(&spec)).await?;
            for report in reports {
                println!(
                    "{}: exists={} running={}",
                    report.name, report.exists, report.running
                );
                for disk in report.disks {
                    println!(
                        "  {}: artifact={} service={}",
                        disk.function, disk.artifact_present, disk.service_registered
                    );
                }
            }
        }
    }
    Ok(())
}
