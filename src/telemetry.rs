//! Host hardware facts consumed by the resource planner.
//!
//! The planner treats these as opaque numeric inputs. [`probe_host`] fills
//! what sysinfo can see (logical processors, memory, drives); [`probe_gpus`]
//! queries the configured GPU inventory tool. SSD classification comes from
//! an external inspection collaborator and callers patch it in before
//! planning.

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::debug;

use crate::command::{CommandDriver, CommandRequest, OutputParser};

/// One physical drive / partition pool the planner can place disks on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveInfo {
    /// Stable identifier (mount point or device node).
    pub id: String,
    pub path: String,
    pub is_ssd: bool,
    /// Whether the OS / user-profile volume lives on this drive. The
    /// reserved-storage margin is charged against this pool.
    pub contains_os: bool,
    pub total_mb: u64,
    pub free_mb: u64,
}

/// Ordinal GPU generation ranking used for "same or newer" fallback
/// matching. Ordering of the variants is the ordering of the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GpuArchitecture {
    Maxwell,
    Pascal,
    Volta,
    Turing,
    Ampere,
    Ada,
    Hopper,
    Blackwell,
}

impl GpuArchitecture {
    /// Map a CUDA compute capability to its architecture tier. Unknown
    /// capabilities yield `None` rather than a guess.
    pub fn from_compute_cap(major: u32, minor: u32) -> Option<Self> {
        match (major, minor) {
            (5, _) => Some(GpuArchitecture::Maxwell),
            (6, _) => Some(GpuArchitecture::Pascal),
            (7, 0) | (7, 2) => Some(GpuArchitecture::Volta),
            (7, 5) => Some(GpuArchitecture::Turing),
            (8, 9) => Some(GpuArchitecture::Ada),
            (8, _) => Some(GpuArchitecture::Ampere),
            (9, _) => Some(GpuArchitecture::Hopper),
            (10..=12, _) => Some(GpuArchitecture::Blackwell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub model: String,
    pub memory_gb: u32,
    pub architecture: GpuArchitecture,
}

/// Everything the planner needs to know about the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostTelemetry {
    pub logical_processors: u32,
    pub total_memory_mb: u64,
    pub drives: Vec<DriveInfo>,
    pub gpus: Vec<GpuInfo>,
}

/// Query the configured GPU inventory tool for model, memory and compute
/// capability. A missing tool or a host without GPUs yields an empty
/// inventory, not an error — the planner treats no GPUs as an ordinary
/// host shape.
pub async fn probe_gpus(driver: &dyn CommandDriver, gpu_tool: &str) -> Vec<GpuInfo> {
    let request = CommandRequest::new(
        gpu_tool,
        &[
            "--query-gpu=name,memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ],
    )
    .timeout_secs(30);

    let capture = match driver.run_capture(request).await {
        Ok(capture) => capture,
        Err(e) => {
            debug!(tool = gpu_tool, error = %e, "gpu inventory unavailable");
            return Vec::new();
        }
    };
    parse_gpu_listing(&capture.stdout)
}

fn parse_gpu_listing(listing: &str) -> Vec<GpuInfo> {
    let mut gpus: Vec<GpuInfo> = Vec::new();
    OutputParser::new()
        .table(
            r"^\s*([^,]+?)\s*,\s*(\d+)\s*,\s*(\d+)\.(\d+)\s*$",
            |out: &mut Vec<GpuInfo>, caps| {
                let memory_mb: u64 = caps[2].parse().unwrap_or(0);
                let major: u32 = caps[3].parse().unwrap_or(0);
                let minor: u32 = caps[4].parse().unwrap_or(0);
                if let Some(architecture) = GpuArchitecture::from_compute_cap(major, minor) {
                    out.push(GpuInfo {
                        model: caps[1].to_string(),
                        memory_gb: (memory_mb / 1000) as u32,
                        architecture,
                    });
                }
            },
        )
        .parse(&mut gpus, listing);
    gpus
}

/// Collect processor, memory and drive facts from the running host.
///
/// sysinfo cannot classify drive media, so `is_ssd` starts out `false`;
/// `gpus` starts empty and [`probe_gpus`] patches it in. Callers with a
/// real drive inspector overwrite `is_ssd` before planning.
pub fn probe_host() -> HostTelemetry {
    let mut system = System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let disks = Disks::new_with_refreshed_list();
    let drives = disks
        .iter()
        .map(|disk| {
            let mount = disk.mount_point().to_string_lossy().into_owned();
            DriveInfo {
                id: disk.name().to_string_lossy().into_owned(),
                contains_os: mount == "/" || mount.starts_with("C:"),
                path: mount,
                is_ssd: false,
                total_mb: disk.total_space() / 1_000_000,
                free_mb: disk.available_space() / 1_000_000,
            }
        })
        .collect::<Vec<_>>();

    let telemetry = HostTelemetry {
        logical_processors: system.cpus().len() as u32,
        total_memory_mb: system.total_memory() / 1_000_000,
        drives,
        gpus: Vec::new(),
    };

    debug!(
        processors = telemetry.logical_processors,
        memory_mb = telemetry.total_memory_mb,
        drives = telemetry.drives.len(),
        "host telemetry probed"
    );

    telemetry
}
