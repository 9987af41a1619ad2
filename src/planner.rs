//! Matches a [`VmSpec`] against detected host hardware.
//!
//! "This machine does not meet the spec" is an expected outcome here, not an
//! error: every check returns a [`ResourceCheck`] value with a pass flag and
//! a human-readable diagnostic.

use tracing::debug;

use crate::telemetry::{DriveInfo, GpuInfo, HostTelemetry};
use crate::vm::spec::{DiskRequirement, GpuRequirement, PortMap, VmSpec};

/// Processors held back for the host itself.
pub const RESERVED_PROCESSORS: u32 = 2;
/// Memory held back for the host, in GB.
pub const RESERVED_MEMORY_GB: u64 = 2;
/// Storage margin charged against the pool holding the OS drive, in GB.
pub const RESERVED_STORAGE_GB: u64 = 2;

/// Outcome of one per-resource check. An empty reason means "nothing worth
/// saying" (the check passed without caveats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCheck {
    pub supported: bool,
    pub reason: String,
}

impl ResourceCheck {
    fn pass() -> Self {
        Self { supported: true, reason: String::new() }
    }

    fn pass_with(reason: impl Into<String>) -> Self {
        Self { supported: true, reason: reason.into() }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self { supported: false, reason: reason.into() }
    }
}

/// One spec tier paired with whether this host can run it.
#[derive(Debug, Clone)]
pub struct SpecEvaluation {
    pub spec: VmSpec,
    pub supported: bool,
    pub reason: String,
}

/// Fixed Minimum and Recommended tiers plus a Maximum tier derived live
/// from what the host has left after reserved margins.
#[derive(Debug, Clone)]
pub struct RecommendedVmSpecs {
    pub minimum: SpecEvaluation,
    pub recommended: SpecEvaluation,
    pub maximum: SpecEvaluation,
}

// ---------------------------------------------------------------------------
// Per-resource checks
// ---------------------------------------------------------------------------

/// Pass iff the host keeps `RESERVED_PROCESSORS` for itself after the VM.
pub fn check_cpu(spec: &VmSpec, host_logical_processors: u32) -> ResourceCheck {
    let needed = spec.processors.saturating_add(RESERVED_PROCESSORS);
    if host_logical_processors >= needed {
        ResourceCheck::pass()
    } else {
        ResourceCheck::fail(format!(
            "needs {} logical processors ({} requested + {} reserved), host has {}",
            needed, spec.processors, RESERVED_PROCESSORS, host_logical_processors
        ))
    }
}

/// Pass iff `host_total_mb >= (memory_gb + reserved) * 1000`, exact at the
/// boundary.
pub fn check_memory(spec: &VmSpec, host_total_mb: u64) -> ResourceCheck {
    let needed_mb = spec.memory_gb.saturating_add(RESERVED_MEMORY_GB).saturating_mul(1000);
    if host_total_mb >= needed_mb {
        ResourceCheck::pass()
    } else {
        ResourceCheck::fail(format!(
            "needs {} MB of memory ({} GB requested + {} GB reserved), host has {} MB",
            needed_mb, spec.memory_gb, RESERVED_MEMORY_GB, host_total_mb
        ))
    }
}

/// Split the requirement into an SSD pool and an any-pool share, then check
/// capacity with the one-way substitution rule: surplus SSD capacity may
/// absorb an any-pool requirement, surplus non-SSD capacity never satisfies
/// an SSD requirement.
pub fn check_storage(spec: &VmSpec, drives: &[DriveInfo]) -> ResourceCheck {
    let mut ssd_required_gb = 0u64;
    let mut any_required_gb = 0u64;
    for disk in [&spec.cluster_disk, &spec.data_disk] {
        if disk.ssd_required {
            ssd_required_gb = ssd_required_gb.saturating_add(disk.size_gb);
        } else {
            any_required_gb = any_required_gb.saturating_add(disk.size_gb);
        }
    }

    let mut ssd_free_gb: i64 = drives
        .iter()
        .filter(|d| d.is_ssd)
        .map(|d| (d.free_mb / 1000) as i64)
        .sum();
    let mut any_free_gb: i64 = drives
        .iter()
        .filter(|d| !d.is_ssd)
        .map(|d| (d.free_mb / 1000) as i64)
        .sum();

    // The reserved margin is charged to whichever pool holds the OS drive.
    // When the OS drive doubles as a VM drive this can under- or
    // double-count; preserved as observed upstream.
    let os_on_ssd = drives.iter().any(|d| d.contains_os && d.is_ssd);
    if os_on_ssd {
        ssd_free_gb -= RESERVED_STORAGE_GB as i64;
    } else {
        any_free_gb -= RESERVED_STORAGE_GB as i64;
    }

    // Clamped casts so an absurd-but-validated request reads as a huge
    // requirement, never as a negative one.
    let ssd_required = ssd_required_gb.min(i64::MAX as u64) as i64;
    let any_required = any_required_gb.min(i64::MAX as u64) as i64;

    let supported = ssd_free_gb >= ssd_required + any_required
        || (ssd_free_gb >= ssd_required && any_free_gb >= any_required);

    debug!(
        ssd_required, any_required, ssd_free_gb, any_free_gb, supported,
        "storage check"
    );

    if supported {
        ResourceCheck::pass()
    } else {
        ResourceCheck::fail(format!(
            "needs {ssd_required} GB SSD + {any_required} GB on any drive; \
             free after reserve: {ssd_free_gb} GB SSD, {any_free_gb} GB other"
        ))
    }
}

/// Exact model match preferred; otherwise fall back to the best host GPU
/// whose architecture tier is at least the required tier, noting the
/// substitution. Memory is enforced either way.
pub fn check_gpu(spec: &VmSpec, host_gpus: &[GpuInfo]) -> ResourceCheck {
    let Some(required) = &spec.gpu else {
        return ResourceCheck::pass();
    };

    let exact: Vec<&GpuInfo> = host_gpus
        .iter()
        .filter(|g| g.model == required.model)
        .collect();
    if !exact.is_empty() {
        if (exact.len() as u32) < required.count {
            return ResourceCheck::fail(format!(
                "host has {} × `{}`, {} required",
                exact.len(),
                required.model,
                required.count
            ));
        }
        if exact.iter().any(|g| g.memory_gb < required.memory_gb) {
            return ResourceCheck::fail(format!(
                "`{}` present but with less than {} GB of GPU memory",
                required.model, required.memory_gb
            ));
        }
        return ResourceCheck::pass();
    }

    // Same-or-newer tier fallback.
    let mut candidates: Vec<&GpuInfo> = host_gpus
        .iter()
        .filter(|g| g.architecture >= required.architecture)
        .collect();
    candidates.sort_by(|a, b| {
        b.architecture
            .cmp(&a.architecture)
            .then(b.memory_gb.cmp(&a.memory_gb))
    });

    match candidates.first() {
        None => ResourceCheck::fail(format!(
            "no GPU of architecture {:?} or newer found (required `{}`)",
            required.architecture, required.model
        )),
        Some(best) if best.memory_gb < required.memory_gb => ResourceCheck::fail(format!(
            "best available GPU `{}` has {} GB, {} GB required",
            best.model, best.memory_gb, required.memory_gb
        )),
        Some(best) if (candidates.len() as u32) < required.count => ResourceCheck::fail(format!(
            "only {} GPUs of sufficient tier (best `{}`), {} required",
            candidates.len(),
            best.model,
            required.count
        )),
        Some(best) => ResourceCheck::pass_with(format!(
            "substituting `{}` ({:?}) for required `{}` ({:?})",
            best.model, best.architecture, required.model, required.architecture
        )),
    }
}

// ---------------------------------------------------------------------------
// Tier evaluation
// ---------------------------------------------------------------------------

/// Run all four checks, concatenating the non-empty diagnostics.
pub fn evaluate(spec: &VmSpec, host: &HostTelemetry) -> SpecEvaluation {
    let checks = [
        check_cpu(spec, host.logical_processors),
        check_memory(spec, host.total_memory_mb),
        check_storage(spec, &host.drives),
        check_gpu(spec, &host.gpus),
    ];

    let supported = checks.iter().all(|c| c.supported);
    let reason = checks
        .iter()
        .map(|c| c.reason.as_str())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join("; ");

    SpecEvaluation { spec: spec.clone(), supported, reason }
}

fn tier(name: &str, processors: u32, memory_gb: u64, cluster_gb: u64, data_gb: u64) -> VmSpec {
    VmSpec {
        name: name.to_string(),
        processors,
        memory_gb,
        gpu: None,
        cluster_disk: DiskRequirement { size_gb: cluster_gb, ssd_required: true },
        data_disk: DiskRequirement { size_gb: data_gb, ssd_required: false },
        ports: PortMap::default(),
    }
}

/// Fixed Minimum/Recommended tiers plus a Maximum derived from what the
/// host has left after reserved margins.
pub fn recommended_vm_specs(host: &HostTelemetry) -> RecommendedVmSpecs {
    let minimum = tier("minimum", 4, 4, 10, 20);
    let recommended = tier("recommended", 8, 16, 20, 60);

    let max_processors = host.logical_processors.saturating_sub(RESERVED_PROCESSORS).max(1);
    let max_memory_gb = (host.total_memory_mb / 1000)
        .saturating_sub(RESERVED_MEMORY_GB)
        .max(1);

    let largest_ssd_gb = host
        .drives
        .iter()
        .filter(|d| d.is_ssd)
        .map(|d| d.free_mb / 1000)
        .max()
        .unwrap_or(0)
        .saturating_sub(RESERVED_STORAGE_GB);
    let largest_any_gb = host
        .drives
        .iter()
        .map(|d| d.free_mb / 1000)
        .max()
        .unwrap_or(0)
        .saturating_sub(RESERVED_STORAGE_GB);

    let best_gpu = host.gpus.iter().max_by(|a, b| {
        a.architecture
            .cmp(&b.architecture)
            .then(a.memory_gb.cmp(&b.memory_gb))
    });

    let mut maximum = tier(
        "maximum",
        max_processors,
        max_memory_gb,
        (largest_ssd_gb / 2).max(1),
        (largest_any_gb / 2).max(1),
    );
    maximum.gpu = best_gpu.map(|g| GpuRequirement {
        model: g.model.clone(),
        memory_gb: g.memory_gb,
        count: 1,
        architecture: g.architecture,
    });

    RecommendedVmSpecs {
        minimum: evaluate(&minimum, host),
        recommended: evaluate(&recommended, host),
        maximum: evaluate(&maximum, host),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::GpuArchitecture;

    fn spec(processors: u32, memory_gb: u64, cluster: (u64, bool), data: (u64, bool)) -> VmSpec {
        VmSpec {
            name: "plan-test".to_string(),
            processors,
            memory_gb,
            gpu: None,
            cluster_disk: DiskRequirement { size_gb: cluster.0, ssd_required: cluster.1 },
            data_disk: DiskRequirement { size_gb: data.0, ssd_required: data.1 },
            ports: PortMap::default(),
        }
    }

    fn drive(is_ssd: bool, contains_os: bool, free_gb: u64) -> DriveInfo {
        DriveInfo {
            id: "disk0".to_string(),
            path: "/".to_string(),
            is_ssd,
            contains_os,
            total_mb: free_gb * 1000 * 2,
            free_mb: free_gb * 1000,
        }
    }

    fn gpu(model: &str, memory_gb: u32, arch: GpuArchitecture) -> GpuInfo {
        GpuInfo { model: model.to_string(), memory_gb, architecture: arch }
    }

    #[test]
    fn cpu_check_exact_boundary() {
        let s = spec(6, 8, (10, true), (20, false));
        assert!(check_cpu(&s, 8).supported, "6 + 2 reserved == 8 must pass");
        assert!(!check_cpu(&s, 7).supported);
    }

    #[test]
    fn memory_check_exact_boundary() {
        let s = spec(4, 12, (10, true), (20, false));
        assert!(check_memory(&s, 14_000).supported, "(12 + 2) * 1000 == 14000 must pass");
        assert!(!check_memory(&s, 13_999).supported);
    }

    #[test]
    fn cpu_and_memory_monotonicity() {
        // For fixed host telemetry, asking for more can only flip pass to
        // fail, never fail to pass.
        let host_cpus = 12;
        let host_mb = 32_000;
        let mut prev_cpu = true;
        let mut prev_mem = true;
        for ask in 1..40 {
            let s = spec(ask, ask as u64, (10, true), (10, false));
            let cpu_ok = check_cpu(&s, host_cpus).supported;
            let mem_ok = check_memory(&s, host_mb).supported;
            assert!(!(cpu_ok && !prev_cpu), "cpu pass must not reappear at {ask}");
            assert!(!(mem_ok && !prev_mem), "memory pass must not reappear at {ask}");
            prev_cpu = cpu_ok;
            prev_mem = mem_ok;
        }
        assert!(!prev_cpu);
        assert!(!prev_mem);
    }

    #[test]
    fn absurd_requests_fail_without_overflowing() {
        let s = spec(u32::MAX, u64::MAX, (u64::MAX, true), (u64::MAX, false));
        assert!(!check_cpu(&s, 128).supported);
        assert!(!check_memory(&s, 1_000_000).supported);
        assert!(!check_storage(&s, &[drive(true, true, 100)]).supported);
    }

    #[test]
    fn ssd_surplus_absorbs_any_pool_requirement() {
        // 10 GB SSD + 25 GB any, host: SSD pool of exactly 10+25+2 (reserve
        // lands on the SSD pool, which holds the OS drive), no other pool.
        let s = spec(1, 1, (10, true), (25, false));
        let drives = vec![drive(true, true, 37)];
        assert!(check_storage(&s, &drives).supported);
    }

    #[test]
    fn any_pool_surplus_never_substitutes_for_ssd() {
        // Mirror image of the case above: all capacity on a non-SSD pool.
        let s = spec(1, 1, (10, true), (25, false));
        let drives = vec![drive(false, true, 37)];
        let check = check_storage(&s, &drives);
        assert!(!check.supported, "non-SSD capacity must not satisfy an SSD requirement");
        assert!(!check.reason.is_empty());
    }

    #[test]
    fn reserve_is_charged_to_the_os_pool_only() {
        let s = spec(1, 1, (10, true), (25, false));
        // SSD pool exactly covers the SSD share; any pool exactly covers the
        // any share but the OS drive sits there, so the margin eats into it.
        let drives = vec![drive(true, false, 10), drive(false, true, 25)];
        assert!(!check_storage(&s, &drives).supported);

        let drives = vec![drive(true, false, 10), drive(false, true, 27)];
        assert!(check_storage(&s, &drives).supported);
    }

    #[test]
    fn end_to_end_supported_host() {
        // 8 logical processors, 16000 MB, one SSD drive with 50000 MB free;
        // asking for 6 cpus, 12 GB, 10 GB SSD cluster disk, 25 GB SSD data
        // disk with 2/2/2 reserved margins.
        let s = spec(6, 12, (10, true), (25, true));
        let host = HostTelemetry {
            logical_processors: 8,
            total_memory_mb: 16_000,
            drives: vec![drive(true, true, 50)],
            gpus: vec![],
        };
        let eval = evaluate(&s, &host);
        assert!(eval.supported, "diagnostic: {}", eval.reason);
        assert!(eval.reason.is_empty());
    }

    #[test]
    fn gpu_exact_model_match_passes_silently() {
        let mut s = spec(1, 1, (10, true), (10, false));
        s.gpu = Some(GpuRequirement {
            model: "RTX 2060".to_string(),
            memory_gb: 6,
            count: 1,
            architecture: GpuArchitecture::Turing,
        });
        let check = check_gpu(&s, &[gpu("RTX 2060", 6, GpuArchitecture::Turing)]);
        assert!(check.supported);
        assert!(check.reason.is_empty());
    }

    #[test]
    fn gpu_tier_fallback_notes_the_substitution() {
        // Required model is absent; a newer-tier card with enough memory
        // stands in, and the diagnostic says so.
        let mut s = spec(1, 1, (10, true), (10, false));
        s.gpu = Some(GpuRequirement {
            model: "X".to_string(),
            memory_gb: 6,
            count: 1,
            architecture: GpuArchitecture::Turing,
        });
        let check = check_gpu(&s, &[gpu("Y", 8, GpuArchitecture::Ampere)]);
        assert!(check.supported);
        assert!(check.reason.contains("substituting"), "got: {}", check.reason);
        assert!(check.reason.contains('Y'));
    }

    #[test]
    fn gpu_fallback_still_enforces_memory() {
        let mut s = spec(1, 1, (10, true), (10, false));
        s.gpu = Some(GpuRequirement {
            model: "X".to_string(),
            memory_gb: 12,
            count: 1,
            architecture: GpuArchitecture::Turing,
        });
        assert!(!check_gpu(&s, &[gpu("Y", 8, GpuArchitecture::Ampere)]).supported);
    }

    #[test]
    fn gpu_older_tier_never_matches() {
        let mut s = spec(1, 1, (10, true), (10, false));
        s.gpu = Some(GpuRequirement {
            model: "X".to_string(),
            memory_gb: 4,
            count: 1,
            architecture: GpuArchitecture::Ampere,
        });
        assert!(!check_gpu(&s, &[gpu("Old", 24, GpuArchitecture::Pascal)]).supported);
    }

    #[test]
    fn no_gpu_requirement_always_passes() {
        let s = spec(1, 1, (10, true), (10, false));
        assert!(check_gpu(&s, &[]).supported);
    }

    #[test]
    fn recommended_specs_maximum_tracks_host_leftovers() {
        let host = HostTelemetry {
            logical_processors: 16,
            total_memory_mb: 64_000,
            drives: vec![drive(true, true, 500)],
            gpus: vec![gpu("RTX 4090", 24, GpuArchitecture::Ada)],
        };
        let tiers = recommended_vm_specs(&host);
        assert_eq!(tiers.maximum.spec.processors, 14);
        assert_eq!(tiers.maximum.spec.memory_gb, 62);
        assert_eq!(tiers.maximum.spec.gpu.as_ref().unwrap().model, "RTX 4090");
        assert!(tiers.minimum.supported);
        assert!(tiers.recommended.supported);
    }

    #[test]
    fn recommended_specs_flag_underpowered_hosts() {
        let host = HostTelemetry {
            logical_processors: 4,
            total_memory_mb: 8_000,
            drives: vec![drive(false, true, 30)],
            gpus: vec![],
        };
        let tiers = recommended_vm_specs(&host);
        assert!(!tiers.recommended.supported);
        assert!(!tiers.recommended.reason.is_empty());
    }
}
