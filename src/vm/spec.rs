//! Declarative description of the VM a caller wants.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::telemetry::GpuArchitecture;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("name pattern compiles"))
}

/// Host ports forwarded into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub ssh: u16,
    /// Cluster API server.
    pub api: u16,
    pub http: u16,
    pub https: u16,
}

impl Default for PortMap {
    fn default() -> Self {
        Self { ssh: 2222, api: 6443, http: 8080, https: 8443 }
    }
}

/// GPU the guest must be able to use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequirement {
    pub model: String,
    pub memory_gb: u32,
    pub count: u32,
    /// Tier of `model`, used for same-or-newer fallback when the exact
    /// model is absent from the host.
    pub architecture: GpuArchitecture,
}

/// Size and placement constraint for one virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRequirement {
    pub size_gb: u64,
    pub ssd_required: bool,
}

/// Immutable description of a VM. Construct as a struct literal, check it
/// with [`VmSpec::validate`]; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Globally unique among local VMs; must match `[a-z0-9-]+`.
    pub name: String,
    pub processors: u32,
    pub memory_gb: u64,
    pub gpu: Option<GpuRequirement>,
    pub cluster_disk: DiskRequirement,
    pub data_disk: DiskRequirement,
    #[serde(default)]
    pub ports: PortMap,
}

impl VmSpec {
    /// Check the invariants a spec must satisfy before any side effect.
    pub fn validate(&self) -> Result<()> {
        if !name_pattern().is_match(&self.name) {
            return Err(Error::InvalidSpec(format!(
                "vm name `{}` must match [a-z0-9-]+",
                self.name
            )));
        }
        if self.processors == 0 {
            return Err(Error::InvalidSpec("processor count must be positive".into()));
        }
        if self.memory_gb == 0 {
            return Err(Error::InvalidSpec("memory must be positive".into()));
        }
        if self.cluster_disk.size_gb == 0 || self.data_disk.size_gb == 0 {
            return Err(Error::InvalidSpec("disk sizes must be positive".into()));
        }
        if let Some(gpu) = &self.gpu {
            if gpu.count == 0 {
                return Err(Error::InvalidSpec("gpu count must be positive".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            processors: 4,
            memory_gb: 8,
            gpu: None,
            cluster_disk: DiskRequirement { size_gb: 20, ssd_required: true },
            data_disk: DiskRequirement { size_gb: 40, ssd_required: false },
            ports: PortMap::default(),
        }
    }

    #[test]
    fn lowercase_dashed_names_pass() {
        assert!(sample("dev-box-01").validate().is_ok());
    }

    #[test]
    fn uppercase_and_punctuation_are_rejected() {
        for bad in ["DevBox", "dev_box", "dev box", "", "dev.box"] {
            assert!(sample(bad).validate().is_err(), "`{bad}` should be rejected");
        }
    }

    #[test]
    fn zero_resources_are_rejected() {
        let mut spec = sample("ok");
        spec.processors = 0;
        assert!(spec.validate().is_err());

        let mut spec = sample("ok");
        spec.memory_gb = 0;
        assert!(spec.validate().is_err());

        let mut spec = sample("ok");
        spec.data_disk.size_gb = 0;
        assert!(spec.validate().is_err());
    }
}
