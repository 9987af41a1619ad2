//! Optional `config.toml` with tool overrides and planner margins.
//!
//! Everything has a compiled-in default; the file is only needed to point
//! at non-standard tool locations or unusual scripts roots.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vm::provider::ProviderKind;

/// External tool invocations, overridable per install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Distribution-manager CLI for the subsystem provider.
    pub distribution_cli: String,
    /// Virtual-machine monitor binary for the hypervisor provider.
    pub hypervisor: String,
    /// Disk-image tool (create/clone/resize).
    pub disk_tool: String,
    /// GPU inventory tool.
    pub gpu_tool: String,
    /// Process-table tool used for live-state recovery.
    pub process_lister: String,
    /// Port-forwarding tool for the subsystem provider.
    pub port_proxy_tool: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            distribution_cli: "wsl".to_string(),
            hypervisor: "qemu-system-aarch64".to_string(),
            disk_tool: "qemu-img".to_string(),
            gpu_tool: "nvidia-smi".to_string(),
            process_lister: "ps".to_string(),
            port_proxy_tool: "netsh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tools: ToolPaths,
    /// Which VM backend this host uses.
    pub provider: Option<ProviderKind>,
    /// Root for provider init scripts; defaults to `<configDir>/scripts`.
    pub scripts_root: Option<PathBuf>,
    /// Seconds to wait for the guest to become reachable after launch.
    pub guest_ready_timeout_secs: Option<u64>,
}

impl Settings {
    /// Load `config.toml` from the config dir; a missing file yields
    /// defaults, a malformed one is an error worth surfacing.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("config.toml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(&path, e)),
        };
        toml::from_str(&text)
            .map_err(|e| Error::InvalidSpec(format!("config.toml: {e}")))
    }

    pub fn guest_ready_timeout_secs(&self) -> u64 {
        self.guest_ready_timeout_secs.unwrap_or(120)
    }

    /// Configured backend, or the platform's natural one.
    pub fn provider(&self) -> ProviderKind {
        self.provider.unwrap_or({
            #[cfg(windows)]
            {
                ProviderKind::Subsystem
            }
            #[cfg(not(windows))]
            {
                ProviderKind::Hypervisor
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.tools.distribution_cli, "wsl");
        assert_eq!(settings.tools.disk_tool, "qemu-img");
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[tools]\nhypervisor = \"/opt/vmm/bin/vfkit\"\n",
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.tools.hypervisor, "/opt/vmm/bin/vfkit");
        assert_eq!(settings.tools.distribution_cli, "wsl", "unnamed fields keep defaults");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "tools = 7").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }
}
