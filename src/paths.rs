//! Application directory structure for clusterbox.
//!
//! Provides a single `AppPaths` struct that resolves all standard directories
//! and ensures they exist on first launch. Follows macOS conventions:
//!
//! - Config:    `~/.config/clusterbox/`  (human-editable, XDG-style)
//! - Data:      `~/Library/Application Support/com.clusterbox.clusterbox/`
//! - Logs:      `~/Library/Logs/clusterbox/`
//!
//! On non-macOS, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::info;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "com.clusterbox.clusterbox";
const APP_NAME: &str = "clusterbox";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/clusterbox/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// VM directories: one subdirectory of disks per VM name
    pub vms: PathBuf,
    /// Endpoint descriptors: one JSON file per running VM
    pub endpoints: PathBuf,
    /// Provisioning scripts run on the host or inside guests
    pub scripts: PathBuf,
    /// Application and per-script-run logs
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories — call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let logs = resolve_log_dir(&home);

        Some(Self {
            scripts: config.join("scripts"),
            config,
            vms: data.join("vms"),
            endpoints: data.join("endpoints"),
            data,
            logs,
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            &self.config,
            &self.data,
            &self.vms,
            &self.endpoints,
            &self.scripts,
            &self.logs,
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
