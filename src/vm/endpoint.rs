//! The durable, OS-reconstructible summary of a running instance.
//!
//! One flat JSON descriptor per VM, at `<endpointsDir>/<vmName>.json`. This
//! file is the interface the application-deployment side consumes to reach
//! a running VM; nothing else in this crate reads it back except recovery.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vm::spec::PortMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmEndpoint {
    pub vm_name: String,
    pub ip: String,
    pub ports: PortMap,
    /// Raw cluster credential blob (kubeconfig-equivalent).
    pub credentials: String,
}

impl VmEndpoint {
    pub fn descriptor_path(endpoints_dir: &Path, vm_name: &str) -> PathBuf {
        endpoints_dir.join(format!("{vm_name}.json"))
    }

    pub async fn save(&self, endpoints_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(endpoints_dir)
            .await
            .map_err(|e| Error::io(endpoints_dir, e))?;
        let path = Self::descriptor_path(endpoints_dir, &self.vm_name);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Error::io(&path, e))?;
        debug!(vm = %self.vm_name, path = %path.display(), "endpoint descriptor written");
        Ok(())
    }

    /// Load the descriptor for `vm_name`, `None` if it was never written.
    pub async fn load(endpoints_dir: &Path, vm_name: &str) -> Result<Option<Self>> {
        let path = Self::descriptor_path(endpoints_dir, vm_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Remove the descriptor; absent is fine.
    pub async fn remove(endpoints_dir: &Path, vm_name: &str) -> Result<()> {
        let path = Self::descriptor_path(endpoints_dir, vm_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> VmEndpoint {
        VmEndpoint {
            vm_name: name.to_string(),
            ip: "192.168.64.10".to_string(),
            ports: PortMap::default(),
            credentials: "apiVersion: v1\nkind: Config\n".to_string(),
        }
    }

    #[tokio::test]
    async fn save_load_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint("dev-box");

        ep.save(dir.path()).await.unwrap();
        let loaded = VmEndpoint::load(dir.path(), "dev-box").await.unwrap();
        assert_eq!(loaded.as_ref(), Some(&ep));

        VmEndpoint::remove(dir.path(), "dev-box").await.unwrap();
        assert!(VmEndpoint::load(dir.path(), "dev-box").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_missing_descriptor_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VmEndpoint::load(dir.path(), "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_safe_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        VmEndpoint::remove(dir.path(), "ghost").await.unwrap();
    }

    #[test]
    fn descriptor_path_is_keyed_by_name() {
        let path = VmEndpoint::descriptor_path(Path::new("/var/endpoints"), "dev-box");
        assert_eq!(path, Path::new("/var/endpoints/dev-box.json"));
    }
}
