//! Recovery of live VM state purely from OS inspection output.
//!
//! These are pure functions from process/service listings to reconstructed
//! facts, so the manager can regain full knowledge of a running VM after a
//! restart of the managing process with no persisted bookkeeping, and so
//! the matching logic can be tested against synthetic listings.

use std::path::Path;

use regex::Regex;

/// A registered distribution row from the subsystem CLI's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub state: String,
}

/// A hypervisor process recovered from a process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorProcess {
    pub pid: u32,
    /// Host ssh port extracted from the forwarded-port launch arguments.
    pub ssh_port: Option<u16>,
}

/// Find `service` in a `NAME  STATE  VERSION`-shaped listing. The default
/// distribution is marked with a leading `*`; both shapes match. Returns
/// the row regardless of its state — callers decide what "running" means.
pub fn find_service(listing: &str, service: &str) -> Option<ServiceRecord> {
    let row = Regex::new(r"^\s*\*?\s*(\S+)\s+(\S+)").expect("row pattern compiles");
    listing.lines().filter_map(|line| row.captures(line)).find_map(|caps| {
        if &caps[1] == service {
            Some(ServiceRecord { name: caps[1].to_string(), state: caps[2].to_string() })
        } else {
            None
        }
    })
}

/// True when `service` appears in a listing of running services.
pub fn service_is_running(running_listing: &str, service: &str) -> bool {
    find_service(running_listing, service)
        .map(|record| record.state.eq_ignore_ascii_case("running"))
        .unwrap_or(false)
}

/// Find a live hypervisor process for a specific VM by matching the monitor
/// binary and the VM's OS disk path embedded in the launch arguments, then
/// pull the forwarded ssh port out of the same arguments.
///
/// Expects `ps`-shaped lines: pid first, full command line after.
pub fn find_hypervisor_process(
    process_table: &str,
    hypervisor_binary: &str,
    os_disk_path: &Path,
) -> Option<HypervisorProcess> {
    let pid_pattern = Regex::new(r"^\s*(\d+)\s").expect("pid pattern compiles");
    let ssh_pattern = Regex::new(r"hostfwd=tcp::(\d+)-:22").expect("ssh pattern compiles");
    let disk_needle = os_disk_path.to_string_lossy();

    for line in process_table.lines() {
        if !line.contains(hypervisor_binary) || !line.contains(disk_needle.as_ref()) {
            continue;
        }
        let Some(pid_caps) = pid_pattern.captures(line) else {
            continue;
        };
        let Ok(pid) = pid_caps[1].parse::<u32>() else {
            continue;
        };
        let ssh_port = ssh_pattern
            .captures(line)
            .and_then(|caps| caps[1].parse::<u16>().ok());
        return Some(HypervisorProcess { pid, ssh_port });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const LISTING: &str = "\
  NAME            STATE           VERSION
* dev-box-os      Running         2
  dev-box-cluster Stopped         2
  other-vm-os     Running         2
";

    #[test]
    fn finds_default_marked_service() {
        let record = find_service(LISTING, "dev-box-os").unwrap();
        assert_eq!(record.state, "Running");
    }

    #[test]
    fn finds_unmarked_service() {
        let record = find_service(LISTING, "dev-box-cluster").unwrap();
        assert_eq!(record.state, "Stopped");
    }

    #[test]
    fn absent_service_is_none() {
        assert!(find_service(LISTING, "ghost-os").is_none());
    }

    #[test]
    fn name_match_is_exact_not_prefix() {
        assert!(find_service(LISTING, "dev-box").is_none());
    }

    #[test]
    fn running_check_requires_running_state() {
        assert!(service_is_running(LISTING, "dev-box-os"));
        assert!(!service_is_running(LISTING, "dev-box-cluster"));
        assert!(!service_is_running(LISTING, "ghost-os"));
    }

    #[test]
    fn hypervisor_process_matched_by_binary_and_disk_path() {
        let table = "\
  501 /usr/libexec/sshd
 3301 qemu-system-aarch64 -m 8192 -smp 4 -drive file=/vms/dev-box/os.img,if=virtio \
-netdev user,id=n0,hostfwd=tcp::2222-:22,hostfwd=tcp::6443-:6443
 3400 qemu-system-aarch64 -m 4096 -drive file=/vms/other/os.img,if=virtio
";
        let found = find_hypervisor_process(
            table,
            "qemu-system-aarch64",
            &PathBuf::from("/vms/dev-box/os.img"),
        )
        .unwrap();
        assert_eq!(found.pid, 3301);
        assert_eq!(found.ssh_port, Some(2222));
    }

    #[test]
    fn hypervisor_process_absent_when_disk_path_differs() {
        let table = " 3301 qemu-system-aarch64 -drive file=/vms/other/os.img,if=virtio";
        assert!(find_hypervisor_process(
            table,
            "qemu-system-aarch64",
            &PathBuf::from("/vms/dev-box/os.img"),
        )
        .is_none());
    }

    #[test]
    fn ssh_port_is_optional() {
        let table = " 42 qemu-system-aarch64 -drive file=/vms/dev-box/os.img,if=virtio";
        let found = find_hypervisor_process(
            table,
            "qemu-system-aarch64",
            &PathBuf::from("/vms/dev-box/os.img"),
        )
        .unwrap();
        assert_eq!(found.pid, 42);
        assert_eq!(found.ssh_port, None);
    }
}
