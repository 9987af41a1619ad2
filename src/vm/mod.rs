//! Virtual machine lifecycle for clusterbox.
//!
//! A VM is three virtual disks (OS, Cluster, Data), a spec, and whichever
//! backend the host offers: the lightweight virtualization subsystem or a
//! general-purpose hypervisor. Both backends implement the same
//! [`provider::VirtualMachine`] contract and are indistinguishable to
//! callers.

pub mod disk;
pub mod endpoint;
pub mod hypervisor;
pub mod instance;
pub mod manager;
pub mod provider;
pub mod recover;
pub mod spec;
pub mod subsystem;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use disk::{DiskFunction, VirtualDisk};
pub use endpoint::VmEndpoint;
pub use instance::{InstanceState, VmInstance};
pub use manager::{ProviderContext, ReconcileReport, VmManager};
pub use provider::{ProviderKind, VirtualMachine};
pub use spec::{DiskRequirement, GpuRequirement, PortMap, VmSpec};
