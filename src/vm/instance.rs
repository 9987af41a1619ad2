//! One execution episode of a VM, from Start to Stop or failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one instance. `Stopped` and `Failed` are terminal for
/// the instance; the VM itself stays usable for a fresh Start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Value created by every `start` call. Once an instance reaches `Stopped`
/// or `Failed` its transition methods become no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInstance {
    /// Backing process or service identifier.
    pub service_id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub ip: Option<String>,
    /// Raw cluster credential blob as read from the guest.
    pub credentials: Option<String>,
    pub state: InstanceState,
    pub failure: Option<String>,
}

impl VmInstance {
    pub fn starting(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            started_at: Utc::now(),
            stopped_at: None,
            ip: None,
            credentials: None,
            state: InstanceState::Starting,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Transition to Running. IP and credentials are populated in the same
    /// step — an instance is never observable as Running without them.
    pub fn mark_running(&mut self, ip: impl Into<String>, credentials: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.ip = Some(ip.into());
        self.credentials = Some(credentials.into());
        self.state = InstanceState::Running;
    }

    pub fn mark_stopping(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = InstanceState::Stopping;
    }

    pub fn mark_stopped(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.stopped_at = Some(Utc::now());
        self.state = InstanceState::Stopped;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.stopped_at = Some(Utc::now());
        self.failure = Some(message.into());
        self.state = InstanceState::Failed;
    }
}
