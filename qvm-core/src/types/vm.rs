//! VM domain types.

use serde::{Deserialize, Serialize};

/// Sentinel reported when a domain declares no operating system.
pub const UNKNOWN_OS: &str = "unknown";

/// Domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    NoState,
    Running,
    Blocked,
    Paused,
    /// Guest is being shut down.
    Shutdown,
    /// Guest is powered off.
    Shutoff,
    Crashed,
    PmSuspended,
}

impl VmState {
    /// Map the hypervisor's numeric state code. Unknown codes collapse to `NoState`.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::NoState => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Paused => 3,
            Self::Shutdown => 4,
            Self::Shutoff => 5,
            Self::Crashed => 6,
            Self::PmSuspended => 7,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "no_state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pm_suspended",
        }
    }

    /// Whether the domain has a live instance.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Blocked | Self::Paused | Self::PmSuspended)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one domain's identity and resources.
///
/// Rebuilt from the hypervisor on every query and never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,

    /// Hypervisor runtime id; absent while the domain is inactive.
    pub id: Option<u32>,

    pub uuid: String,

    pub state: VmState,

    /// Maximum memory in KiB
    pub max_memory: u64,

    /// Memory currently in use in KiB
    pub memory: u64,

    pub vcpus: u32,

    pub autostart: bool,
}

/// A block device attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDevice {
    /// Guest device name (e.g. `vda`, `hdc`)
    pub target: String,

    /// Backing file, if any
    pub location: Option<String>,
}

/// Full description of a single VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDetail {
    #[serde(flatten)]
    pub info: VmInfo,

    /// Declared operating system id, or [`UNKNOWN_OS`].
    pub vm_os: String,

    pub disks: Vec<DiskDevice>,

    pub cdroms: Vec<DiskDevice>,
}

/// Minimal definition accepted by `CreateVM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmSpec {
    pub name: String,

    /// Number of vCPUs
    #[serde(rename = "cpus")]
    pub vcpu_count: u32,

    /// Memory in KiB
    #[serde(rename = "memory")]
    pub memory_kib: u64,

    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    #[serde(rename = "network", default = "default_network_name")]
    pub network_name: String,

    #[serde(default = "default_network_model")]
    pub network_model: String,

    /// Define the domain persistently instead of creating a transient one.
    #[serde(default)]
    pub persist: bool,
}

impl CreateVmSpec {
    /// Spec with the default machine and network settings.
    pub fn new(name: impl Into<String>, vcpu_count: u32, memory_kib: u64) -> Self {
        Self {
            name: name.into(),
            vcpu_count,
            memory_kib,
            machine_type: default_machine_type(),
            network_name: default_network_name(),
            network_model: default_network_model(),
            persist: false,
        }
    }
}

fn default_machine_type() -> String {
    "pc-i440fx-2.9".to_string()
}

fn default_network_name() -> String {
    "default".to_string()
}

fn default_network_model() -> String {
    "virtio".to_string()
}
