//! Typed VM-management commands and their outcomes.
//!
//! A [`CommandRequest`] is executed by [`CommandExecutor`] and always yields
//! exactly one [`CommandResponse`]: either a [`CommandOutput`] payload or one
//! of the four [`CommandError`] classes.

use crate::hypervisor::HypervisorError;
use crate::observability::health::HealthReport;
use crate::scheduler::ScheduledSnapshotJob;
use crate::types::{CreateVmSpec, SnapshotDescriptor, StatsSample, VmDetail, VmInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod executor;
mod session;

pub use executor::{CommandExecutor, CpuReading, UsageReading};
pub use session::Session;

/// Power-state transition requested by a lifecycle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Boot from the defined configuration
    Start,
    /// Unpause
    Resume,
    /// Soft reset
    Reboot,
    /// Soft power-off
    Shutdown,
    /// Hard stop
    Poweroff,
}

impl LifecycleAction {
    pub const ALL: [LifecycleAction; 5] =
        [Self::Start, Self::Resume, Self::Reboot, Self::Shutdown, Self::Poweroff];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Resume => "resume",
            Self::Reboot => "reboot",
            Self::Shutdown => "shutdown",
            Self::Poweroff => "poweroff",
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed VM-management command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRequest {
    ListVms,
    VmDetail { name: String },
    CreateVm { spec: CreateVmSpec },
    DeleteVm { name: String },
    Lifecycle { name: String, action: LifecycleAction },
    ListSnapshots { name: String },
    CreateSnapshot { name: String, snapshot: String },
    RestoreSnapshot { name: String, snapshot: String },
    DeleteSnapshot { name: String, snapshot: String },
    SampleStats { name: String, interval_secs: u64 },
}

impl CommandRequest {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListVms => "list_vms",
            Self::VmDetail { .. } => "vm_detail",
            Self::CreateVm { .. } => "create_vm",
            Self::DeleteVm { .. } => "delete_vm",
            Self::Lifecycle { action, .. } => match action {
                LifecycleAction::Start => "start_vm",
                LifecycleAction::Resume => "resume_vm",
                LifecycleAction::Reboot => "reboot_vm",
                LifecycleAction::Shutdown => "shutdown_vm",
                LifecycleAction::Poweroff => "poweroff_vm",
            },
            Self::ListSnapshots { .. } => "get_snapshots",
            Self::CreateSnapshot { .. } => "create_snapshots",
            Self::RestoreSnapshot { .. } => "restore_snapshot",
            Self::DeleteSnapshot { .. } => "delete_snapshot",
            Self::SampleStats { .. } => "sample_stats",
        }
    }

    /// The VM this command targets, if any.
    pub fn vm_name(&self) -> Option<&str> {
        match self {
            Self::ListVms => None,
            Self::CreateVm { spec } => Some(&spec.name),
            Self::VmDetail { name }
            | Self::DeleteVm { name }
            | Self::Lifecycle { name, .. }
            | Self::ListSnapshots { name }
            | Self::CreateSnapshot { name, .. }
            | Self::RestoreSnapshot { name, .. }
            | Self::DeleteSnapshot { name, .. }
            | Self::SampleStats { name, .. } => Some(name),
        }
    }

    /// HTTP status a front end should answer `response` to this request with.
    pub fn http_status(&self, response: &CommandResponse) -> u16 {
        match response {
            Ok(_) if matches!(self, Self::CreateVm { .. } | Self::CreateSnapshot { .. }) => 201,
            Ok(_) => 200,
            Err(err) => err.http_status(),
        }
    }
}

/// Successful command payload.
///
/// Serialized without a tag: each variant is recognised by its keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Vms { vms: Vec<VmInfo> },
    Snapshots { snapshots: Vec<SnapshotDescriptor> },
    Stats { stats: StatsSample },
    Samples { samples: Vec<StatsSample> },
    Schedules { schedules: Vec<ScheduledSnapshotJob> },
    Scheduled { message: String, job: ScheduledSnapshotJob },
    Health { health: HealthReport },
    Detail(VmDetail),
    Message { message: String },
}

impl CommandOutput {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message { message: text.into() }
    }
}

/// Failure class of a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ConnectionFailed(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    ExecutionError(String),
}

impl CommandError {
    /// Wire name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::BadRequest(_) => "bad_request",
            Self::ExecutionError(_) => "execution_error",
        }
    }

    pub fn from_kind(kind: &str, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match kind {
            "not_found" => Some(Self::NotFound(message)),
            "connection_failed" => Some(Self::ConnectionFailed(message)),
            "bad_request" => Some(Self::BadRequest(message)),
            "execution_error" => Some(Self::ExecutionError(message)),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::ConnectionFailed(m)
            | Self::BadRequest(m)
            | Self::ExecutionError(m) => m,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::ConnectionFailed(_) | Self::ExecutionError(_) => 500,
        }
    }

    /// Classify a hypervisor failure, prefixing `context` to its message.
    pub fn from_hypervisor(context: impl std::fmt::Display, err: HypervisorError) -> Self {
        let message = format!("{}: {}", context, err);
        match err {
            HypervisorError::Unreachable(_) => Self::ConnectionFailed(message),
            HypervisorError::NoDomain(_) | HypervisorError::NoSnapshot(_) => {
                Self::NotFound(message)
            }
            HypervisorError::InvalidState(_)
            | HypervisorError::InvalidDefinition(_)
            | HypervisorError::Failed(_) => Self::ExecutionError(message),
        }
    }
}

/// Outcome of one command.
pub type CommandResponse = std::result::Result<CommandOutput, CommandError>;
