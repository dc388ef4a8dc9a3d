//! JSON encoding of requests and responses.

use crate::command::{CommandError, CommandOutput, CommandRequest, CommandResponse, LifecycleAction};
use crate::types::CreateVmSpec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A request as it appears on the wire: `{"command": <name>, ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WireRequest {
    ListVms,
    VmDetail {
        name: String,
    },
    CreateVm {
        vm_data: CreateVmSpec,
    },
    DeleteVm {
        name: String,
    },
    StartVm {
        name: String,
    },
    /// Soft power-off; same as `shutdown_vm`.
    StopVm {
        name: String,
    },
    ShutdownVm {
        name: String,
    },
    ResumeVm {
        name: String,
    },
    RebootVm {
        name: String,
    },
    /// Hard stop.
    PoweroffVm {
        name: String,
    },
    GetSnapshots {
        name: String,
    },
    CreateSnapshots {
        name: String,
        snapshot: String,
    },
    RestoreSnapshot {
        name: String,
        snapshot: String,
    },
    DeleteSnapshot {
        name: String,
        snapshot: String,
    },
    SampleStats {
        name: String,
        #[serde(default = "default_sample_interval")]
        interval: u64,
    },
    LatestStats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ScheduleSnapshot {
        vm_name: String,
        snapshot_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<String>,
    },
    ListSchedules,
    Health,
}

fn default_sample_interval() -> u64 {
    1
}

impl WireRequest {
    /// Every accepted `command` value.
    pub const COMMANDS: [&'static str; 19] = [
        "list_vms",
        "vm_detail",
        "create_vm",
        "delete_vm",
        "start_vm",
        "stop_vm",
        "shutdown_vm",
        "resume_vm",
        "reboot_vm",
        "poweroff_vm",
        "get_snapshots",
        "create_snapshots",
        "restore_snapshot",
        "delete_snapshot",
        "sample_stats",
        "latest_stats",
        "schedule_snapshot",
        "list_schedules",
        "health",
    ];

    /// What the server should do with this request.
    pub fn into_action(self) -> WireAction {
        use LifecycleAction::*;
        let lifecycle =
            |name: String, action| WireAction::Execute(CommandRequest::Lifecycle { name, action });

        match self {
            Self::ListVms => WireAction::Execute(CommandRequest::ListVms),
            Self::VmDetail { name } => WireAction::Execute(CommandRequest::VmDetail { name }),
            Self::CreateVm { vm_data } => {
                WireAction::Execute(CommandRequest::CreateVm { spec: vm_data })
            }
            Self::DeleteVm { name } => WireAction::Execute(CommandRequest::DeleteVm { name }),
            Self::StartVm { name } => lifecycle(name, Start),
            Self::StopVm { name } | Self::ShutdownVm { name } => lifecycle(name, Shutdown),
            Self::ResumeVm { name } => lifecycle(name, Resume),
            Self::RebootVm { name } => lifecycle(name, Reboot),
            Self::PoweroffVm { name } => lifecycle(name, Poweroff),
            Self::GetSnapshots { name } => {
                WireAction::Execute(CommandRequest::ListSnapshots { name })
            }
            Self::CreateSnapshots { name, snapshot } => {
                WireAction::Execute(CommandRequest::CreateSnapshot { name, snapshot })
            }
            Self::RestoreSnapshot { name, snapshot } => {
                WireAction::Execute(CommandRequest::RestoreSnapshot { name, snapshot })
            }
            Self::DeleteSnapshot { name, snapshot } => {
                WireAction::Execute(CommandRequest::DeleteSnapshot { name, snapshot })
            }
            Self::SampleStats { name, interval } => {
                WireAction::Execute(CommandRequest::SampleStats { name, interval_secs: interval })
            }
            Self::LatestStats { name } => WireAction::LatestStats { name },
            Self::ScheduleSnapshot { vm_name, snapshot_name, day, interval } => {
                WireAction::Schedule { vm_name, snapshot_name, day, interval }
            }
            Self::ListSchedules => WireAction::ListSchedules,
            Self::Health => WireAction::Health,
        }
    }
}

impl From<CommandRequest> for WireRequest {
    fn from(request: CommandRequest) -> Self {
        match request {
            CommandRequest::ListVms => Self::ListVms,
            CommandRequest::VmDetail { name } => Self::VmDetail { name },
            CommandRequest::CreateVm { spec } => Self::CreateVm { vm_data: spec },
            CommandRequest::DeleteVm { name } => Self::DeleteVm { name },
            CommandRequest::Lifecycle { name, action } => match action {
                LifecycleAction::Start => Self::StartVm { name },
                LifecycleAction::Resume => Self::ResumeVm { name },
                LifecycleAction::Reboot => Self::RebootVm { name },
                LifecycleAction::Shutdown => Self::ShutdownVm { name },
                LifecycleAction::Poweroff => Self::PoweroffVm { name },
            },
            CommandRequest::ListSnapshots { name } => Self::GetSnapshots { name },
            CommandRequest::CreateSnapshot { name, snapshot } => {
                Self::CreateSnapshots { name, snapshot }
            }
            CommandRequest::RestoreSnapshot { name, snapshot } => {
                Self::RestoreSnapshot { name, snapshot }
            }
            CommandRequest::DeleteSnapshot { name, snapshot } => {
                Self::DeleteSnapshot { name, snapshot }
            }
            CommandRequest::SampleStats { name, interval_secs } => {
                Self::SampleStats { name, interval: interval_secs }
            }
        }
    }
}

/// Server-side handling of a decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum WireAction {
    Execute(CommandRequest),
    LatestStats { name: Option<String> },
    Schedule {
        vm_name: String,
        snapshot_name: String,
        day: Option<String>,
        interval: Option<String>,
    },
    ListSchedules,
    Health,
}

/// Decode a request body. Anything that is not a known command with its
/// required fields is a `BadRequest`.
pub fn decode_request(body: &[u8]) -> Result<WireRequest, CommandError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| CommandError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let command = match value.get("command") {
        Some(Value::String(command)) => command.as_str(),
        Some(_) => return Err(CommandError::BadRequest("'command' must be a string".to_string())),
        None => return Err(CommandError::BadRequest("Missing 'command'".to_string())),
    };
    if !WireRequest::COMMANDS.contains(&command) {
        return Err(CommandError::BadRequest(format!("Unknown command '{}'", command)));
    }

    let command = command.to_string();
    serde_json::from_value(value)
        .map_err(|e| CommandError::BadRequest(format!("Invalid fields for '{}': {}", command, e)))
}

/// Wire form of a response: the payload itself, or an error object.
pub fn encode_response(response: &CommandResponse) -> Value {
    match response {
        Ok(output) => serde_json::to_value(output).unwrap_or_else(|e| {
            json!({
                "status": "error",
                "kind": "execution_error",
                "message": format!("Failed to encode response: {}", e),
            })
        }),
        Err(err) => json!({
            "status": "error",
            "kind": err.kind(),
            "message": err.message(),
        }),
    }
}

/// Inverse of [`encode_response`].
pub fn decode_response(value: Value) -> CommandResponse {
    if value.get("status").and_then(Value::as_str) == Some("error") {
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        return Err(CommandError::from_kind(kind, message)
            .unwrap_or_else(|| CommandError::ExecutionError(message.to_string())));
    }
    serde_json::from_value::<CommandOutput>(value)
        .map_err(|e| CommandError::ExecutionError(format!("Unrecognized response: {}", e)))
}
