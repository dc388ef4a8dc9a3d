//! TCP client for the QVM daemon

use anyhow::{anyhow, Result};
use qvm_core::observability::health::HealthReport;
use qvm_core::protocol::{RemoteClient, WireRequest};
use qvm_core::scheduler::ScheduledSnapshotJob;
use qvm_core::{
    CommandError, CommandOutput, CreateVmSpec, SnapshotDescriptor, StatsSample, VmDetail, VmInfo,
};
use serde_json::Value;

/// QVM daemon client
pub struct QvmClient {
    inner: RemoteClient,
}

impl QvmClient {
    pub fn new(addr: &str) -> Self {
        Self { inner: RemoteClient::new(addr) }
    }

    /// Send a request and return the daemon's reply untouched.
    pub async fn raw(&self, request: &WireRequest) -> Result<Value> {
        self.inner.send(request).await.map_err(|e| {
            let addr = self.inner.addr();
            anyhow!("Failed to reach qvmd at {}: {}. Is the daemon running?", addr, e)
        })
    }

    /// Send a request and decode a successful reply.
    pub async fn call(&self, request: WireRequest) -> Result<CommandOutput> {
        self.inner.call(request).await.map_err(|e| match e {
            CommandError::ConnectionFailed(msg) => anyhow!("{}. Is the daemon running?", msg),
            other => anyhow!("{} ({})", other.message(), other.kind()),
        })
    }

    pub async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        match self.call(WireRequest::ListVms).await? {
            CommandOutput::Vms { vms } => Ok(vms),
            other => Err(unexpected(other)),
        }
    }

    pub async fn vm_detail(&self, name: &str) -> Result<VmDetail> {
        match self.call(WireRequest::VmDetail { name: name.to_string() }).await? {
            CommandOutput::Detail(detail) => Ok(detail),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_vm(&self, spec: CreateVmSpec) -> Result<String> {
        self.message(WireRequest::CreateVm { vm_data: spec }).await
    }

    pub async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotDescriptor>> {
        match self.call(WireRequest::GetSnapshots { name: name.to_string() }).await? {
            CommandOutput::Snapshots { snapshots } => Ok(snapshots),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sample_stats(&self, name: &str, interval: u64) -> Result<StatsSample> {
        match self.call(WireRequest::SampleStats { name: name.to_string(), interval }).await? {
            CommandOutput::Stats { stats } => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Latest background samples, for one VM or all of them.
    pub async fn latest_stats(&self, name: Option<&str>) -> Result<Vec<StatsSample>> {
        match self.call(WireRequest::LatestStats { name: name.map(str::to_string) }).await? {
            CommandOutput::Stats { stats } => Ok(vec![stats]),
            CommandOutput::Samples { samples } => Ok(samples),
            other => Err(unexpected(other)),
        }
    }

    pub async fn schedule_snapshot(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        day: Option<String>,
        interval: Option<String>,
    ) -> Result<ScheduledSnapshotJob> {
        let request = WireRequest::ScheduleSnapshot {
            vm_name: vm_name.to_string(),
            snapshot_name: snapshot_name.to_string(),
            day,
            interval,
        };
        match self.call(request).await? {
            CommandOutput::Scheduled { job, .. } => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduledSnapshotJob>> {
        match self.call(WireRequest::ListSchedules).await? {
            CommandOutput::Schedules { schedules } => Ok(schedules),
            other => Err(unexpected(other)),
        }
    }

    pub async fn health(&self) -> Result<HealthReport> {
        match self.call(WireRequest::Health).await? {
            CommandOutput::Health { health } => Ok(health),
            other => Err(unexpected(other)),
        }
    }

    /// Run a command whose reply is a plain message.
    pub async fn message(&self, request: WireRequest) -> Result<String> {
        match self.call(request).await? {
            CommandOutput::Message { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(output: CommandOutput) -> anyhow::Error {
    anyhow!("Unexpected response from daemon: {:?}", output)
}
