//! Command dispatch against the hypervisor.

use super::{CommandError, CommandOutput, CommandRequest, CommandResponse, LifecycleAction, Session};
use crate::config::Config;
use crate::hypervisor::{DomainHandle, Hypervisor, HypervisorError};
use crate::observability::health::HealthChecker;
use crate::observability::{metrics, SUBSYSTEM_HYPERVISOR};
use crate::stats::UtilizationSampler;
use crate::types::{CreateVmSpec, SnapshotDescriptor, VmDetail};
use crate::xml::{self, DomainTemplate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Cumulative CPU time of one VM at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuReading {
    pub cpu_time_ns: u64,
}

/// CPU time and resident memory of one VM at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReading {
    pub cpu_time_ns: u64,
    pub rss_kib: u64,
}

/// Executes commands, one hypervisor connection per command.
///
/// Cheap to clone; clones share the hypervisor and health checker.
#[derive(Clone)]
pub struct CommandExecutor {
    hypervisor: Arc<dyn Hypervisor>,
    template: DomainTemplate,
    timeout: Duration,
    max_sample_interval_secs: u64,
    health: Option<HealthChecker>,
}

impl CommandExecutor {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, template: DomainTemplate) -> Self {
        let defaults = Config::default();
        Self {
            hypervisor,
            template,
            timeout: defaults.command_timeout(),
            max_sample_interval_secs: defaults.max_sample_interval_secs,
            health: None,
        }
    }

    /// Executor with deadlines and limits taken from `config`.
    pub fn from_config(hypervisor: Arc<dyn Hypervisor>, config: &Config) -> Self {
        Self::new(hypervisor, DomainTemplate::new(&config.images_dir))
            .with_timeout(config.command_timeout())
            .with_max_sample_interval(config.max_sample_interval_secs)
    }

    /// Deadline for each hypervisor round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_sample_interval(mut self, secs: u64) -> Self {
        self.max_sample_interval_secs = secs;
        self
    }

    /// Report connection outcomes to `health`.
    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn max_sample_interval_secs(&self) -> u64 {
        self.max_sample_interval_secs
    }

    /// Execute one command.
    #[instrument(
        skip(self, request),
        fields(command = request.kind(), vm = request.vm_name().unwrap_or("-"))
    )]
    pub async fn execute(&self, request: CommandRequest) -> CommandResponse {
        let command = request.kind();
        let start = Instant::now();

        let response = match validate(&request) {
            Err(e) => Err(e),
            Ok(()) => match request {
                CommandRequest::SampleStats { name, interval_secs } => {
                    UtilizationSampler::new(self.clone())
                        .sample(&name, interval_secs)
                        .await
                        .map(|stats| CommandOutput::Stats { stats })
                }
                other => {
                    let template = self.template.clone();
                    self.with_session(move |session| dispatch(session, &template, other)).await
                }
            },
        };

        let outcome = match &response {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::record_command(command, outcome, start.elapsed().as_secs_f64());
        match &response {
            Ok(_) => debug!(duration_ms = start.elapsed().as_millis() as u64, "Command succeeded"),
            Err(e) => warn!(kind = e.kind(), error = %e, "Command failed"),
        }
        response
    }

    /// Read a VM's cumulative CPU time on a fresh connection.
    pub async fn read_cpu(&self, name: &str) -> Result<CpuReading, CommandError> {
        let name = name.to_string();
        self.with_session(move |session| {
            let domain = session.lookup(&name)?;
            let cpu_time_ns = domain.cpu_time_ns().map_err(|e| {
                CommandError::from_hypervisor(format_args!("read CPU time of '{}'", name), e)
            })?;
            Ok(CpuReading { cpu_time_ns })
        })
        .await
    }

    /// Read a VM's CPU time and resident memory on a fresh connection.
    pub async fn read_usage(&self, name: &str) -> Result<UsageReading, CommandError> {
        let name = name.to_string();
        self.with_session(move |session| {
            let domain = session.lookup(&name)?;
            let cpu_time_ns = domain.cpu_time_ns().map_err(|e| {
                CommandError::from_hypervisor(format_args!("read CPU time of '{}'", name), e)
            })?;
            let rss_kib = domain.memory_rss_kib().map_err(|e| {
                CommandError::from_hypervisor(format_args!("read memory of '{}'", name), e)
            })?;
            Ok(UsageReading { cpu_time_ns, rss_kib })
        })
        .await
    }

    /// Run `op` on a blocking worker with a connection opened for it alone.
    ///
    /// The connection is closed when `op` returns, on every path.
    async fn with_session<T, F>(&self, op: F) -> Result<T, CommandError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, CommandError> + Send + 'static,
    {
        let hypervisor = Arc::clone(&self.hypervisor);
        let task = tokio::task::spawn_blocking(move || {
            let session = Session::open(hypervisor.as_ref()).map_err(|e| (true, e))?;
            op(&session).map_err(|e| (false, e))
        });

        let result = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                return Err(CommandError::ExecutionError(format!(
                    "hypervisor task failed: {}",
                    join_err
                )))
            }
            Err(_) => {
                return Err(CommandError::ExecutionError(format!(
                    "hypervisor did not answer within {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if let Some(health) = &self.health {
            match &result {
                Err((true, e)) => health.mark_unhealthy(SUBSYSTEM_HYPERVISOR, e.message()).await,
                _ => health.mark_healthy(SUBSYSTEM_HYPERVISOR).await,
            }
        }
        result.map_err(|(_, e)| e)
    }
}

/// Reject malformed commands before any hypervisor call.
fn validate(request: &CommandRequest) -> Result<(), CommandError> {
    if let Some(name) = request.vm_name() {
        if name.trim().is_empty() {
            return Err(CommandError::BadRequest("VM name is required".to_string()));
        }
    }
    match request {
        CommandRequest::CreateVm { spec } => validate_spec(spec),
        CommandRequest::CreateSnapshot { snapshot, .. } => {
            xml::validate_name("Snapshot", snapshot).map_err(CommandError::BadRequest)
        }
        CommandRequest::RestoreSnapshot { snapshot, .. }
        | CommandRequest::DeleteSnapshot { snapshot, .. }
            if snapshot.trim().is_empty() =>
        {
            Err(CommandError::BadRequest("Snapshot name is required".to_string()))
        }
        _ => Ok(()),
    }
}

fn validate_spec(spec: &CreateVmSpec) -> Result<(), CommandError> {
    xml::validate_name("VM", &spec.name).map_err(CommandError::BadRequest)?;
    if spec.vcpu_count == 0 {
        return Err(CommandError::BadRequest("cpus must be at least 1".to_string()));
    }
    if spec.memory_kib == 0 {
        return Err(CommandError::BadRequest("memory must be at least 1 KiB".to_string()));
    }
    for (field, value) in [
        ("machine_type", &spec.machine_type),
        ("network", &spec.network_name),
        ("network_model", &spec.network_model),
    ] {
        if value.trim().is_empty() {
            return Err(CommandError::BadRequest(format!("{} must not be empty", field)));
        }
    }
    Ok(())
}

fn dispatch(
    session: &Session,
    template: &DomainTemplate,
    request: CommandRequest,
) -> Result<CommandOutput, CommandError> {
    match request {
        CommandRequest::ListVms => list_vms(session),
        CommandRequest::VmDetail { name } => vm_detail(session, &name),
        CommandRequest::CreateVm { spec } => create_vm(session, template, &spec),
        CommandRequest::DeleteVm { name } => delete_vm(session, &name),
        CommandRequest::Lifecycle { name, action } => lifecycle(session, &name, action),
        CommandRequest::ListSnapshots { name } => list_snapshots(session, &name),
        CommandRequest::CreateSnapshot { name, snapshot } => {
            let domain = session.lookup(&name)?;
            domain.create_snapshot(&xml::snapshot_xml(&name, &snapshot)).map_err(|e| {
                let context = format!("create snapshot '{}' of '{}'", snapshot, name);
                CommandError::from_hypervisor(context, e)
            })?;
            info!(vm = %name, snapshot = %snapshot, "Snapshot created");
            Ok(CommandOutput::message(format!("Snapshot '{}' of VM '{}' created", snapshot, name)))
        }
        CommandRequest::RestoreSnapshot { name, snapshot } => {
            let snap = lookup_snapshot(session, &name, &snapshot)?;
            snap.revert().map_err(|e| {
                let context = format!("restore snapshot '{}' of '{}'", snapshot, name);
                CommandError::from_hypervisor(context, e)
            })?;
            info!(vm = %name, snapshot = %snapshot, "Snapshot restored");
            Ok(CommandOutput::message(format!("VM '{}' restored to snapshot '{}'", name, snapshot)))
        }
        CommandRequest::DeleteSnapshot { name, snapshot } => {
            let snap = lookup_snapshot(session, &name, &snapshot)?;
            snap.delete().map_err(|e| {
                let context = format!("delete snapshot '{}' of '{}'", snapshot, name);
                CommandError::from_hypervisor(context, e)
            })?;
            info!(vm = %name, snapshot = %snapshot, "Snapshot deleted");
            Ok(CommandOutput::message(format!("Snapshot '{}' of VM '{}' deleted", snapshot, name)))
        }
        CommandRequest::SampleStats { .. } => Err(CommandError::BadRequest(
            "stats sampling does not run inside a single session".to_string(),
        )),
    }
}

fn list_vms(session: &Session) -> Result<CommandOutput, CommandError> {
    let domains = session
        .connection()?
        .list_domains()
        .map_err(|e| CommandError::from_hypervisor("list VMs", e))?;

    let mut vms = Vec::with_capacity(domains.len());
    for domain in domains {
        match domain.info() {
            Ok(info) => vms.push(info),
            // Undefined between listing and inspection.
            Err(HypervisorError::NoDomain(_)) => continue,
            Err(e) => return Err(CommandError::from_hypervisor("inspect VM", e)),
        }
    }
    Ok(CommandOutput::Vms { vms })
}

fn vm_detail(session: &Session, name: &str) -> Result<CommandOutput, CommandError> {
    let domain = session.lookup(name)?;
    let context = || format!("inspect VM '{}'", name);
    let info = domain.info().map_err(|e| CommandError::from_hypervisor(context(), e))?;
    let xml_desc = domain.xml_desc().map_err(|e| CommandError::from_hypervisor(context(), e))?;

    let detail = match xml::parse_devices(&xml_desc) {
        Ok(devices) => {
            VmDetail { info, vm_os: devices.vm_os, disks: devices.disks, cdroms: devices.cdroms }
        }
        Err(reason) => {
            warn!(vm = %name, reason = %reason, "Unparsable domain XML");
            VmDetail {
                info,
                vm_os: crate::types::UNKNOWN_OS.to_string(),
                disks: vec![],
                cdroms: vec![],
            }
        }
    };
    Ok(CommandOutput::Detail(detail))
}

fn create_vm(
    session: &Session,
    template: &DomainTemplate,
    spec: &CreateVmSpec,
) -> Result<CommandOutput, CommandError> {
    let conn = session.connection()?;
    let definition = template.render(spec);

    if spec.persist {
        let domain = conn.define_domain(&definition).map_err(|e| {
            CommandError::from_hypervisor(format_args!("define VM '{}'", spec.name), e)
        })?;
        domain.start().map_err(|e| {
            CommandError::from_hypervisor(format_args!("start newly defined VM '{}'", spec.name), e)
        })?;
    } else {
        conn.create_domain(&definition).map_err(|e| {
            CommandError::from_hypervisor(format_args!("create VM '{}'", spec.name), e)
        })?;
    }

    info!(
        vm = %spec.name,
        vcpus = spec.vcpu_count,
        memory_kib = spec.memory_kib,
        persistent = spec.persist,
        "VM created"
    );
    Ok(CommandOutput::message(format!("VM '{}' created", spec.name)))
}

/// Force-stop then undefine. Both steps always run.
fn delete_vm(session: &Session, name: &str) -> Result<CommandOutput, CommandError> {
    let domain = session.lookup(name)?;
    let mut failures = Vec::new();

    match domain.destroy() {
        Ok(()) => debug!(vm = %name, "VM force-stopped"),
        Err(HypervisorError::InvalidState(_)) => debug!(vm = %name, "VM already stopped"),
        Err(e) => failures.push(format!("force-stop failed: {}", e)),
    }

    match domain.undefine() {
        Ok(()) => {}
        // A transient domain disappears once stopped.
        Err(HypervisorError::NoDomain(_)) if failures.is_empty() => {
            debug!(vm = %name, "Transient VM gone after stop")
        }
        Err(e) => failures.push(format!("undefine failed: {}", e)),
    }

    if !failures.is_empty() {
        return Err(CommandError::ExecutionError(format!(
            "delete VM '{}': {}",
            name,
            failures.join("; ")
        )));
    }
    info!(vm = %name, "VM deleted");
    Ok(CommandOutput::message(format!("VM '{}' deleted", name)))
}

fn lifecycle(
    session: &Session,
    name: &str,
    action: LifecycleAction,
) -> Result<CommandOutput, CommandError> {
    let domain = session.lookup(name)?;
    let (result, done) = match action {
        LifecycleAction::Start => (domain.start(), "started"),
        LifecycleAction::Resume => (domain.resume(), "resumed"),
        LifecycleAction::Reboot => (domain.reboot(), "rebooting"),
        LifecycleAction::Shutdown => (domain.shutdown(), "shutting down"),
        LifecycleAction::Poweroff => (domain.destroy(), "powered off"),
    };
    result
        .map_err(|e| CommandError::from_hypervisor(format_args!("{} VM '{}'", action, name), e))?;
    info!(vm = %name, action = %action, "Lifecycle action applied");
    Ok(CommandOutput::message(format!("VM '{}' {}", name, done)))
}

fn list_snapshots(session: &Session, name: &str) -> Result<CommandOutput, CommandError> {
    let domain = session.lookup(name)?;
    let context = || format!("list snapshots of '{}'", name);
    let handles =
        domain.list_snapshots().map_err(|e| CommandError::from_hypervisor(context(), e))?;

    let mut snapshots = Vec::with_capacity(handles.len());
    for handle in handles {
        let snap_name = handle.name().map_err(|e| CommandError::from_hypervisor(context(), e))?;
        let descriptor = handle
            .xml_desc()
            .ok()
            .and_then(|desc| xml::parse_snapshot(&desc, name).ok())
            .unwrap_or_else(|| SnapshotDescriptor {
                name: snap_name.clone(),
                parent_vm_name: name.to_string(),
                description: None,
                created_at: None,
            });
        snapshots.push(descriptor);
    }
    Ok(CommandOutput::Snapshots { snapshots })
}

fn lookup_snapshot(
    session: &Session,
    vm: &str,
    snapshot: &str,
) -> Result<Box<dyn crate::hypervisor::SnapshotHandle>, CommandError> {
    let domain: Box<dyn DomainHandle> = session.lookup(vm)?;
    domain.lookup_snapshot(snapshot).map_err(|e| {
        let context = format!("look up snapshot '{}' of '{}'", snapshot, vm);
        CommandError::from_hypervisor(context, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MemoryHypervisor;

    fn executor(hv: &MemoryHypervisor) -> CommandExecutor {
        CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"))
    }

    #[tokio::test]
    async fn test_empty_name_rejected_before_connecting() {
        let hv = MemoryHypervisor::new();
        let exec = executor(&hv);

        let response = exec
            .execute(CommandRequest::Lifecycle {
                name: "  ".into(),
                action: LifecycleAction::Start,
            })
            .await;
        assert!(matches!(response, Err(CommandError::BadRequest(_))));
        assert_eq!(hv.calls().open_attempts, 0);
    }

    #[tokio::test]
    async fn test_hostile_names_rejected() {
        let hv = MemoryHypervisor::new();
        let exec = executor(&hv);

        let spec = CreateVmSpec::new("web</name><evil/>", 1, 1024);
        let response = exec.execute(CommandRequest::CreateVm { spec }).await;
        assert!(matches!(response, Err(CommandError::BadRequest(_))));

        let request =
            CommandRequest::CreateSnapshot { name: "web".into(), snapshot: "../x".into() };
        assert!(matches!(exec.execute(request).await, Err(CommandError::BadRequest(_))));

        let spec = CreateVmSpec::new("web", 0, 1024);
        let response = exec.execute(CommandRequest::CreateVm { spec }).await;
        assert!(matches!(response, Err(CommandError::BadRequest(_))));
        assert_eq!(hv.calls().open_attempts, 0);
    }

    #[tokio::test]
    async fn test_each_command_closes_its_connection() {
        let hv = MemoryHypervisor::new();
        let exec = executor(&hv);

        exec.execute(CommandRequest::ListVms).await.unwrap();
        let _ = exec.execute(CommandRequest::DeleteVm { name: "missing".into() }).await;

        let calls = hv.calls();
        assert_eq!(calls.opens, 2);
        assert_eq!(calls.closes, 2);
    }

    #[tokio::test]
    async fn test_timeout_is_execution_error() {
        let hv = MemoryHypervisor::new();
        hv.set_operation_delay(Some(Duration::from_millis(300)));
        let exec = executor(&hv).with_timeout(Duration::from_millis(20));

        let response = exec.execute(CommandRequest::ListVms).await;
        assert!(matches!(response, Err(CommandError::ExecutionError(_))));
    }

    #[tokio::test]
    async fn test_health_follows_connection_outcome() {
        let hv = MemoryHypervisor::new();
        let health = HealthChecker::with_subsystems(&[SUBSYSTEM_HYPERVISOR]).await;
        let exec = executor(&hv).with_health(health.clone());

        hv.set_reachable(false);
        let _ = exec.execute(CommandRequest::ListVms).await;
        assert!(health.report().await.subsystems[0].message.is_some());

        hv.set_reachable(true);
        exec.execute(CommandRequest::ListVms).await.unwrap();
        assert!(health.report().await.subsystems[0].message.is_none());
    }
}
