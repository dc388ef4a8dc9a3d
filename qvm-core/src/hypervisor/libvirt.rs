//! libvirt backend (Linux, `libvirt` feature).
//!
//! Domain calls go through the `virt` bindings. The bindings expose no
//! snapshot API, so snapshot calls run `virsh -c <uri>`.

use super::{
    DomainHandle, HvResult, Hypervisor, HypervisorConnection, HypervisorError, SnapshotHandle,
};
use crate::types::{VmInfo, VmState};
use crate::xml::parse_snapshot;
use std::process::Command;
use tracing::{debug, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::sys;

/// Hypervisor reached through libvirt.
#[derive(Debug, Clone)]
pub struct LibvirtHypervisor {
    uri: String,
}

impl LibvirtHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

fn classify(err: virt::error::Error) -> HypervisorError {
    let message = err.to_string();
    match err.code() {
        ErrorNumber::NoDomain => HypervisorError::NoDomain(message),
        ErrorNumber::NoDomainSnapshot => HypervisorError::NoSnapshot(message),
        ErrorNumber::OperationInvalid => HypervisorError::InvalidState(message),
        ErrorNumber::XmlError | ErrorNumber::XmlDetail | ErrorNumber::InvalidArg => {
            HypervisorError::InvalidDefinition(message)
        }
        _ => HypervisorError::Failed(message),
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn name(&self) -> &str {
        "libvirt"
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    fn open(&self) -> HvResult<Box<dyn HypervisorConnection>> {
        let conn = Connect::open(Some(&self.uri))
            .map_err(|e| HypervisorError::Unreachable(e.to_string()))?;
        debug!("Connected to libvirt");
        Ok(Box::new(LibvirtConnection { uri: self.uri.clone(), conn }))
    }
}

struct LibvirtConnection {
    uri: String,
    conn: Connect,
}

impl LibvirtConnection {
    fn handle(&self, domain: Domain) -> Box<dyn DomainHandle> {
        Box::new(LibvirtDomain { uri: self.uri.clone(), domain })
    }
}

impl HypervisorConnection for LibvirtConnection {
    fn list_domains(&self) -> HvResult<Vec<Box<dyn DomainHandle>>> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = self.conn.list_all_domains(flags).map_err(classify)?;
        Ok(domains.into_iter().map(|d| self.handle(d)).collect())
    }

    fn lookup_domain(&self, name: &str) -> HvResult<Box<dyn DomainHandle>> {
        let domain = Domain::lookup_by_name(&self.conn, name).map_err(classify)?;
        Ok(self.handle(domain))
    }

    fn create_domain(&self, xml: &str) -> HvResult<Box<dyn DomainHandle>> {
        let domain = Domain::create_xml(&self.conn, xml, 0).map_err(classify)?;
        Ok(self.handle(domain))
    }

    fn define_domain(&self, xml: &str) -> HvResult<Box<dyn DomainHandle>> {
        let domain = Domain::define_xml(&self.conn, xml).map_err(classify)?;
        Ok(self.handle(domain))
    }

    fn close(mut self: Box<Self>) -> HvResult<()> {
        self.conn.close().map_err(classify)?;
        Ok(())
    }
}

struct LibvirtDomain {
    uri: String,
    domain: Domain,
}

impl LibvirtDomain {
    fn domain_name(&self) -> HvResult<String> {
        self.domain.get_name().map_err(classify)
    }

    fn snapshot(&self, name: String) -> HvResult<Box<dyn SnapshotHandle>> {
        Ok(Box::new(VirshSnapshot { uri: self.uri.clone(), domain: self.domain_name()?, name }))
    }
}

impl DomainHandle for LibvirtDomain {
    fn name(&self) -> HvResult<String> {
        self.domain_name()
    }

    fn info(&self) -> HvResult<VmInfo> {
        let info = self.domain.get_info().map_err(classify)?;
        Ok(VmInfo {
            name: self.domain_name()?,
            id: self.domain.get_id(),
            uuid: self.domain.get_uuid_string().map_err(classify)?,
            state: VmState::from_code(info.state),
            max_memory: info.max_mem,
            memory: info.memory,
            vcpus: info.nr_virt_cpu,
            autostart: self.domain.get_autostart().map_err(classify)?,
        })
    }

    fn xml_desc(&self) -> HvResult<String> {
        self.domain.get_xml_desc(0).map_err(classify)
    }

    fn start(&self) -> HvResult<()> {
        self.domain.create().map(|_| ()).map_err(classify)
    }

    fn resume(&self) -> HvResult<()> {
        self.domain.resume().map(|_| ()).map_err(classify)
    }

    fn reboot(&self) -> HvResult<()> {
        self.domain.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT).map_err(classify)
    }

    fn shutdown(&self) -> HvResult<()> {
        self.domain.shutdown().map(|_| ()).map_err(classify)
    }

    fn destroy(&self) -> HvResult<()> {
        self.domain.destroy().map_err(classify)
    }

    fn undefine(&self) -> HvResult<()> {
        self.domain.undefine().map_err(classify)
    }

    fn cpu_time_ns(&self) -> HvResult<u64> {
        let info = self.domain.get_info().map_err(classify)?;
        if !VmState::from_code(info.state).is_active() {
            return Err(HypervisorError::InvalidState("domain is not running".to_string()));
        }
        Ok(info.cpu_time)
    }

    fn memory_rss_kib(&self) -> HvResult<u64> {
        let stats = self.domain.memory_stats(0).map_err(classify)?;
        stats
            .iter()
            .find(|s| s.tag == sys::VIR_DOMAIN_MEMORY_STAT_RSS as i32)
            .map(|s| s.val)
            .ok_or_else(|| HypervisorError::Failed("domain reports no rss statistic".to_string()))
    }

    fn list_snapshots(&self) -> HvResult<Vec<Box<dyn SnapshotHandle>>> {
        let domain = self.domain_name()?;
        let output = virsh(&self.uri, &["snapshot-list", &domain, "--name"])?;
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|name| self.snapshot(name.to_string()))
            .collect()
    }

    fn create_snapshot(&self, xml: &str) -> HvResult<Box<dyn SnapshotHandle>> {
        let domain = self.domain_name()?;
        let request = parse_snapshot(xml, &domain).map_err(HypervisorError::InvalidDefinition)?;
        let mut args = vec!["snapshot-create-as", domain.as_str(), "--name", request.name.as_str()];
        if let Some(description) = request.description.as_deref() {
            args.extend(["--description", description]);
        }
        virsh(&self.uri, &args)?;
        self.snapshot(request.name.clone())
    }

    fn lookup_snapshot(&self, name: &str) -> HvResult<Box<dyn SnapshotHandle>> {
        let domain = self.domain_name()?;
        virsh(&self.uri, &["snapshot-info", &domain, "--snapshotname", name])?;
        self.snapshot(name.to_string())
    }
}

struct VirshSnapshot {
    uri: String,
    domain: String,
    name: String,
}

impl SnapshotHandle for VirshSnapshot {
    fn name(&self) -> HvResult<String> {
        Ok(self.name.clone())
    }

    fn xml_desc(&self) -> HvResult<String> {
        virsh(&self.uri, &["snapshot-dumpxml", &self.domain, "--snapshotname", &self.name])
    }

    fn revert(&self) -> HvResult<()> {
        virsh(&self.uri, &["snapshot-revert", &self.domain, "--snapshotname", &self.name])?;
        Ok(())
    }

    fn delete(&self) -> HvResult<()> {
        virsh(&self.uri, &["snapshot-delete", &self.domain, "--snapshotname", &self.name])?;
        Ok(())
    }
}

/// Run `virsh -c <uri> <args>` and return its stdout.
fn virsh(uri: &str, args: &[&str]) -> HvResult<String> {
    debug!(uri = %uri, args = ?args, "Running virsh");
    let output = Command::new("virsh")
        .arg("-c")
        .arg(uri)
        .args(args)
        .output()
        .map_err(|e| HypervisorError::Failed(format!("virsh command failed: {}", e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(if stderr.contains("no domain snapshot with matching name") {
        HypervisorError::NoSnapshot(stderr)
    } else if stderr.contains("no domain with matching name")
        || stderr.contains("failed to get domain")
    {
        HypervisorError::NoDomain(stderr)
    } else if stderr.contains("Requested operation is not valid") {
        HypervisorError::InvalidState(stderr)
    } else if stderr.contains("failed to connect") {
        HypervisorError::Unreachable(stderr)
    } else {
        HypervisorError::Failed(stderr)
    })
}
