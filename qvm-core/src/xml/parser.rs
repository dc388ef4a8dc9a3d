//! Extraction of VM details from hypervisor definition documents.

use crate::types::{DiskDevice, SnapshotDescriptor, UNKNOWN_OS};
use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};

/// Namespace of libosinfo guest metadata.
pub const LIBOSINFO_NS: &str = "http://libosinfo.org/xmlns/libvirt/domain/1.0";

/// Devices and declared OS of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDevices {
    pub vm_os: String,
    pub disks: Vec<DiskDevice>,
    pub cdroms: Vec<DiskDevice>,
}

/// Identity and sizing read from a domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDefinition {
    pub name: String,
    pub memory_kib: u64,
    pub vcpus: u32,
}

/// Split a domain's disks from its optical drives and read the OS id.
///
/// Disks without a `<target dev>` are skipped. An absent OS declaration
/// yields [`UNKNOWN_OS`].
pub fn parse_devices(xml: &str) -> Result<DomainDevices, String> {
    let doc = Document::parse(xml).map_err(|e| format!("invalid domain XML: {}", e))?;
    let root = doc.root_element();

    let mut disks = Vec::new();
    let mut cdroms = Vec::new();
    let disk_nodes = child(root, "devices")
        .into_iter()
        .flat_map(|devices| devices.children().filter(|n| n.has_tag_name("disk")));

    for disk in disk_nodes {
        let Some(target) = child(disk, "target").and_then(|t| t.attribute("dev")) else {
            continue;
        };
        let location = child(disk, "source").and_then(|s| {
            s.attribute("file").or_else(|| s.attribute("dev")).or_else(|| s.attribute("name"))
        });
        let device = DiskDevice {
            target: target.to_string(),
            location: location.map(str::to_string),
        };
        if disk.attribute("device") == Some("cdrom") {
            cdroms.push(device);
        } else {
            disks.push(device);
        }
    }

    let vm_os = os_id(&doc).unwrap_or_else(|| UNKNOWN_OS.to_string());
    Ok(DomainDevices { vm_os, disks, cdroms })
}

fn os_id(doc: &Document<'_>) -> Option<String> {
    doc.descendants()
        .find(|n| n.has_tag_name((LIBOSINFO_NS, "os")))
        .and_then(|n| n.attribute("id"))
        .map(str::to_string)
}

/// Read name, memory and vCPU count from a domain definition.
pub fn parse_domain_definition(xml: &str) -> Result<DomainDefinition, String> {
    let doc = Document::parse(xml).map_err(|e| format!("invalid domain XML: {}", e))?;
    let root = doc.root_element();
    if !root.has_tag_name("domain") {
        return Err(format!("expected <domain>, found <{}>", root.tag_name().name()));
    }

    let name = child_text(root, "name").ok_or("domain definition has no <name>")?;

    let memory = child(root, "memory").ok_or("domain definition has no <memory>")?;
    let amount: u64 = memory
        .text()
        .map(str::trim)
        .and_then(|t| t.parse().ok())
        .ok_or("domain <memory> is not a number")?;
    let memory_kib = to_kib(amount, memory.attribute("unit").unwrap_or("KiB"))?;

    let vcpus = match child_text(root, "vcpu") {
        Some(text) => {
            text.parse().map_err(|_| format!("domain <vcpu> '{}' is not a number", text))?
        }
        None => 1,
    };

    Ok(DomainDefinition { name, memory_kib, vcpus })
}

/// Read a snapshot definition as returned by the hypervisor.
pub fn parse_snapshot(xml: &str, vm: &str) -> Result<SnapshotDescriptor, String> {
    let doc = Document::parse(xml).map_err(|e| format!("invalid snapshot XML: {}", e))?;
    let root = doc.root_element();
    let name = child_text(root, "name").ok_or("snapshot definition has no <name>")?;
    let created_at = child_text(root, "creationTime")
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Ok(SnapshotDescriptor {
        name,
        parent_vm_name: vm.to_string(),
        description: child_text(root, "description"),
        created_at,
    })
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    child(node, tag)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn to_kib(amount: u64, unit: &str) -> Result<u64, String> {
    let factor_bytes: u64 = match unit {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "TB" => 1_000_000_000_000,
        "T" | "TiB" => 1 << 40,
        other => return Err(format!("unknown memory unit '{}'", other)),
    };
    Ok(amount.saturating_mul(factor_bytes) / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAILED: &str = r#"
<domain type='kvm' id='3'>
  <name>desk</name>
  <memory unit='GiB'>2</memory>
  <vcpu placement='static'>4</vcpu>
  <metadata>
    <libosinfo:libosinfo xmlns:libosinfo="http://libosinfo.org/xmlns/libvirt/domain/1.0">
      <libosinfo:os id="http://ubuntu.com/ubuntu/22.04"/>
    </libosinfo:libosinfo>
  </metadata>
  <devices>
    <disk type='file' device='disk'>
      <source file='/images/desk.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/iso/ubuntu.iso'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='sdb' bus='sata'/>
    </disk>
  </devices>
</domain>"#;

    #[test]
    fn test_devices_split_disks_and_cdroms() {
        let devices = parse_devices(DETAILED).unwrap();
        assert_eq!(devices.vm_os, "http://ubuntu.com/ubuntu/22.04");
        assert_eq!(
            devices.disks,
            vec![DiskDevice { target: "vda".into(), location: Some("/images/desk.qcow2".into()) }]
        );
        assert_eq!(devices.cdroms.len(), 2);
        assert_eq!(devices.cdroms[0].location.as_deref(), Some("/iso/ubuntu.iso"));
        assert_eq!(devices.cdroms[1].location, None);
    }

    #[test]
    fn test_missing_os_is_unknown() {
        let devices = parse_devices("<domain><name>x</name></domain>").unwrap();
        assert_eq!(devices.vm_os, UNKNOWN_OS);
        assert!(devices.disks.is_empty());
        assert!(devices.cdroms.is_empty());
    }

    #[test]
    fn test_os_outside_namespace_is_ignored() {
        let xml = "<domain><metadata><os id='fake'/></metadata></domain>";
        assert_eq!(parse_devices(xml).unwrap().vm_os, UNKNOWN_OS);
    }

    #[test]
    fn test_definition_units() {
        let def = parse_domain_definition(DETAILED).unwrap();
        assert_eq!(def.name, "desk");
        assert_eq!(def.memory_kib, 2 * 1024 * 1024);
        assert_eq!(def.vcpus, 4);

        let def =
            parse_domain_definition("<domain><name>a</name><memory>512</memory></domain>").unwrap();
        assert_eq!(def.memory_kib, 512);
        assert_eq!(def.vcpus, 1);

        assert!(parse_domain_definition("<domain><memory>1</memory></domain>").is_err());
        assert!(parse_domain_definition("<domainsnapshot/>").is_err());
        assert!(parse_domain_definition("<domain").is_err());
    }

    #[test]
    fn test_snapshot_descriptor() {
        let xml = "<domainsnapshot><name>nightly</name><description>Snapshot of web</description>\
                   <creationTime>1700000000</creationTime></domainsnapshot>";
        let snap = parse_snapshot(xml, "web").unwrap();
        assert_eq!(snap.name, "nightly");
        assert_eq!(snap.parent_vm_name, "web");
        assert_eq!(snap.description.as_deref(), Some("Snapshot of web"));
        assert_eq!(snap.created_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }
}
