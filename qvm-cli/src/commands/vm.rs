//! `qvm ls`, `qvm inspect` and `qvm create`

use super::{done, paint_state};
use crate::client::QvmClient;
use anyhow::Result;
use colored::Colorize;
use qvm_core::CreateVmSpec;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "CPUS")]
    vcpus: u32,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "AUTOSTART")]
    autostart: String,
}

#[derive(Tabled)]
struct DiskRow {
    #[tabled(rename = "KIND")]
    kind: &'static str,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "SOURCE")]
    source: String,
}

/// List all VMs
pub async fn ls(client: &QvmClient) -> Result<()> {
    let vms = client.list_vms().await?;

    if vms.is_empty() {
        println!("No VMs defined");
        return Ok(());
    }

    let rows: Vec<VmRow> = vms
        .into_iter()
        .map(|vm| VmRow {
            name: vm.name,
            id: vm.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            state: paint_state(vm.state),
            vcpus: vm.vcpus,
            memory: format!("{}M", vm.max_memory / 1024),
            autostart: if vm.autostart { "yes" } else { "no" }.to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);

    Ok(())
}

/// Show one VM with its devices
pub async fn inspect(client: &QvmClient, name: &str) -> Result<()> {
    let detail = client.vm_detail(name).await?;
    let info = &detail.info;

    println!("{}", info.name.bold());
    println!("  UUID:      {}", info.uuid);
    println!("  State:     {}", paint_state(info.state));
    println!("  OS:        {}", detail.vm_os);
    println!("  vCPUs:     {}", info.vcpus);
    println!("  Memory:    {} / {} MB", info.memory / 1024, info.max_memory / 1024);
    println!("  Autostart: {}", info.autostart);

    let rows: Vec<DiskRow> = detail
        .disks
        .iter()
        .map(|d| ("disk", d))
        .chain(detail.cdroms.iter().map(|d| ("cdrom", d)))
        .map(|(kind, d)| DiskRow {
            kind,
            target: d.target.clone(),
            source: d.location.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::modern());
        println!("{}", table);
    }

    Ok(())
}

/// Create (and boot) a VM
pub async fn create(client: &QvmClient, spec: CreateVmSpec) -> Result<()> {
    let message = client.create_vm(spec).await?;
    done(&message);
    Ok(())
}
