//! `qvm snapshot` commands

use crate::client::QvmClient;
use anyhow::Result;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

/// List the snapshots of a VM
pub async fn ls(client: &QvmClient, vm: &str) -> Result<()> {
    let snapshots = client.list_snapshots(vm).await?;

    if snapshots.is_empty() {
        println!("No snapshots of {}", vm);
        return Ok(());
    }

    let rows: Vec<SnapshotRow> = snapshots
        .into_iter()
        .map(|s| SnapshotRow {
            name: s.name,
            created: s
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            description: s.description.unwrap_or_default(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);

    Ok(())
}
