//! `qvm schedule` commands

use super::done;
use crate::client::QvmClient;
use anyhow::Result;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ScheduleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "SNAPSHOT")]
    snapshot: String,
    #[tabled(rename = "CRON")]
    cron: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

/// Register a recurring snapshot
pub async fn add(
    client: &QvmClient,
    vm: &str,
    snapshot: &str,
    day: Option<String>,
    interval: Option<String>,
) -> Result<()> {
    let job = client.schedule_snapshot(vm, snapshot, day, interval).await?;
    done(&format!(
        "Snapshot '{}' of {} scheduled: {} (job {})",
        job.snapshot_name,
        job.vm_name,
        job.cron_expression(),
        job.id
    ));
    Ok(())
}

/// List registered schedules
pub async fn ls(client: &QvmClient) -> Result<()> {
    let jobs = client.list_schedules().await?;

    if jobs.is_empty() {
        println!("No snapshot schedules");
        return Ok(());
    }

    let rows: Vec<ScheduleRow> = jobs
        .into_iter()
        .map(|job| ScheduleRow {
            cron: job.cron_expression(),
            id: job.id.chars().take(8).collect(),
            vm: job.vm_name,
            snapshot: job.snapshot_name,
            created: job.created_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);

    Ok(())
}
