use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use qvm_core::protocol::WireRequest;
use qvm_core::CreateVmSpec;

mod client;
mod commands;

use client::QvmClient;

#[derive(Parser)]
#[command(name = "qvm")]
#[command(about = "QVM virtual machine management CLI", long_about = None)]
struct Cli {
    /// Daemon address (HOST:PORT)
    #[arg(long, global = true, env = "QVM_ADDR", default_value = "127.0.0.1:12345")]
    addr: String,

    /// Print the daemon's raw JSON reply
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all VMs
    Ls,

    /// Show a VM's details and devices
    Inspect {
        /// VM name
        vm: String,
    },

    /// Create and boot a VM
    Create(CreateArgs),

    /// Force-stop and undefine a VM
    Rm {
        /// VM name
        vm: String,
    },

    /// Start a VM
    Start {
        /// VM name
        vm: String,
    },

    /// Ask a VM's guest to shut down
    Stop {
        /// VM name
        vm: String,
    },

    /// Resume a paused VM
    Resume {
        /// VM name
        vm: String,
    },

    /// Reboot a VM
    Reboot {
        /// VM name
        vm: String,
    },

    /// Power a VM off immediately
    Poweroff {
        /// VM name
        vm: String,
    },

    /// Manage VM snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Manage recurring snapshots
    #[command(subcommand)]
    Schedule(ScheduleCommands),

    /// Measure a VM's CPU and memory use live
    Stats {
        /// VM name
        vm: String,

        /// Measurement window in seconds
        #[arg(short, long, default_value = "1")]
        interval: u64,
    },

    /// Show the latest background utilization samples
    Top {
        /// VM name (optional, defaults to all)
        vm: Option<String>,
    },

    /// Check daemon health
    Health,
}

#[derive(Args)]
struct CreateArgs {
    /// VM name
    name: String,

    /// Number of vCPUs
    #[arg(short, long, default_value = "1")]
    cpus: u32,

    /// Memory in MB
    #[arg(short, long, default_value = "1024")]
    memory: u64,

    /// QEMU machine type
    #[arg(long)]
    machine_type: Option<String>,

    /// Libvirt network to attach
    #[arg(long)]
    network: Option<String>,

    /// NIC model
    #[arg(long)]
    network_model: Option<String>,

    /// Define the VM persistently instead of as a transient domain
    #[arg(long)]
    persist: bool,
}

impl CreateArgs {
    /// The VM to create; memory is converted from MB to KiB.
    fn spec(&self) -> CreateVmSpec {
        let mut spec = CreateVmSpec::new(&self.name, self.cpus, self.memory * 1024);
        if let Some(machine_type) = &self.machine_type {
            spec.machine_type = machine_type.clone();
        }
        if let Some(network) = &self.network {
            spec.network_name = network.clone();
        }
        if let Some(network_model) = &self.network_model {
            spec.network_model = network_model.clone();
        }
        spec.persist = self.persist;
        spec
    }
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots of a VM
    Ls {
        /// VM name
        vm: String,
    },

    /// Take a snapshot
    Create {
        /// VM name
        vm: String,
        /// Snapshot name
        snapshot: String,
    },

    /// Revert a VM to a snapshot
    Restore {
        /// VM name
        vm: String,
        /// Snapshot name
        snapshot: String,
    },

    /// Delete a snapshot
    Rm {
        /// VM name
        vm: String,
        /// Snapshot name
        snapshot: String,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Snapshot a VM on a cron schedule
    Add {
        /// VM name
        vm: String,

        /// Snapshot name
        snapshot: String,

        /// Day-of-month cron field (default "*")
        #[arg(long)]
        day: Option<String>,

        /// Minute cron field (default "*/1")
        #[arg(long)]
        interval: Option<String>,
    },

    /// List registered schedules
    Ls,
}

impl Commands {
    /// The wire request this command sends.
    fn request(&self) -> WireRequest {
        match self {
            Commands::Ls => WireRequest::ListVms,
            Commands::Inspect { vm } => WireRequest::VmDetail { name: vm.clone() },
            Commands::Create(args) => WireRequest::CreateVm { vm_data: args.spec() },
            Commands::Rm { vm } => WireRequest::DeleteVm { name: vm.clone() },
            Commands::Start { vm } => WireRequest::StartVm { name: vm.clone() },
            Commands::Stop { vm } => WireRequest::ShutdownVm { name: vm.clone() },
            Commands::Resume { vm } => WireRequest::ResumeVm { name: vm.clone() },
            Commands::Reboot { vm } => WireRequest::RebootVm { name: vm.clone() },
            Commands::Poweroff { vm } => WireRequest::PoweroffVm { name: vm.clone() },
            Commands::Snapshot(cmd) => match cmd {
                SnapshotCommands::Ls { vm } => WireRequest::GetSnapshots { name: vm.clone() },
                SnapshotCommands::Create { vm, snapshot } => {
                    WireRequest::CreateSnapshots { name: vm.clone(), snapshot: snapshot.clone() }
                }
                SnapshotCommands::Restore { vm, snapshot } => {
                    WireRequest::RestoreSnapshot { name: vm.clone(), snapshot: snapshot.clone() }
                }
                SnapshotCommands::Rm { vm, snapshot } => {
                    WireRequest::DeleteSnapshot { name: vm.clone(), snapshot: snapshot.clone() }
                }
            },
            Commands::Schedule(cmd) => match cmd {
                ScheduleCommands::Add { vm, snapshot, day, interval } => {
                    WireRequest::ScheduleSnapshot {
                        vm_name: vm.clone(),
                        snapshot_name: snapshot.clone(),
                        day: day.clone(),
                        interval: interval.clone(),
                    }
                }
                ScheduleCommands::Ls => WireRequest::ListSchedules,
            },
            Commands::Stats { vm, interval } => {
                WireRequest::SampleStats { name: vm.clone(), interval: *interval }
            }
            Commands::Top { vm } => WireRequest::LatestStats { name: vm.clone() },
            Commands::Health => WireRequest::Health,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").with_target(false).init();

    let cli = Cli::parse();
    let client = QvmClient::new(&cli.addr);

    if cli.json {
        let reply = client.raw(&cli.command.request()).await?;
        println!("{}", serde_json::to_string_pretty(&reply)?);
        return Ok(());
    }

    match cli.command {
        Commands::Ls => commands::vm::ls(&client).await?,

        Commands::Inspect { vm } => commands::vm::inspect(&client, &vm).await?,

        Commands::Create(args) => commands::vm::create(&client, args.spec()).await?,

        Commands::Snapshot(SnapshotCommands::Ls { vm }) => {
            commands::snapshot::ls(&client, &vm).await?
        }

        Commands::Schedule(ScheduleCommands::Add { vm, snapshot, day, interval }) => {
            commands::schedule::add(&client, &vm, &snapshot, day, interval).await?;
        }

        Commands::Schedule(ScheduleCommands::Ls) => commands::schedule::ls(&client).await?,

        Commands::Stats { vm, interval } => commands::stats::sample(&client, &vm, interval).await?,

        Commands::Top { vm } => commands::stats::top(&client, vm.as_deref()).await?,

        Commands::Health => commands::system::health(&client).await?,

        // Everything else replies with a single message.
        other => {
            let message = client.message(other.request()).await?;
            commands::done(&message);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(args: &[&str]) -> WireRequest {
        Cli::try_parse_from(args).unwrap().command.request()
    }

    #[test]
    fn test_stop_is_soft_and_poweroff_is_hard() {
        let web = || "web".to_string();
        assert_eq!(request(&["qvm", "stop", "web"]), WireRequest::ShutdownVm { name: web() });
        assert_eq!(request(&["qvm", "poweroff", "web"]), WireRequest::PoweroffVm { name: web() });
    }

    #[test]
    fn test_create_converts_memory_to_kib() {
        let WireRequest::CreateVm { vm_data } =
            request(&["qvm", "create", "db", "--cpus", "2", "--memory", "2048", "--persist"])
        else {
            panic!("expected create_vm");
        };
        assert_eq!(vm_data.vcpu_count, 2);
        assert_eq!(vm_data.memory_kib, 2048 * 1024);
        assert!(vm_data.persist);
        assert_eq!(vm_data.network_name, CreateVmSpec::new("x", 1, 1).network_name);
    }

    #[test]
    fn test_schedule_fields_are_optional() {
        assert_eq!(
            request(&["qvm", "schedule", "add", "web", "nightly", "--interval", "0"]),
            WireRequest::ScheduleSnapshot {
                vm_name: "web".into(),
                snapshot_name: "nightly".into(),
                day: None,
                interval: Some("0".into()),
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["qvm", "ls", "--addr", "10.0.0.5:12345", "--json"]).unwrap();
        assert_eq!(cli.addr, "10.0.0.5:12345");
        assert!(cli.json);
    }
}
