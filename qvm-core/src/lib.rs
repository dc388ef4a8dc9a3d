//! QVM Core Library
//!
//! Command dispatch against a libvirt-style hypervisor, the remote command
//! transport, utilization sampling, and recurring snapshot scheduling.

pub mod command;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod observability;
pub mod paths;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod types;
pub mod xml;

// Re-export commonly used items
pub use command::{
    CommandError, CommandExecutor, CommandOutput, CommandRequest, CommandResponse, LifecycleAction,
};
pub use config::Config;
pub use error::{QvmError, Result};
pub use hypervisor::{Hypervisor, HypervisorError, HypervisorFactory, MemoryHypervisor};
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use protocol::{RemoteClient, ServerContext, TransportServer, WireRequest};
pub use scheduler::{JsonJobStore, ScheduledSnapshotJob, SnapshotScheduler};
pub use stats::{StatsCollector, UtilizationSampler};
pub use types::{CreateVmSpec, SnapshotDescriptor, StatsSample, VmDetail, VmInfo, VmState};
pub use xml::DomainTemplate;
