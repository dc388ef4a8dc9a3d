//! Hypervisor abstraction.
//!
//! QVM talks to hypervisors through three object-safe traits:
//! - [`Hypervisor`] opens connections for one URI
//! - [`HypervisorConnection`] enumerates, looks up and creates domains
//! - [`DomainHandle`] / [`SnapshotHandle`] act on a single domain or snapshot
//!
//! The traits are synchronous. Callers run them on blocking threads and own
//! the connection for exactly one command.

use crate::types::VmInfo;
use thiserror::Error;

/// Failure reported by a hypervisor backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// The hypervisor could not be reached.
    #[error("Failed to connect to hypervisor: {0}")]
    Unreachable(String),

    #[error("Domain not found: {0}")]
    NoDomain(String),

    #[error("Snapshot not found: {0}")]
    NoSnapshot(String),

    /// The operation is not valid in the domain's current state.
    #[error("Operation not valid: {0}")]
    InvalidState(String),

    /// The hypervisor rejected a definition or argument.
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("{0}")]
    Failed(String),
}

pub type HvResult<T> = std::result::Result<T, HypervisorError>;

/// A hypervisor reachable at one URI.
pub trait Hypervisor: Send + Sync {
    /// Backend name (for logging/metrics).
    fn name(&self) -> &str;

    /// URI connections are opened against.
    fn uri(&self) -> &str;

    /// Open a fresh connection.
    fn open(&self) -> HvResult<Box<dyn HypervisorConnection>>;
}

/// An open connection. Dropped or closed once per command.
pub trait HypervisorConnection: Send {
    /// All domains, active and inactive.
    fn list_domains(&self) -> HvResult<Vec<Box<dyn DomainHandle>>>;

    fn lookup_domain(&self, name: &str) -> HvResult<Box<dyn DomainHandle>>;

    /// Create and start a transient domain.
    fn create_domain(&self, xml: &str) -> HvResult<Box<dyn DomainHandle>>;

    /// Define a persistent domain without starting it.
    fn define_domain(&self, xml: &str) -> HvResult<Box<dyn DomainHandle>>;

    /// Release the connection.
    fn close(self: Box<Self>) -> HvResult<()>;
}

/// A domain on an open connection.
pub trait DomainHandle: Send {
    fn name(&self) -> HvResult<String>;

    fn info(&self) -> HvResult<VmInfo>;

    /// Current definition document.
    fn xml_desc(&self) -> HvResult<String>;

    /// Boot an inactive domain.
    fn start(&self) -> HvResult<()>;

    /// Resume a paused domain.
    fn resume(&self) -> HvResult<()>;

    fn reboot(&self) -> HvResult<()>;

    /// Ask the guest to power down.
    fn shutdown(&self) -> HvResult<()>;

    /// Stop immediately.
    fn destroy(&self) -> HvResult<()>;

    /// Remove the persistent definition.
    fn undefine(&self) -> HvResult<()>;

    /// Cumulative CPU time consumed, in nanoseconds.
    fn cpu_time_ns(&self) -> HvResult<u64>;

    /// Resident memory of the domain process, in KiB.
    fn memory_rss_kib(&self) -> HvResult<u64>;

    fn list_snapshots(&self) -> HvResult<Vec<Box<dyn SnapshotHandle>>>;

    fn create_snapshot(&self, xml: &str) -> HvResult<Box<dyn SnapshotHandle>>;

    fn lookup_snapshot(&self, name: &str) -> HvResult<Box<dyn SnapshotHandle>>;
}

/// A snapshot of one domain.
pub trait SnapshotHandle: Send {
    fn name(&self) -> HvResult<String>;

    fn xml_desc(&self) -> HvResult<String>;

    /// Return the domain to this snapshot's state.
    fn revert(&self) -> HvResult<()>;

    fn delete(&self) -> HvResult<()>;
}

pub mod memory;
pub use memory::{CallCounts, MemoryHypervisor};

#[cfg(feature = "libvirt")]
pub mod libvirt;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtHypervisor;

mod factory;
pub use factory::HypervisorFactory;
