//! Core domain types for QVM.

pub mod snapshot;
pub mod vm;

// Re-exports
pub use snapshot::{SnapshotDescriptor, StatsSample};
pub use vm::{CreateVmSpec, DiskDevice, VmDetail, VmInfo, VmState, UNKNOWN_OS};
