//! Hypervisor selection by URI.

use crate::error::{QvmError, Result};
use crate::hypervisor::{Hypervisor, MemoryHypervisor};
use std::sync::Arc;
use tracing::{info, instrument};

/// Factory for creating hypervisor backends.
///
/// - `memory://...` → [`MemoryHypervisor`]
/// - `qemu://...`, `qemu+ssh://...` → `LibvirtHypervisor` (requires the `libvirt` feature)
pub struct HypervisorFactory;

impl HypervisorFactory {
    #[instrument]
    pub fn create(uri: &str) -> Result<Arc<dyn Hypervisor>> {
        let scheme = uri.split("://").next().unwrap_or_default();
        if !uri.contains("://") {
            return Err(QvmError::UnsupportedHypervisor {
                uri: uri.to_string(),
                reason: "URI has no scheme".to_string(),
            });
        }

        match scheme {
            "memory" => {
                info!(uri = %uri, "Using in-memory hypervisor");
                Ok(Arc::new(MemoryHypervisor::with_uri(uri)))
            }
            s if s == "qemu" || s.starts_with("qemu+") => Self::create_libvirt(uri),
            other => Err(QvmError::UnsupportedHypervisor {
                uri: uri.to_string(),
                reason: format!("unknown scheme '{}'", other),
            }),
        }
    }

    #[cfg(feature = "libvirt")]
    fn create_libvirt(uri: &str) -> Result<Arc<dyn Hypervisor>> {
        info!(uri = %uri, "Using libvirt hypervisor");
        Ok(Arc::new(crate::hypervisor::LibvirtHypervisor::new(uri)))
    }

    #[cfg(not(feature = "libvirt"))]
    fn create_libvirt(uri: &str) -> Result<Arc<dyn Hypervisor>> {
        Err(QvmError::UnsupportedHypervisor {
            uri: uri.to_string(),
            reason: "built without the `libvirt` feature".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_uri() {
        let hv = HypervisorFactory::create("memory://").unwrap();
        assert_eq!(hv.name(), "memory");
        assert_eq!(hv.uri(), "memory://");
    }

    #[test]
    fn test_unsupported_uris() {
        assert!(matches!(
            HypervisorFactory::create("xen:///system"),
            Err(QvmError::UnsupportedHypervisor { .. })
        ));
        assert!(HypervisorFactory::create("qemu").is_err());
    }

    #[cfg(not(feature = "libvirt"))]
    #[test]
    fn test_qemu_requires_feature() {
        assert!(HypervisorFactory::create("qemu:///system").is_err());
    }
}
