//! Per-command hypervisor connection.

use super::CommandError;
use crate::hypervisor::{DomainHandle, Hypervisor, HypervisorConnection};
use tracing::{debug, warn};

/// A connection scoped to one command; closed when dropped.
pub struct Session {
    uri: String,
    conn: Option<Box<dyn HypervisorConnection>>,
}

impl Session {
    /// Open a connection. Failure means no hypervisor call was made.
    pub fn open(hypervisor: &dyn Hypervisor) -> Result<Self, CommandError> {
        let conn = hypervisor.open().map_err(|e| {
            CommandError::from_hypervisor(format_args!("connect to {}", hypervisor.uri()), e)
        })?;
        Ok(Self { uri: hypervisor.uri().to_string(), conn: Some(conn) })
    }

    pub fn connection(&self) -> Result<&dyn HypervisorConnection, CommandError> {
        self.conn.as_deref().ok_or_else(|| {
            CommandError::ConnectionFailed(format!("connection to {} already closed", self.uri))
        })
    }

    /// Resolve a VM by name. A missing VM is `NotFound`.
    pub fn lookup(&self, name: &str) -> Result<Box<dyn DomainHandle>, CommandError> {
        self.connection()?
            .lookup_domain(name)
            .map_err(|e| CommandError::from_hypervisor(format_args!("look up VM '{}'", name), e))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn.close() {
                Ok(()) => debug!(uri = %self.uri, "Closed hypervisor connection"),
                Err(e) => {
                    warn!(uri = %self.uri, error = %e, "Failed to close hypervisor connection")
                }
            }
        }
    }
}
