//! Graceful shutdown handling for qvmd.
//!
//! Stops the snapshot timers, then waits for the background tasks (stats
//! collector, command transport) to finish when the daemon receives SIGTERM
//! or SIGINT.

use qvm_core::SnapshotScheduler;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Manages graceful shutdown of the daemon.
pub struct ShutdownManager {
    scheduler: SnapshotScheduler,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    /// How long each background task gets before it is aborted
    graceful_timeout: Duration,
}

impl ShutdownManager {
    pub fn new(scheduler: SnapshotScheduler) -> Self {
        Self { scheduler, tasks: Vec::new(), graceful_timeout: Duration::from_secs(30) }
    }

    /// Track a background task that stops on the shutdown signal.
    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    /// Stop the scheduler and wait for every tracked task.
    ///
    /// The shutdown signal must already have been broadcast.
    pub async fn shutdown(self) {
        info!("Starting graceful shutdown...");

        self.scheduler.shutdown().await;

        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(self.graceful_timeout, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => error!(task = name, error = %e, "Task failed during shutdown"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        info!("Graceful shutdown complete");
    }
}

/// Create the daemon-wide shutdown channel.
///
/// The returned sender fires once SIGTERM or SIGINT is received; tasks
/// subscribe to it at startup.
pub fn shutdown_signal() -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let notifier = tx.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = notifier.send(());
    });

    tx
}
