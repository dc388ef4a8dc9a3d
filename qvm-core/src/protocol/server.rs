//! TCP command server.

use super::wire::{decode_request, encode_response, WireAction, WireRequest};
use super::{recv_message, send_json, DEFAULT_MAX_MESSAGE_BYTES};
use crate::command::{CommandError, CommandExecutor, CommandOutput, CommandResponse};
use crate::error::{QvmError, Result};
use crate::observability::health::HealthChecker;
use crate::observability::{metrics, SUBSYSTEM_TRANSPORT};
use crate::scheduler::SnapshotScheduler;
use crate::stats::StatsCollector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Everything a request can reach. Built once by the daemon and shared by
/// every connection.
pub struct ServerContext {
    executor: CommandExecutor,
    scheduler: Option<SnapshotScheduler>,
    collector: Option<StatsCollector>,
    health: HealthChecker,
    max_message_bytes: usize,
    read_timeout: Duration,
}

impl ServerContext {
    pub fn new(executor: CommandExecutor, health: HealthChecker) -> Self {
        Self {
            executor,
            scheduler: None,
            collector: None,
            health,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            read_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SnapshotScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_collector(mut self, collector: StatsCollector) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Decode and handle one request body.
    pub async fn handle_bytes(&self, body: &[u8]) -> CommandResponse {
        match decode_request(body) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                metrics::record_bad_request();
                Err(e)
            }
        }
    }

    /// Handle one decoded request.
    pub async fn handle(&self, request: WireRequest) -> CommandResponse {
        match request.into_action() {
            WireAction::Execute(request) => self.executor.execute(request).await,
            WireAction::LatestStats { name } => self.latest_stats(name).await,
            WireAction::Schedule { vm_name, snapshot_name, day, interval } => {
                let scheduler = self.scheduler()?;
                let job = scheduler
                    .register(&vm_name, &snapshot_name, day.as_deref(), interval.as_deref())
                    .await
                    .map_err(|e| match e {
                        QvmError::InvalidJob { .. } | QvmError::InvalidSchedule { .. } => {
                            CommandError::BadRequest(e.to_string())
                        }
                        other => CommandError::ExecutionError(format!(
                            "Failed to schedule snapshot: {}",
                            other
                        )),
                    })?;
                Ok(CommandOutput::Scheduled {
                    message: format!(
                        "Snapshot '{}' of VM '{}' scheduled ({})",
                        job.snapshot_name,
                        job.vm_name,
                        job.cron_expression()
                    ),
                    job,
                })
            }
            WireAction::ListSchedules => {
                Ok(CommandOutput::Schedules { schedules: self.scheduler()?.jobs().await })
            }
            WireAction::Health => Ok(CommandOutput::Health { health: self.health.report().await }),
        }
    }

    fn scheduler(&self) -> std::result::Result<&SnapshotScheduler, CommandError> {
        self.scheduler.as_ref().ok_or_else(|| {
            CommandError::ExecutionError("Snapshot scheduling is disabled".to_string())
        })
    }

    async fn latest_stats(&self, name: Option<String>) -> CommandResponse {
        let collector = self.collector.as_ref().ok_or_else(|| {
            CommandError::ExecutionError("Background stats collection is disabled".to_string())
        })?;

        match name {
            Some(name) => match collector.latest(&name).await {
                Some(stats) => Ok(CommandOutput::Stats { stats }),
                None => {
                    Err(CommandError::NotFound(format!("No stats collected for VM '{}'", name)))
                }
            },
            None => Ok(CommandOutput::Samples { samples: collector.all().await }),
        }
    }
}

/// Accepts connections and serves one request per connection.
pub struct TransportServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
    max_connections: usize,
    drain_timeout: Duration,
}

impl TransportServer {
    pub async fn bind(
        addr: &str,
        context: Arc<ServerContext>,
        max_connections: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| QvmError::Transport(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            context,
            max_connections: max_connections.max(1),
            drain_timeout: Duration::from_secs(30),
        })
    }

    /// How long `serve` waits for in-flight connections after shutdown.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(QvmError::transport)
    }

    /// Serve until `shutdown` fires, then wait for in-flight connections.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = self.local_addr()?;
        let slots = Arc::new(Semaphore::new(self.max_connections));
        let mut accept_health = AcceptHealth::new(self.context.health.clone());
        self.context.health.mark_healthy(SUBSYSTEM_TRANSPORT).await;
        info!(%addr, max_connections = self.max_connections, "Command transport listening");

        loop {
            // Wait for a free slot before accepting, so excess clients queue in the backlog.
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit.map_err(QvmError::internal)?,
                _ = shutdown.recv() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => {
                        accept_health.accepted().await;
                        accepted
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        accept_health.failed(&e).await;
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };

            metrics::record_connection();
            let context = self.context.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_connection(stream, peer, &context).await;
            });
        }

        info!("Command transport stopping");
        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        if tokio::time::timeout(self.drain_timeout, slots.acquire_many(all)).await.is_err() {
            warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                "In-flight connections did not finish"
            );
        }
        Ok(())
    }
}

/// Transport health as seen by the accept loop. A failed accept marks the
/// transport unhealthy until the next one succeeds.
struct AcceptHealth {
    health: HealthChecker,
    failing: bool,
}

impl AcceptHealth {
    fn new(health: HealthChecker) -> Self {
        Self { health, failing: false }
    }

    async fn failed(&mut self, err: &std::io::Error) {
        self.failing = true;
        self.health.mark_unhealthy(SUBSYSTEM_TRANSPORT, format!("accept failed: {}", err)).await;
    }

    async fn accepted(&mut self) {
        if self.failing {
            self.failing = false;
            self.health.mark_healthy(SUBSYSTEM_TRANSPORT).await;
            info!("Command transport accepting again");
        }
    }
}

#[instrument(skip(stream, context), fields(%peer))]
async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, context: &ServerContext) {
    let read = recv_message(&mut stream, context.max_message_bytes);
    let received = tokio::time::timeout(context.read_timeout, read).await;

    let response = match received {
        Ok(Ok(body)) => context.handle_bytes(&body).await,
        Ok(Err(QvmError::MessageTooLarge { len, limit })) => {
            metrics::record_bad_request();
            warn!(len, limit, "Rejected oversized request");
            Err(CommandError::BadRequest(format!(
                "Message of {} bytes exceeds the {} byte limit",
                len, limit
            )))
        }
        Ok(Err(e)) => {
            // Nothing useful to answer: the peer went away mid-frame.
            metrics::record_bad_request();
            debug!(error = %e, "Failed to read request");
            return;
        }
        Err(_) => {
            metrics::record_bad_request();
            warn!(
                timeout_secs = context.read_timeout.as_secs(),
                "Client did not send a request in time"
            );
            Err(CommandError::BadRequest("Timed out waiting for request".to_string()))
        }
    };

    if let Err(e) = send_json(&mut stream, &encode_response(&response)).await {
        debug!(error = %e, "Failed to write response");
        return;
    }
    if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut stream).await {
        debug!(error = %e, "Failed to close connection");
    }
}
