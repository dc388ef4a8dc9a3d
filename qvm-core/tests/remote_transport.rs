//! Integration tests for the command transport over loopback TCP.

use qvm_core::command::{
    CommandError, CommandExecutor, CommandOutput, CommandRequest, LifecycleAction,
};
use qvm_core::hypervisor::MemoryHypervisor;
use qvm_core::observability::health::{HealthChecker, HealthStatus};
use qvm_core::observability::SUBSYSTEM_TRANSPORT;
use qvm_core::protocol::{send_message, RemoteClient, ServerContext, TransportServer, WireRequest};
use qvm_core::scheduler::{MemoryJobStore, SnapshotScheduler};
use qvm_core::xml::DomainTemplate;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WEB_XML: &str =
    "<domain><name>web</name><memory unit='MiB'>1024</memory><vcpu>1</vcpu></domain>";

struct TestServer {
    addr: SocketAddr,
    hv: MemoryHypervisor,
    scheduler: SnapshotScheduler,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(max_message_bytes: usize, read_timeout: Duration) -> Self {
        let hv = MemoryHypervisor::new();
        hv.seed_domain(WEB_XML, true).unwrap();

        let health = HealthChecker::with_subsystems(&[SUBSYSTEM_TRANSPORT]).await;
        let executor = CommandExecutor::new(Arc::new(hv.clone()), DomainTemplate::new("/images"));
        let scheduler = SnapshotScheduler::new(executor.clone(), Arc::new(MemoryJobStore::new()));
        let context = ServerContext::new(executor, health)
            .with_scheduler(scheduler.clone())
            .with_max_message_bytes(max_message_bytes)
            .with_read_timeout(read_timeout);

        let server = TransportServer::bind("127.0.0.1:0", Arc::new(context), 4).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            server.serve(rx).await.unwrap();
        });

        Self { addr, hv, scheduler, shutdown, handle }
    }

    fn client(&self) -> RemoteClient {
        RemoteClient::new(self.addr.to_string()).with_timeout(Duration::from_secs(10))
    }

    async fn stop(self) {
        self.scheduler.shutdown().await;
        let _ = self.shutdown.send(());
        self.handle.await.unwrap();
    }
}

/// Write `frame` as-is and read the framed JSON reply.
async fn raw_exchange(addr: SocketAddr, frame: &[u8]) -> Value {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, frame).await.unwrap();
    read_reply(&mut stream).await
}

async fn read_reply(stream: &mut TcpStream) -> Value {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_unknown_command_then_valid_request() {
    let server = TestServer::start(1024 * 1024, Duration::from_secs(5)).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    send_message(&mut stream, br#"{"command": "launch_missiles"}"#).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "bad_request");

    // The server closed that connection and keeps serving new ones.
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);

    let Ok(CommandOutput::Vms { vms }) = server.client().call(WireRequest::ListVms).await else {
        panic!("expected a VM listing");
    };
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].name, "web");

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_header_rejected_without_body() {
    let server = TestServer::start(64, Duration::from_secs(5)).await;

    // Declares 1 MiB and never sends it.
    let reply = raw_exchange(server.addr, &(1024 * 1024u32).to_be_bytes()).await;
    assert_eq!(reply["kind"], "bad_request");

    let result = server.client().call(WireRequest::Health).await;
    assert!(result.is_ok(), "{:?}", result);
    server.stop().await;
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let server = TestServer::start(1024, Duration::from_millis(200)).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply["kind"], "bad_request");
    server.stop().await;
}

#[tokio::test]
async fn test_commands_round_trip() {
    let server = TestServer::start(1024 * 1024, Duration::from_secs(5)).await;
    let client = server.client();

    let created = client
        .execute(CommandRequest::CreateSnapshot { name: "web".into(), snapshot: "daily".into() })
        .await;
    assert!(matches!(created, Ok(CommandOutput::Message { .. })), "{:?}", created);
    assert_eq!(server.hv.snapshot_names("web"), vec!["daily"]);

    let missing = client
        .execute(CommandRequest::Lifecycle { name: "ghost".into(), action: LifecycleAction::Start })
        .await;
    assert!(matches!(missing, Err(CommandError::NotFound(_))));

    let detail = client.execute(CommandRequest::VmDetail { name: "web".into() }).await;
    let Ok(CommandOutput::Detail(detail)) = detail else {
        panic!("expected VM detail");
    };
    assert_eq!(detail.info.name, "web");
    assert_eq!(detail.vm_os, "unknown");

    server.stop().await;
}

#[tokio::test]
async fn test_schedule_and_health() {
    let server = TestServer::start(1024 * 1024, Duration::from_secs(5)).await;
    let client = server.client();

    let scheduled = client
        .call(WireRequest::ScheduleSnapshot {
            vm_name: "web".into(),
            snapshot_name: "hourly".into(),
            day: None,
            interval: Some("0".into()),
        })
        .await;
    let Ok(CommandOutput::Scheduled { job, .. }) = scheduled else {
        panic!("expected a scheduled job, got {:?}", scheduled);
    };
    assert_eq!(job.cron_expression(), "0 * * * *");

    let listed = client.call(WireRequest::ListSchedules).await;
    let Ok(CommandOutput::Schedules { schedules }) = listed else {
        panic!("expected schedules");
    };
    assert_eq!(schedules, vec![job]);

    let Ok(CommandOutput::Health { health }) = client.call(WireRequest::Health).await else {
        panic!("expected a health report");
    };
    assert_eq!(health.status, HealthStatus::Healthy);

    server.stop().await;
}

#[tokio::test]
async fn test_sample_longer_than_client_timeout() {
    let server = TestServer::start(1024 * 1024, Duration::from_secs(5)).await;
    let client = RemoteClient::new(server.addr.to_string()).with_timeout(Duration::from_secs(1));

    let sampled = client.call(WireRequest::SampleStats { name: "web".into(), interval: 2 }).await;
    let Ok(CommandOutput::Stats { stats }) = sampled else {
        panic!("expected a stats sample, got {:?}", sampled);
    };
    assert_eq!(stats.vm_name, "web");
    assert_eq!(stats.sampled_at_interval_seconds, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_daemon_is_connection_failed() {
    // Bind then drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = RemoteClient::new(addr.to_string()).call(WireRequest::ListVms).await;
    assert!(matches!(result, Err(CommandError::ConnectionFailed(_))));
}
