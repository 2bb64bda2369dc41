use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tunnelbus_agent::{profile_channel, Profile, Worker, WorkerError};
use tunnelbus_bus::{Declaration, MemoryBus, MessageBus};
use tunnelbus_proto::topology::{http_request_queue, GET_PROJECTS_COMMAND, SERVER_BUS};
use tunnelbus_proto::ExposedProject;
use tunnelbus_relay::TcpConfig;

const TIMEOUT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn use_port_project(port: u16) -> ExposedProject {
    let json = format!(r#"{{"Id":1,"Title":"db","AppProjectType":2,"InternalPort":{port}}}"#);
    tunnelbus_proto::decode(json.as_bytes()).unwrap()
}

fn worker(bus: &MemoryBus) -> Arc<Worker> {
    let config = TcpConfig {
        listen_host: "127.0.0.1".to_string(),
        ..TcpConfig::default()
    };
    Arc::new(Worker::new(Arc::new(bus.clone()), config))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_worker_starts_relays_once_profile_is_ready() {
    let bus = MemoryBus::new();
    let worker = worker(&bus);
    let cancel = CancellationToken::new();
    let (profile_tx, profile_rx) = profile_channel();

    let running = {
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(profile_rx, cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.declarations().is_empty());

    let port = free_port();
    profile_tx
        .send(Some(Profile::new("alice", vec![use_port_project(port)])))
        .unwrap();

    eventually(|| worker.registry().listeners().contains(&port)).await;
    assert!(bus
        .declarations()
        .contains(&Declaration::Queue(http_request_queue("alice"))));

    let control_queue = Declaration::Queue(SERVER_BUS.to_string());
    eventually(|| bus.declarations().contains(&control_queue)).await;
    let mut control = bus.consume(SERVER_BUS).await.unwrap();
    let request = tokio::time::timeout(TIMEOUT, control.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&request.body[..], GET_PROJECTS_COMMAND.as_bytes());

    cancel.cancel();
    tokio::time::timeout(TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    eventually(|| worker.registry().listeners().is_empty()).await;
}

#[tokio::test]
async fn test_cancel_while_waiting_for_profile() {
    let bus = MemoryBus::new();
    let worker = worker(&bus);
    let cancel = CancellationToken::new();
    let (_profile_tx, profile_rx) = profile_channel();

    cancel.cancel();
    worker.run(profile_rx, cancel).await.unwrap();
    assert!(bus.declarations().is_empty());
}

#[tokio::test]
async fn test_profile_signal_dropped() {
    let bus = MemoryBus::new();
    let worker = worker(&bus);
    let (profile_tx, profile_rx) = profile_channel();
    drop(profile_tx);

    let result = worker.run(profile_rx, CancellationToken::new()).await;
    assert!(matches!(result, Err(WorkerError::ProfileUnavailable)));
}
