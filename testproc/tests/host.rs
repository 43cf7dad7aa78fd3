use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetload_common::{
    Envelope, FleetConfig, MessageType, ProcessConfig, ProcessIds, ProcessOutcome, ProfileEvent,
    StatusReport,
};
use fleetload_testproc::{LoggingDriver, TestProcessHost, LATENCY_PROPERTY};
use fleetload_transport::{listener_fn, TransportClient, TransportConfig};
use fleetloadd::Relay;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;

const SECRET: &str = "testproc-secret";

fn fleet_config(start_timeout_ms: u64) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.process.start_timeout_ms = start_timeout_ms;
    config.process.disconnect_ack_timeout_ms = 1_000;
    config.transport.disconnect_timeout_ms = 500;
    config
}

async fn daemon() -> Result<(Arc<Relay>, String)> {
    let relay = Arc::new(Relay::new(
        1,
        "127.0.0.1:0",
        SECRET,
        TransportConfig::from(&fleet_config(0).transport),
    ));
    let addr = relay.start().await?;
    Ok((relay, addr.to_string()))
}

async fn console(addr: &str) -> Result<(TransportClient, UnboundedReceiver<Envelope>)> {
    let (tx, rx) = unbounded_channel();
    let client = TransportClient::new(
        addr,
        "console1",
        SECRET,
        TransportConfig::from(&fleet_config(0).transport),
    );
    client.add_listener(listener_fn(move |_, envelope| {
        let _ = tx.send(envelope.clone());
    }));
    client.connect().await?;
    client.wait_handshake().await?;
    Ok((client, rx))
}

async fn next(rx: &mut UnboundedReceiver<Envelope>) -> Result<Envelope> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("nothing received")?
        .context("channel closed")
}

fn event(offset_ms: u64, operation: &str, process_id: u32) -> ProfileEvent {
    ProfileEvent {
        offset_ms,
        operation: operation.to_string(),
        target: "http://target.local".to_string(),
        daemon_id: 1,
        process_id,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_runs_its_share_of_the_profile() -> Result<()> {
    let (_relay, addr) = daemon().await?;
    let (console, mut console_rx) = console(&addr).await?;

    let mut properties = BTreeMap::new();
    properties.insert(LATENCY_PROPERTY.to_string(), "10".to_string());
    let config = ProcessConfig {
        events: vec![
            event(0, "login", 1),
            event(20, "browse", 1),
            event(10, "login", 2),
        ],
        properties,
    };
    console.send(Envelope::config(&config)?).await?;

    let ids = ProcessIds::new(1, 1);
    let host = TestProcessHost::new(ids, addr.as_str(), SECRET, fleet_config(5_000));
    let driver = Arc::new(LoggingDriver::new());
    let run = tokio::spawn(host.run(driver.clone()));

    let ready: ProcessIds = next(&mut console_rx).await?.decode_as(MessageType::Ready)?;
    assert_eq!(ready, ids);
    console.send(Envelope::signal(MessageType::Start)).await?;

    for done in 1..=2 {
        let progress: StatusReport =
            next(&mut console_rx).await?.decode_as(MessageType::Status)?;
        assert_eq!(progress.outcome, None);
        assert_eq!(progress.message, format!("{done}/2 operations done"));
    }
    let status: StatusReport = next(&mut console_rx).await?.decode_as(MessageType::Status)?;
    assert_eq!(status.outcome, Some(ProcessOutcome::Successful));
    let gone: ProcessIds = next(&mut console_rx)
        .await?
        .decode_as(MessageType::Disconnected)?;
    assert_eq!(gone, ids);

    let outcome = timeout(Duration::from_secs(5), run).await???;
    assert_eq!(outcome, ProcessOutcome::Successful);
    assert_eq!(driver.executed(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_before_config_ends_with_error() -> Result<()> {
    let (relay, addr) = daemon().await?;
    let (console, mut console_rx) = console(&addr).await?;

    let ids = ProcessIds::new(4, 1);
    let host = TestProcessHost::new(ids, addr.as_str(), SECRET, fleet_config(5_000));
    let run = tokio::spawn(host.run(Arc::new(LoggingDriver::new())));
    timeout(Duration::from_secs(2), async {
        while relay.test_process_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("test process never connected")?;

    console.send(Envelope::signal(MessageType::Abort)).await?;
    let error: StatusReport = next(&mut console_rx).await?.decode_as(MessageType::Error)?;
    assert_eq!(error.process_id, 4);
    let status: StatusReport = next(&mut console_rx).await?.decode_as(MessageType::Status)?;
    assert_eq!(status.outcome, Some(ProcessOutcome::Error));
    assert!(next(&mut console_rx).await?.is(MessageType::Disconnected));

    let outcome = timeout(Duration::from_secs(5), run).await???;
    assert_eq!(outcome, ProcessOutcome::Error);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_config_times_out_as_error() -> Result<()> {
    let (_relay, addr) = daemon().await?;
    let ids = ProcessIds::new(5, 1);
    let host = TestProcessHost::new(ids, addr.as_str(), SECRET, fleet_config(200));
    let run = host.run(Arc::new(LoggingDriver::new()));
    let outcome = timeout(Duration::from_secs(5), run).await??;
    assert_eq!(outcome, ProcessOutcome::Error);
    Ok(())
}

#[tokio::test]
async fn unreachable_daemon_is_an_error() {
    let host = TestProcessHost::new(
        ProcessIds::new(6, 1),
        "127.0.0.1:1",
        SECRET,
        fleet_config(200),
    );
    let err = host
        .run(Arc::new(LoggingDriver::new()))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("failed to connect"));
}
