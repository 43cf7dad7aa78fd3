use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetload_common::{
    ClientCount, Envelope, MessageType, ProcessConfig, ProcessIds, ProcessOutcome, StatusReport,
};
use fleetload_transport::{listener_fn, TransportClient, TransportConfig};
use fleetloadd::Relay;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;

const SECRET: &str = "relay-test-secret";

fn config() -> TransportConfig {
    TransportConfig {
        handshake_timeout: Duration::from_secs(2),
        disconnect_timeout: Duration::from_millis(500),
        ..TransportConfig::default()
    }
}

async fn start_relay() -> Result<(Arc<Relay>, String)> {
    let relay = Arc::new(Relay::new(1, "127.0.0.1:0", SECRET, config()));
    let addr = relay.start().await?;
    Ok((relay, addr.to_string()))
}

async fn peer(
    addr: &str,
    client_id: &str,
) -> Result<(TransportClient, UnboundedReceiver<Envelope>)> {
    let (tx, rx) = unbounded_channel();
    let client = TransportClient::new(addr, client_id, SECRET, config());
    client.add_listener(listener_fn(move |_, envelope| {
        let _ = tx.send(envelope.clone());
    }));
    client.connect().await?;
    client.wait_handshake().await?;
    Ok((client, rx))
}

async fn next(rx: &mut UnboundedReceiver<Envelope>) -> Result<Envelope> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .context("nothing received")?
        .context("channel closed")
}

async fn nothing_more(rx: &mut UnboundedReceiver<Envelope>) -> bool {
    timeout(Duration::from_millis(200), rx.recv()).await.is_err()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_control_reaches_every_test_process() -> Result<()> {
    let (_relay, addr) = start_relay().await?;
    let (console, mut console_rx) = peer(&addr, "console1").await?;
    let (_p1, mut p1_rx) = peer(&addr, "testproc1").await?;
    let (_p2, mut p2_rx) = peer(&addr, "testproc2").await?;

    console.send(Envelope::config(&ProcessConfig::default())?).await?;
    console.send(Envelope::signal(MessageType::Start)).await?;
    for rx in [&mut p1_rx, &mut p2_rx] {
        assert_eq!(next(rx).await?.msg_type(), MessageType::Config);
        assert_eq!(next(rx).await?.msg_type(), MessageType::Start);
    }

    console.send(Envelope::signal(MessageType::ClientCount)).await?;
    let reply = next(&mut console_rx).await?;
    let count: ClientCount = reply.decode_as(MessageType::ClientCount)?;
    assert_eq!(count.count, 2);

    assert!(nothing_more(&mut console_rx).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_goes_to_consoles_and_disconnect_is_acknowledged() -> Result<()> {
    let (_relay, addr) = start_relay().await?;
    let (_console, mut console_rx) = peer(&addr, "console1").await?;
    let (p1, mut p1_rx) = peer(&addr, "testproc1").await?;
    let (_p2, mut p2_rx) = peer(&addr, "testproc2").await?;
    let ids = ProcessIds::new(1, 1);

    p1.send(Envelope::ready(ids)?).await?;
    let report = StatusReport::new(ids, "done").with_outcome(ProcessOutcome::Successful);
    p1.send(Envelope::status(&report)?).await?;
    p1.send(Envelope::disconnected(ids)?).await?;

    assert_eq!(next(&mut console_rx).await?.msg_type(), MessageType::Ready);
    let status: StatusReport = next(&mut console_rx).await?.decode_as(MessageType::Status)?;
    assert_eq!(status.outcome, Some(ProcessOutcome::Successful));
    let forwarded: ProcessIds = next(&mut console_rx)
        .await?
        .decode_as(MessageType::Disconnected)?;
    assert_eq!(forwarded, ids);

    let ack: ProcessIds = next(&mut p1_rx).await?.decode_as(MessageType::Disconnected)?;
    assert_eq!(ack, ids);
    assert!(nothing_more(&mut p2_rx).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_test_process_gets_the_last_config_on_connect() -> Result<()> {
    let (_relay, addr) = start_relay().await?;
    let (console, _console_rx) = peer(&addr, "console1").await?;
    console.send(Envelope::jar(b"artifact")).await?;
    let mut config = ProcessConfig::default();
    config
        .properties
        .insert("driver.simulated_latency_ms".into(), "5".into());
    console.send(Envelope::config(&config)?).await?;

    let (late, mut late_rx) = peer(&addr, "testproc7").await?;
    assert!(nothing_more(&mut late_rx).await);
    late.send(Envelope::with_payload(
        MessageType::Connect,
        &ProcessIds::new(7, 1),
    )?)
    .await?;

    assert_eq!(next(&mut late_rx).await?.jar_bytes()?, b"artifact".to_vec());
    let replayed: ProcessConfig = next(&mut late_rx).await?.decode_as(MessageType::Config)?;
    assert_eq!(replayed, config);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_aborts_test_processes_and_stops() -> Result<()> {
    let (relay, addr) = start_relay().await?;
    let (console, _console_rx) = peer(&addr, "console1").await?;
    let (process, mut process_rx) = peer(&addr, "testproc3").await?;

    console.send(Envelope::signal(MessageType::Shutdown)).await?;
    assert_eq!(next(&mut process_rx).await?.msg_type(), MessageType::Abort);
    timeout(Duration::from_secs(2), relay.shutdown_requested())
        .await
        .context("shutdown not requested")?;
    assert!(relay.is_shutdown_requested());

    relay.stop().await;
    timeout(Duration::from_secs(2), async {
        while process.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("test process still connected after stop")?;
    Ok(())
}
