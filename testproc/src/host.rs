use std::sync::Arc;

use anyhow::{Context, Result};
use fleetload_common::ids::test_process_client_id;
use fleetload_common::{
    Envelope, FleetConfig, MessageType, ProcessConfig, ProcessIds, ProcessOutcome, StatusReport,
};
use fleetload_coordinator::{CoordinatorConfig, Driver, ProcessCoordinator, StartGate, Uplink};
use fleetload_transport::{listener_fn, TransportClient, TransportConfig};
use tokio::sync::watch;
use tracing::{info, warn};

/// Everything one test process owns: its daemon link and its control gate.
///
/// The gate exists before the connection does, so an ABORT or a lost
/// connection during bootstrap is never missed.
pub struct TestProcessHost {
    ids: ProcessIds,
    client: Arc<TransportClient>,
    gate: Arc<StartGate>,
    config: FleetConfig,
}

impl TestProcessHost {
    pub fn new(
        ids: ProcessIds,
        address: impl Into<String>,
        secret: impl Into<String>,
        config: FleetConfig,
    ) -> Self {
        let client = TransportClient::new(
            address,
            test_process_client_id(ids.process_id),
            secret,
            TransportConfig::from(&config.transport),
        );
        Self {
            ids,
            client: Arc::new(client),
            gate: Arc::new(StartGate::new(ids)),
            config,
        }
    }

    pub fn ids(&self) -> ProcessIds {
        self.ids
    }

    /// Gate shared with the coordinator; signal handlers abort or interrupt
    /// through it.
    pub fn gate(&self) -> Arc<StartGate> {
        self.gate.clone()
    }

    /// Connect, wait for CONFIG, run the coordinator and disconnect.
    pub async fn run(self, driver: Arc<dyn Driver>) -> Result<ProcessOutcome> {
        let gate_listener = self.gate.listener();
        self.client.add_listener(gate_listener.clone());

        let (config_tx, mut config_rx) = watch::channel(None::<ProcessConfig>);
        let config_listener = listener_fn(move |_, envelope| {
            if !envelope.is(MessageType::Config) {
                return;
            }
            match envelope.decode::<ProcessConfig>() {
                Ok(config) => {
                    config_tx.send_replace(Some(config));
                }
                Err(err) => warn!("Malformed CONFIG: {}", err),
            }
        });
        self.client.add_listener(config_listener.clone());

        self.client
            .connect()
            .await
            .with_context(|| format!("failed to connect to daemon at {}", self.client.address()))?;
        self.client
            .wait_handshake()
            .await
            .context("daemon handshake failed")?;
        self.client
            .send(Envelope::with_payload(MessageType::Connect, &self.ids)?)
            .await
            .context("failed to announce test process")?;
        info!(
            process_id = self.ids.process_id,
            daemon_id = self.ids.daemon_id,
            "Waiting for CONFIG"
        );

        let start_timeout = self.config.process.start_timeout();
        let received = tokio::select! {
            biased;
            _ = self.gate.interrupted() => Err(ProcessOutcome::Interrupted),
            _ = self.gate.aborted() => Err(ProcessOutcome::Error),
            waited = tokio::time::timeout(start_timeout, config_rx.wait_for(Option::is_some)) => {
                match waited {
                    Ok(Ok(config)) => Ok((*config).clone()),
                    _ => Err(ProcessOutcome::Error),
                }
            }
        };
        self.client.remove_listener(&config_listener);

        let outcome = match received {
            Ok(Some(process_config)) => {
                let coordinator = ProcessCoordinator::new(
                    self.ids,
                    process_config,
                    driver,
                    self.client.clone() as Arc<dyn Uplink>,
                    CoordinatorConfig::from(&self.config),
                )
                .with_gate(self.gate.clone());
                coordinator.run().await
            }
            Ok(None) | Err(ProcessOutcome::Error) => {
                self.abandon("no usable CONFIG received before abort or timeout")
                    .await;
                ProcessOutcome::Error
            }
            Err(outcome) => {
                self.abandon("interrupted before CONFIG").await;
                outcome
            }
        };

        self.client.remove_listener(&gate_listener);
        self.client.disconnect().await;
        info!(process_id = self.ids.process_id, outcome = %outcome, "Test process done");
        Ok(outcome)
    }

    /// Report a process that never reached the coordinator.
    async fn abandon(&self, reason: &str) {
        warn!(process_id = self.ids.process_id, "{}", reason);
        let outcome = if self.gate.is_interrupted() {
            ProcessOutcome::Interrupted
        } else {
            ProcessOutcome::Error
        };
        let report = StatusReport::new(self.ids, reason).with_outcome(outcome);
        let envelopes = [
            Envelope::error(&report),
            Envelope::status(&report),
            Envelope::disconnected(self.ids),
        ];
        for envelope in envelopes {
            match envelope {
                Ok(envelope) => {
                    if let Err(err) = self.client.send(envelope).await {
                        warn!("Failed to report abandoned process: {}", err);
                        return;
                    }
                }
                Err(err) => warn!("Failed to encode report: {}", err),
            }
        }
        if !self
            .gate
            .wait_disconnect_ack(self.config.process.disconnect_ack_timeout())
            .await
        {
            warn!(process_id = self.ids.process_id, "No disconnect acknowledgement");
        }
    }
}
