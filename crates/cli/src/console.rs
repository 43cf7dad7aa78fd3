//! Console side of a run: one link per daemon, control broadcast, and
//! collection of what the test processes report back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleetload_common::ids::console_client_id;
use fleetload_common::{ClientCount, DaemonEndpoint, Envelope, LoadProfile, MessageType};
use fleetload_transport::{Connection, MessageListener, TransportClient, TransportConfig};
use futures_util::future::join_all;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::report::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// How long to wait for every expected process to report READY.
    pub ready_timeout: Duration,
    /// Upper bound for the run after START; ABORT is sent when it expires.
    pub run_timeout: Option<Duration>,
    /// How long to keep collecting after an ABORT went out.
    pub abort_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            run_timeout: None,
            abort_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Message { daemon_id: u32, envelope: Envelope },
    Lost { daemon_id: u32 },
}

struct LinkListener {
    daemon_id: u32,
    tx: UnboundedSender<Inbound>,
}

impl MessageListener for LinkListener {
    fn on_message(&self, _connection: &Arc<Connection>, envelope: &Envelope) {
        let _ = self.tx.send(Inbound::Message {
            daemon_id: self.daemon_id,
            envelope: envelope.clone(),
        });
    }

    fn on_disconnect(&self, _connection: &Arc<Connection>) {
        let _ = self.tx.send(Inbound::Lost {
            daemon_id: self.daemon_id,
        });
    }
}

struct DaemonLink {
    daemon_id: u32,
    client: TransportClient,
}

/// Open links to every daemon of a load profile.
pub struct Console {
    links: Vec<DaemonLink>,
    inbound: UnboundedReceiver<Inbound>,
}

impl Console {
    pub async fn connect(
        daemons: &[DaemonEndpoint],
        secret: &str,
        config: TransportConfig,
    ) -> Result<Self> {
        if daemons.is_empty() {
            bail!("load profile names no daemons");
        }
        let (tx, inbound) = unbounded_channel();
        let mut links = Vec::with_capacity(daemons.len());
        for daemon in daemons {
            let client = TransportClient::new(
                daemon.address(),
                console_client_id(daemon.id),
                secret,
                config,
            );
            client.add_listener(Arc::new(LinkListener {
                daemon_id: daemon.id,
                tx: tx.clone(),
            }));
            client
                .connect()
                .await
                .with_context(|| {
                    format!("failed to connect to daemon {} at {}", daemon.id, daemon.address())
                })?;
            client
                .wait_handshake()
                .await
                .with_context(|| format!("handshake with daemon {} failed", daemon.id))?;
            info!(daemon_id = daemon.id, address = %daemon.address(), "Connected to daemon");
            links.push(DaemonLink {
                daemon_id: daemon.id,
                client,
            });
        }
        Ok(Self { links, inbound })
    }

    pub fn daemon_ids(&self) -> Vec<u32> {
        self.links.iter().map(|link| link.daemon_id).collect()
    }

    /// Send the same envelope to every daemon and wait until all writes
    /// went out.
    pub async fn send_all(&self, envelope: &Envelope) -> Result<()> {
        let sends = self
            .links
            .iter()
            .map(|link| async move { (link.daemon_id, link.client.send(envelope.clone()).await) });
        for (daemon_id, result) in join_all(sends).await {
            result.with_context(|| {
                format!("failed to send {} to daemon {}", envelope.msg_type(), daemon_id)
            })?;
        }
        Ok(())
    }

    /// Push the optional artifact and each daemon's share of the profile.
    pub async fn push_profile(&self, profile: &LoadProfile, artifact: Option<&[u8]>) -> Result<()> {
        for link in &self.links {
            if let Some(bytes) = artifact {
                link.client
                    .send(Envelope::jar(bytes))
                    .await
                    .with_context(|| format!("failed to send JAR to daemon {}", link.daemon_id))?;
            }
            let config = profile.config_for_daemon(link.daemon_id);
            let events = config.events.len();
            link.client
                .send(Envelope::config(&config)?)
                .await
                .with_context(|| format!("failed to send CONFIG to daemon {}", link.daemon_id))?;
            debug!(daemon_id = link.daemon_id, events, "CONFIG sent");
        }
        Ok(())
    }

    /// Ask every daemon how many test processes are connected to it.
    pub async fn client_counts(&mut self, limit: Duration) -> Result<BTreeMap<u32, usize>> {
        self.send_all(&Envelope::signal(MessageType::ClientCount)).await?;
        let deadline = Instant::now() + limit;
        let mut counts = BTreeMap::new();
        while counts.len() < self.links.len() {
            let inbound = tokio::time::timeout_at(deadline, self.inbound.recv())
                .await
                .context("timed out waiting for CLIENT_COUNT replies")?;
            match inbound {
                Some(Inbound::Message {
                    daemon_id,
                    envelope,
                }) if envelope.is(MessageType::ClientCount) => {
                    let reply: ClientCount = envelope.decode()?;
                    counts.insert(daemon_id, reply.count);
                }
                Some(Inbound::Message { envelope, .. }) => {
                    debug!(msg_type = %envelope.msg_type(), "Ignoring message while counting");
                }
                Some(Inbound::Lost { daemon_id }) => bail!("lost connection to daemon {daemon_id}"),
                None => bail!("all daemon links closed"),
            }
        }
        Ok(counts)
    }

    /// Drive a whole run: CONFIG, wait for READY, START, collect until every
    /// process disconnected. Cancelling `stop` sends ABORT and keeps
    /// collecting for the abort grace period.
    pub async fn run(
        &mut self,
        profile: &LoadProfile,
        artifact: Option<&[u8]>,
        options: RunOptions,
        stop: CancellationToken,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(&profile.expected_processes());
        self.push_profile(profile, artifact).await?;

        let ready_deadline = Instant::now() + options.ready_timeout;
        let ready = self
            .collect(&mut report, ready_deadline, &stop, RunReport::all_ready)
            .await;
        if !ready {
            let missing = report.missing();
            if stop.is_cancelled() {
                warn!("Run cancelled before START");
            } else {
                warn!(missing = missing.len(), "Not every process became ready; aborting");
            }
            self.abort_and_drain(&mut report, options.abort_grace).await?;
            return Ok(report);
        }

        info!("All processes ready; sending START");
        self.send_all(&Envelope::signal(MessageType::Start)).await?;

        let run_deadline = options
            .run_timeout
            .map(|limit| Instant::now() + limit)
            .unwrap_or_else(far_future);
        let finished = self
            .collect(&mut report, run_deadline, &stop, RunReport::all_finished)
            .await;
        if !finished {
            if stop.is_cancelled() {
                warn!("Run cancelled; sending ABORT");
            } else {
                warn!("Run timeout expired; sending ABORT");
            }
            self.abort_and_drain(&mut report, options.abort_grace).await?;
        }
        Ok(report)
    }

    pub async fn abort(&self) -> Result<()> {
        self.send_all(&Envelope::signal(MessageType::Abort)).await
    }

    /// Ask every daemon to abort its processes and exit.
    pub async fn shutdown_daemons(&self) -> Result<()> {
        self.send_all(&Envelope::signal(MessageType::Shutdown)).await
    }

    pub async fn disconnect(&self) {
        for link in &self.links {
            link.client.disconnect().await;
        }
    }

    async fn abort_and_drain(&mut self, report: &mut RunReport, grace: Duration) -> Result<()> {
        self.abort().await?;
        let never = CancellationToken::new();
        let drained = self
            .collect(report, Instant::now() + grace, &never, RunReport::all_finished)
            .await;
        if !drained {
            warn!("Some processes did not report back after ABORT");
        }
        Ok(())
    }

    /// Feed inbound traffic into `report` until `done` holds. `false` when the
    /// deadline passed or `stop` fired first.
    async fn collect(
        &mut self,
        report: &mut RunReport,
        deadline: Instant,
        stop: &CancellationToken,
        done: fn(&RunReport) -> bool,
    ) -> bool {
        while !done(report) {
            let inbound = tokio::select! {
                biased;
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
                inbound = self.inbound.recv() => inbound,
            };
            match inbound {
                Some(Inbound::Message { daemon_id, envelope }) => {
                    if !report.apply(&envelope) {
                        debug!(daemon_id, msg_type = %envelope.msg_type(), "Ignoring message");
                    }
                }
                Some(Inbound::Lost { daemon_id }) => {
                    warn!(daemon_id, "Lost connection to daemon");
                    report.mark_daemon_lost(daemon_id);
                }
                None => return done(report),
            }
        }
        true
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
