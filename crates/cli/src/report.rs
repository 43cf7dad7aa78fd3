//! Per-process bookkeeping of a console run.

use std::collections::{BTreeMap, BTreeSet};

use fleetload_common::{Envelope, MessageType, ProcessIds, ProcessOutcome, StatusReport};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub process_id: u32,
    pub daemon_id: u32,
    pub expected: bool,
    pub ready: bool,
    pub outcome: Option<ProcessOutcome>,
    pub message: Option<String>,
    pub errors: Vec<String>,
    pub disconnected: bool,
}

impl ProcessReport {
    fn new(ids: ProcessIds, expected: bool) -> Self {
        Self {
            process_id: ids.process_id,
            daemon_id: ids.daemon_id,
            expected,
            ready: false,
            outcome: None,
            message: None,
            errors: Vec::new(),
            disconnected: false,
        }
    }

    pub fn ids(&self) -> ProcessIds {
        ProcessIds::new(self.process_id, self.daemon_id)
    }

    pub fn status_line(&self) -> String {
        let ids = self.ids();
        let state = match (self.outcome, self.ready) {
            (Some(outcome), _) => outcome.to_string(),
            (None, true) => "NO RESULT".to_string(),
            (None, false) => "NEVER READY".to_string(),
        };
        let mut line = format!("{ids}: {state}");
        if let Some(message) = &self.message {
            line.push_str(" - ");
            line.push_str(message);
        }
        for error in &self.errors {
            line.push_str(" [error: ");
            line.push_str(error);
            line.push(']');
        }
        line
    }
}

/// What the console has heard from every process of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    processes: BTreeMap<ProcessIds, ProcessReport>,
}

impl RunReport {
    pub fn new(expected: &BTreeSet<ProcessIds>) -> Self {
        let processes = expected
            .iter()
            .map(|ids| (*ids, ProcessReport::new(*ids, true)))
            .collect();
        Self { processes }
    }

    fn entry(&mut self, ids: ProcessIds) -> &mut ProcessReport {
        self.processes.entry(ids).or_insert_with(|| {
            warn!(%ids, "Message from a process outside the load profile");
            ProcessReport::new(ids, false)
        })
    }

    /// Fold one relayed envelope into the report. Returns `false` for
    /// traffic that is not about a process.
    pub fn apply(&mut self, envelope: &Envelope) -> bool {
        match envelope.msg_type() {
            MessageType::Ready => match envelope.decode::<ProcessIds>() {
                Ok(ids) => {
                    debug!(%ids, "Process ready");
                    self.entry(ids).ready = true;
                    true
                }
                Err(err) => {
                    warn!("Malformed READY: {}", err);
                    false
                }
            },
            MessageType::Status | MessageType::Error => {
                let report: StatusReport = match envelope.decode() {
                    Ok(report) => report,
                    Err(err) => {
                        warn!("Malformed {}: {}", envelope.msg_type(), err);
                        return false;
                    }
                };
                let is_error = envelope.is(MessageType::Error);
                let entry = self.entry(report.ids());
                if is_error {
                    entry.errors.push(report.message);
                } else {
                    entry.message = Some(report.message);
                }
                if report.outcome.is_some() && !is_error {
                    entry.outcome = report.outcome;
                }
                true
            }
            MessageType::Disconnected => match envelope.decode::<ProcessIds>() {
                Ok(ids) => {
                    self.entry(ids).disconnected = true;
                    true
                }
                Err(err) => {
                    warn!("Malformed DISCONNECTED: {}", err);
                    false
                }
            },
            _ => false,
        }
    }

    /// Close out every process of a daemon whose connection dropped.
    pub fn mark_daemon_lost(&mut self, daemon_id: u32) {
        for report in self
            .processes
            .values_mut()
            .filter(|r| r.daemon_id == daemon_id && !r.disconnected)
        {
            report.errors.push(format!("lost connection to daemon {daemon_id}"));
            report.outcome.get_or_insert(ProcessOutcome::Error);
            report.disconnected = true;
        }
    }

    pub fn all_ready(&self) -> bool {
        self.processes.values().filter(|r| r.expected).all(|r| r.ready)
    }

    /// Every process that ever showed up has said goodbye.
    pub fn all_finished(&self) -> bool {
        self.processes
            .values()
            .filter(|r| r.ready || r.outcome.is_some())
            .all(|r| r.disconnected)
    }

    pub fn missing(&self) -> Vec<ProcessIds> {
        self.processes
            .values()
            .filter(|r| r.expected && !r.ready)
            .map(ProcessReport::ids)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        !self.processes.is_empty()
            && self
                .processes
                .values()
                .all(|r| r.outcome == Some(ProcessOutcome::Successful))
    }

    pub fn get(&self, ids: ProcessIds) -> Option<&ProcessReport> {
        self.processes.get(&ids)
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessReport> {
        self.processes.values()
    }

    pub fn lines(&self) -> Vec<String> {
        self.processes().map(ProcessReport::status_line).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let processes: Vec<&ProcessReport> = self.processes().collect();
        serde_json::to_string_pretty(&serde_json::json!({
            "success": self.is_success(),
            "processes": processes,
        }))
    }
}
