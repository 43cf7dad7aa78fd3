//! Load profiles and per-process operation assignments.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::message::ProcessIds;

/// One scheduling record of the global load profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub offset_ms: u64,
    pub operation: String,
    pub target: String,
    pub daemon_id: u32,
    pub process_id: u32,
}

/// Operation a single test process fires at `start_offset_ms` after START.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAssignment {
    /// 1-based position in the filtered list.
    pub thread_id: u32,
    pub operation: String,
    pub target: String,
    pub start_offset_ms: u64,
}

impl OperationAssignment {
    pub fn start_offset(&self) -> Duration {
        Duration::from_millis(self.start_offset_ms)
    }
}

/// Filter the global schedule down to one process, keeping the original
/// order and numbering the assignments from 1.
pub fn assignments_for(events: &[ProfileEvent], ids: ProcessIds) -> Vec<OperationAssignment> {
    events
        .iter()
        .filter(|event| event.process_id == ids.process_id)
        .zip(1u32..)
        .map(|(event, thread_id)| OperationAssignment {
            thread_id,
            operation: event.operation.clone(),
            target: event.target.clone(),
            start_offset_ms: event.offset_ms,
        })
        .collect()
}

/// Payload of a CONFIG envelope: the schedule plus free-form properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default)]
    pub events: Vec<ProfileEvent>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ProcessConfig {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonEndpoint {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

impl DaemonEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Console-side description of a whole run.
///
/// ```toml
/// [[daemon]]
/// id = 1
/// host = "127.0.0.1"
/// port = 7400
///
/// [[event]]
/// offset_ms = 0
/// operation = "login"
/// target = "http://localhost:8080"
/// daemon_id = 1
/// process_id = 1
///
/// [properties]
/// "driver.simulated_latency_ms" = "25"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProfile {
    #[serde(default, rename = "daemon")]
    pub daemons: Vec<DaemonEndpoint>,
    #[serde(default, rename = "event")]
    pub events: Vec<ProfileEvent>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl LoadProfile {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let profile: LoadProfile = toml::from_str(raw).context("failed to parse load profile")?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read load profile {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid load profile {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let known: BTreeSet<u32> = self.daemons.iter().map(|d| d.id).collect();
        if known.len() != self.daemons.len() {
            anyhow::bail!("duplicate daemon id in load profile");
        }
        if let Some(event) = self.events.iter().find(|e| !known.contains(&e.daemon_id)) {
            anyhow::bail!(
                "event '{}' references unknown daemon {}",
                event.operation,
                event.daemon_id
            );
        }
        Ok(())
    }

    /// CONFIG payload for one daemon: only the events it hosts.
    pub fn config_for_daemon(&self, daemon_id: u32) -> ProcessConfig {
        ProcessConfig {
            events: self
                .events
                .iter()
                .filter(|e| e.daemon_id == daemon_id)
                .cloned()
                .collect(),
            properties: self.properties.clone(),
        }
    }

    /// Distinct processes the profile expects to run, in id order.
    pub fn expected_processes(&self) -> BTreeSet<ProcessIds> {
        self.events
            .iter()
            .map(|e| ProcessIds::new(e.process_id, e.daemon_id))
            .collect()
    }
}
