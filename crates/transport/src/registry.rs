use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleetload_common::Envelope;

use crate::connection::{Connection, SendHandle};
use crate::error::HandshakeError;

/// Live connections of the accepting side, keyed by handshake client id.
///
/// Entries are added when a handshake succeeds and removed when that same
/// connection closes.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under `client_id`. A dead entry under the same
    /// id is replaced; a live one is rejected.
    pub fn register(
        &self,
        client_id: &str,
        connection: Arc<Connection>,
    ) -> Result<(), HandshakeError> {
        match self.connections.entry(client_id.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live() {
                    return Err(HandshakeError::DuplicateClient(client_id.to_string()));
                }
                existing.insert(connection);
            }
            Entry::Vacant(slot) => {
                slot.insert(connection);
            }
        }
        Ok(())
    }

    /// Remove the entry for `client_id` only if it still points at
    /// `connection`.
    pub fn remove(&self, client_id: &str, connection: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, connection))
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(client_id)
            .map(|entry| entry.value().clone())
            .filter(|conn| conn.is_live())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn count_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        self.connections
            .iter()
            .filter(|entry| predicate(entry.key()) && entry.value().is_live())
            .count()
    }

    /// Send `envelope` to every live connection whose client id matches.
    ///
    /// Targets are collected before sending so no map lock is held while
    /// writing.
    pub fn broadcast<P>(&self, envelope: &Envelope, predicate: P) -> Vec<(String, SendHandle)>
    where
        P: Fn(&str) -> bool,
    {
        let targets: Vec<(String, Arc<Connection>)> = self
            .connections
            .iter()
            .filter(|entry| predicate(entry.key()) && entry.value().is_live())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        targets
            .into_iter()
            .map(|(client_id, conn)| {
                let handle = conn.send(envelope.clone());
                (client_id, handle)
            })
            .collect()
    }
}
