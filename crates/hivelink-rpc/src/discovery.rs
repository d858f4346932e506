// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration bus contract and an in-memory implementation.
//!
//! The RPC core consumes discovery through this narrow interface: it pushes
//! registration samples for clients and servers, and pulls peer snapshots
//! with [`DiscoveryBus::peers_for`]. The network transport behind the bus
//! lives outside this crate; [`MemoryBus`] covers tests, demos, and
//! single-process wiring.
//!
//! Bus failures never propagate into callers: registration hooks are
//! fire-and-forget and a missing service yields an empty snapshot.

use crate::types::{PeerDescriptor, RegistrationSample};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Announcement consumer and peer-snapshot producer.
pub trait DiscoveryBus: Send + Sync {
    /// Announce a service client.
    fn register_client(
        &self,
        service_name: &str,
        service_id: &str,
        sample: &RegistrationSample,
        force: bool,
    );

    /// Retract a service client announcement.
    fn unregister_client(
        &self,
        service_name: &str,
        service_id: &str,
        sample: &RegistrationSample,
        force: bool,
    );

    /// Announce a service server (sample carries the listen ports).
    fn register_server(
        &self,
        service_name: &str,
        service_id: &str,
        sample: &RegistrationSample,
        force: bool,
    );

    /// Retract a service server announcement.
    fn unregister_server(
        &self,
        service_name: &str,
        service_id: &str,
        sample: &RegistrationSample,
        force: bool,
    );

    /// Snapshot of all known peers hosting `service_name`.
    fn peers_for(&self, service_name: &str) -> Vec<PeerDescriptor>;
}

#[derive(Default)]
struct BusTables {
    /// service_name -> peer key -> descriptor
    servers: HashMap<String, HashMap<String, PeerDescriptor>>,
    /// service_name -> client service_id set (kept for introspection)
    clients: HashMap<String, HashMap<String, RegistrationSample>>,
}

/// Process-local registration bus.
///
/// Server announcements become [`PeerDescriptor`]s immediately; client
/// announcements are recorded but have no effect on snapshots.
#[derive(Default)]
pub struct MemoryBus {
    tables: Mutex<BusTables>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of announced servers for a service.
    pub fn server_count(&self, service_name: &str) -> usize {
        self.tables
            .lock()
            .servers
            .get(service_name)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Drop every announcement for a service (simulates total churn).
    pub fn clear_service(&self, service_name: &str) {
        let mut tables = self.tables.lock();
        tables.servers.remove(service_name);
        tables.clients.remove(service_name);
    }
}

fn descriptor_from(sample: &RegistrationSample) -> PeerDescriptor {
    PeerDescriptor {
        key: sample.peer_key(),
        host_name: sample.identity.host_name.clone(),
        service_name: sample.service_name.clone(),
        service_id: sample.service_id.clone(),
        tcp_port_v0: sample.tcp_port_v0,
        tcp_port_v1: sample.tcp_port_v1,
        announced_version: sample.version,
    }
}

impl DiscoveryBus for MemoryBus {
    fn register_client(
        &self,
        service_name: &str,
        service_id: &str,
        sample: &RegistrationSample,
        _force: bool,
    ) {
        self.tables
            .lock()
            .clients
            .entry(service_name.to_string())
            .or_default()
            .insert(service_id.to_string(), sample.clone());
    }

    fn unregister_client(
        &self,
        service_name: &str,
        service_id: &str,
        _sample: &RegistrationSample,
        _force: bool,
    ) {
        if let Some(ids) = self.tables.lock().clients.get_mut(service_name) {
            ids.remove(service_id);
        }
    }

    fn register_server(
        &self,
        service_name: &str,
        _service_id: &str,
        sample: &RegistrationSample,
        _force: bool,
    ) {
        let peer = descriptor_from(sample);
        debug!(service = service_name, key = %peer.key, "server announced");
        self.tables
            .lock()
            .servers
            .entry(service_name.to_string())
            .or_default()
            .insert(peer.key.clone(), peer);
    }

    fn unregister_server(
        &self,
        service_name: &str,
        _service_id: &str,
        sample: &RegistrationSample,
        _force: bool,
    ) {
        let key = sample.peer_key();
        debug!(service = service_name, key = %key, "server retracted");
        if let Some(peers) = self.tables.lock().servers.get_mut(service_name) {
            peers.remove(&key);
        }
    }

    fn peers_for(&self, service_name: &str) -> Vec<PeerDescriptor> {
        self.tables
            .lock()
            .servers
            .get(service_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostIdentity;

    fn sample(service: &str, id: &str, port_v1: u16) -> RegistrationSample {
        RegistrationSample {
            identity: HostIdentity {
                host_name: "node-a".into(),
                process_name: "/bin/app".into(),
                unit_name: "app".into(),
                pid: 7,
            },
            service_name: service.into(),
            service_id: id.into(),
            version: 1,
            tcp_port_v0: 0,
            tcp_port_v1: port_v1,
        }
    }

    #[test]
    fn server_announce_and_snapshot() {
        let bus = MemoryBus::new();
        let s = sample("mirror", "1", 9001);
        bus.register_server("mirror", "1", &s, false);

        let peers = bus.peers_for("mirror");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].tcp_port_v1, 9001);
        assert_eq!(peers[0].key, s.peer_key());

        bus.unregister_server("mirror", "1", &s, true);
        assert!(bus.peers_for("mirror").is_empty());
    }

    #[test]
    fn unknown_service_is_empty_not_an_error() {
        let bus = MemoryBus::new();
        assert!(bus.peers_for("nonexistent").is_empty());
    }

    #[test]
    fn reannounce_with_same_key_overwrites() {
        let bus = MemoryBus::new();
        bus.register_server("mirror", "1", &sample("mirror", "1", 9001), false);
        bus.register_server("mirror", "1", &sample("mirror", "1", 9002), false);
        let peers = bus.peers_for("mirror");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].tcp_port_v1, 9002);
    }

    #[test]
    fn client_registration_does_not_affect_snapshots() {
        let bus = MemoryBus::new();
        bus.register_client("mirror", "c1", &sample("mirror", "c1", 0), false);
        assert!(bus.peers_for("mirror").is_empty());
    }
}
