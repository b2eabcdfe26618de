// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer registry: bootstrap address book, liveness state, gossip updates.
//!
//! The peer table is a [`DashMap`] rather than a `Mutex<HashMap>`: `observe`
//! fires from the socket receiver's dispatch path while `alive_peers`/
//! `all_peers` are read from the sync/heartbeat/discovery timer threads, so
//! per-shard locking keeps those from serializing behind one another.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `(node_id, address, last_seen, state_version, alive?, last_sync_time)`.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: String,
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub state_version: u64,
    pub alive: bool,
    pub last_sync_time: Option<Instant>,
}

/// What changed on an `observe`/liveness-scan transition, reported outside
/// the registry's lock.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Discovered { node_id: String, address: SocketAddr },
    Failed { node_id: String },
}

/// Address book and liveness tracker for the mesh. Peer records are created
/// on first contact and never deleted — only transitioned between alive and
/// dead.
#[derive(Clone)]
pub struct PeerRegistry {
    bootstrap: Arc<parking_lot::Mutex<Vec<SocketAddr>>>,
    peers: Arc<DashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            bootstrap: Arc::new(parking_lot::Mutex::new(Vec::new())),
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Append a seed address with no node id yet.
    pub fn add_bootstrap(&self, address: SocketAddr) {
        let mut bootstrap = self.bootstrap.lock();
        if !bootstrap.contains(&address) {
            bootstrap.push(address);
        }
    }

    pub fn bootstrap_addresses(&self) -> Vec<SocketAddr> {
        self.bootstrap.lock().clone()
    }

    /// Insert or update a peer record, refresh `last_seen`, mark alive.
    /// Fires [`PeerEvent::Discovered`] on first sighting *or* on a
    /// dead-to-alive transition.
    pub fn observe(
        &self,
        node_id: &str,
        address: SocketAddr,
        state_version: u64,
    ) -> Option<PeerEvent> {
        let now = Instant::now();
        match self.peers.get_mut(node_id) {
            Some(mut rec) => {
                rec.address = address;
                rec.last_seen = now;
                rec.state_version = state_version;
                let was_dead = !rec.alive;
                rec.alive = true;
                if was_dead {
                    Some(PeerEvent::Discovered {
                        node_id: node_id.to_string(),
                        address,
                    })
                } else {
                    None
                }
            }
            None => {
                self.peers.insert(
                    node_id.to_string(),
                    PeerRecord {
                        node_id: node_id.to_string(),
                        address,
                        last_seen: now,
                        state_version,
                        alive: true,
                        last_sync_time: None,
                    },
                );
                Some(PeerEvent::Discovered {
                    node_id: node_id.to_string(),
                    address,
                })
            }
        }
    }

    pub fn mark_synced(&self, node_id: &str) {
        if let Some(mut rec) = self.peers.get_mut(node_id) {
            rec.last_sync_time = Some(Instant::now());
        }
    }

    pub fn alive_peers(&self) -> Vec<PeerRecord> {
        self.peers.iter().filter(|r| r.alive).map(|r| r.clone()).collect()
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|r| r.clone()).collect()
    }

    pub fn peer_by_address(&self, address: SocketAddr) -> Option<PeerRecord> {
        self.peers.iter().find(|r| r.address == address).map(|r| r.clone())
    }

    /// Flip any peer whose `last_seen` is older than `peer_timeout` to dead,
    /// returning the events fired. Called from the liveness-scan timer.
    pub fn scan_liveness(&self, peer_timeout: Duration) -> Vec<PeerEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        for mut rec in self.peers.iter_mut() {
            if rec.alive && now.duration_since(rec.last_seen) > peer_timeout {
                rec.alive = false;
                events.push(PeerEvent::Failed {
                    node_id: rec.node_id.clone(),
                });
            }
        }
        events
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn first_observe_fires_discovered() {
        let reg = PeerRegistry::new();
        let event = reg.observe("a", addr(5001), 0);
        assert!(matches!(event, Some(PeerEvent::Discovered { .. })));
        assert_eq!(reg.alive_peers().len(), 1);
    }

    #[test]
    fn repeat_observe_does_not_rediscover() {
        let reg = PeerRegistry::new();
        reg.observe("a", addr(5001), 0);
        let event = reg.observe("a", addr(5001), 1);
        assert!(event.is_none());
    }

    #[test]
    fn liveness_scan_flips_and_rediscovers() {
        let reg = PeerRegistry::new();
        reg.observe("a", addr(5001), 0);
        // Force last_seen into the past by sleeping past a tiny timeout.
        std::thread::sleep(Duration::from_millis(5));
        let events = reg.scan_liveness(Duration::from_millis(1));
        assert!(matches!(events[0], PeerEvent::Failed { .. }));
        assert!(reg.alive_peers().is_empty());

        let event = reg.observe("a", addr(5001), 2);
        assert!(matches!(event, Some(PeerEvent::Discovered { .. })));
        assert_eq!(reg.alive_peers().len(), 1);
    }

    #[test]
    fn bootstrap_addresses_dedup() {
        let reg = PeerRegistry::new();
        reg.add_bootstrap(addr(9000));
        reg.add_bootstrap(addr(9000));
        assert_eq!(reg.bootstrap_addresses().len(), 1);
    }
}
