// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh node: wires the reliable endpoint, CRDT store, and peer registry
//! together, owns the timers, and translates wire message types into
//! actions against the store and registry.

use crate::config::MeshConfig;
use crate::error::Result;
use crate::hooks::{MeshHooks, NullHooks};
use crate::registry::{PeerEvent, PeerRegistry};
use crate::store::{ChangeEvent, CrdtStore, Snapshot};
use crate::transport::ReliableEndpoint;
use crate::wire::{
    DiscoveryPayload, HeartbeatPayload, KnownPeer, PacketType, SyncRequestPayload,
    SyncResponsePayload, WireAddr,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Point-in-time status snapshot. Cheap to clone; holds no lock.
#[derive(Debug, Clone)]
pub struct MeshStatus {
    pub node_id: String,
    pub port: u16,
    pub state_version: u64,
    pub data_keys: usize,
    pub peers_alive: usize,
    pub peers_total: usize,
    pub pending_acks: usize,
}

struct Workers {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// The orchestrator: a node's entry point. Cheaply cloneable; the public API
/// and every background timer share the same underlying state via `Arc`s.
#[derive(Clone)]
pub struct MeshNode {
    node_id: String,
    address: SocketAddr,
    endpoint: ReliableEndpoint,
    store: CrdtStore,
    registry: PeerRegistry,
    config: MeshConfig,
    hooks: Arc<dyn MeshHooks>,
    workers: Arc<parking_lot::Mutex<Option<Workers>>>,
}

impl MeshNode {
    /// Bind the node's socket and register inbound dispatch handlers. Does
    /// not yet start the timers — call [`MeshNode::start`] for that.
    pub fn new(node_id: impl Into<String>, bind_addr: SocketAddr, config: MeshConfig) -> Result<Self> {
        Self::with_hooks(node_id, bind_addr, config, Arc::new(NullHooks))
    }

    pub fn with_hooks(
        node_id: impl Into<String>,
        bind_addr: SocketAddr,
        config: MeshConfig,
        hooks: Arc<dyn MeshHooks>,
    ) -> Result<Self> {
        let node_id = node_id.into();
        let endpoint = ReliableEndpoint::bind(bind_addr, config.clone())?;
        let address = endpoint.local_addr().map_err(crate::error::Error::BindFailed)?;
        let store = CrdtStore::new(node_id.clone());
        let registry = PeerRegistry::new();

        let node = Self {
            node_id,
            address,
            endpoint,
            store,
            registry,
            config,
            hooks,
            workers: Arc::new(parking_lot::Mutex::new(None)),
        };
        node.register_handlers();
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn register_handlers(&self) {
        let this = self.clone();
        self.endpoint.on(PacketType::Heartbeat, move |src, _seq, payload| {
            this.on_heartbeat(src, payload);
        });

        let this = self.clone();
        self.endpoint.on(PacketType::Discovery, move |src, _seq, payload| {
            this.on_discovery(src, payload);
        });

        let this = self.clone();
        self.endpoint.on(PacketType::SyncRequest, move |src, _seq, payload| {
            this.on_sync_request(src, payload);
        });

        let this = self.clone();
        self.endpoint.on(PacketType::SyncResponse, move |src, _seq, payload| {
            this.on_sync_response(src, payload);
        });

        // DATA is reserved for app-defined payloads; the core only ACKs it
        // (handled generically by the endpoint's receive path already).
        self.endpoint.on(PacketType::Data, |_src, _seq, _payload| {});
    }

    // ===== Inbound dispatch =====

    fn on_heartbeat(&self, src: SocketAddr, payload: &[u8]) {
        let hb: HeartbeatPayload = match crate::wire::decode_payload(payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[node] malformed HEARTBEAT from {src}: {e}");
                return;
            }
        };
        self.observe_and_notify(&hb.node_id, src, hb.state_version);

        if self.store.state_version() < hb.state_version {
            self.send_sync_request(src);
        }
    }

    fn on_discovery(&self, src: SocketAddr, payload: &[u8]) {
        let disco: DiscoveryPayload = match crate::wire::decode_payload(payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[node] malformed DISCOVERY from {src}: {e}");
                return;
            }
        };
        self.observe_and_notify(&disco.node_id, src, 0);

        for peer in &disco.known_peers {
            if peer.node_id == self.node_id {
                continue;
            }
            if let Some(addr) = peer.address.to_socket_addr() {
                if self.registry.peer_by_address(addr).is_none() {
                    self.observe_and_notify(&peer.node_id, addr, 0);
                }
            }
        }

        let reply = self.build_discovery_payload();
        self.send_or_log(src, PacketType::Discovery, &reply);
    }

    fn on_sync_request(&self, src: SocketAddr, payload: &[u8]) {
        let req: SyncRequestPayload = match crate::wire::decode_payload(payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[node] malformed SYNC_REQUEST from {src}: {e}");
                return;
            }
        };
        self.observe_and_notify(&req.node_id, src, req.state_version);

        let snapshot = self.store.snapshot();
        let resp = SyncResponsePayload {
            node_id: self.node_id.clone(),
            data: snapshot.data,
            tombstones: snapshot.tombstones,
            vector_clock: snapshot.vector_clock,
        };
        self.send_or_log(src, PacketType::SyncResponse, &resp);
    }

    fn on_sync_response(&self, src: SocketAddr, payload: &[u8]) {
        let resp: SyncResponsePayload = match crate::wire::decode_payload(payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[node] malformed SYNC_RESPONSE from {src}: {e}");
                return;
            }
        };
        self.observe_and_notify(&resp.node_id, src, 0);

        let remote = Snapshot {
            data: resp.data,
            tombstones: resp.tombstones,
            vector_clock: resp.vector_clock,
        };
        // A malformed snapshot is discarded outright: the peer is not
        // demoted and keeps whatever `last_seen`/version it already had, so
        // one bad sync round doesn't flip it to failed.
        match self.store.merge(&remote) {
            Ok(events) => {
                self.registry.mark_synced(&resp.node_id);
                self.fire_change_events(events);
            }
            Err(e) => {
                log::warn!("[node] discarding malformed snapshot from {src} ({}): {e}", resp.node_id);
            }
        }
    }

    /// Fire-and-forget a reliable send, logging rather than propagating an
    /// encode failure — every call site here is a background handler or
    /// timer with no caller waiting on the result.
    fn send_or_log<T: serde::Serialize>(&self, dest: SocketAddr, ty: PacketType, payload: &T) {
        if let Err(e) = self.endpoint.send_reliable(dest, ty, payload) {
            log::warn!("[node] failed to send {ty:?} to {dest}: {e}");
        }
    }

    fn observe_and_notify(&self, node_id: &str, addr: SocketAddr, state_version: u64) {
        if let Some(PeerEvent::Discovered { node_id, address }) =
            self.registry.observe(node_id, addr, state_version)
        {
            self.hooks.on_peer_discovered(&node_id, address);
        }
    }

    fn fire_change_events(&self, events: Vec<ChangeEvent>) {
        for ev in events {
            self.hooks.on_state_change(&ev.key, ev.value.as_ref(), ev.op.as_str());
        }
    }

    fn send_sync_request(&self, dest: SocketAddr) {
        let req = SyncRequestPayload {
            node_id: self.node_id.clone(),
            state_version: self.store.state_version(),
        };
        self.send_or_log(dest, PacketType::SyncRequest, &req);
    }

    fn build_discovery_payload(&self) -> DiscoveryPayload {
        let known_peers = self
            .registry
            .all_peers()
            .into_iter()
            .map(|p| KnownPeer {
                node_id: p.node_id,
                address: WireAddr::from(p.address),
                alive: p.alive,
            })
            .collect();
        DiscoveryPayload {
            node_id: self.node_id.clone(),
            address: WireAddr::from(self.address),
            known_peers,
        }
    }

    // ===== Outbound timers =====

    fn sync_tick(&self) {
        for peer in self.registry.alive_peers() {
            let req = SyncRequestPayload {
                node_id: self.node_id.clone(),
                state_version: self.store.state_version(),
            };
            self.send_or_log(peer.address, PacketType::SyncRequest, &req);
        }
    }

    fn heartbeat_tick(&self) {
        let hb = HeartbeatPayload {
            node_id: self.node_id.clone(),
            address: WireAddr::from(self.address),
            state_version: self.store.state_version(),
        };
        for peer in self.registry.all_peers() {
            self.send_or_log(peer.address, PacketType::Heartbeat, &hb);
        }
    }

    fn discovery_tick(&self) {
        let payload = self.build_discovery_payload();
        for addr in self.registry.bootstrap_addresses() {
            self.send_or_log(addr, PacketType::Discovery, &payload);
        }
    }

    fn liveness_tick(&self) {
        for event in self.registry.scan_liveness(self.config.peer_timeout) {
            if let PeerEvent::Failed { node_id } = event {
                self.hooks.on_peer_failed(&node_id);
            }
        }
    }

    // ===== Public API =====

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let event = self.store.set(key, value);
        self.fire_change_events(vec![event]);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    pub fn delete(&self, key: impl Into<String>) {
        let event = self.store.delete(key);
        self.fire_change_events(vec![event]);
    }

    pub fn list(&self) -> Vec<(String, Value)> {
        self.store.list()
    }

    pub fn status(&self) -> MeshStatus {
        let peers = self.registry.all_peers();
        MeshStatus {
            node_id: self.node_id.clone(),
            port: self.address.port(),
            state_version: self.store.state_version(),
            data_keys: self.store.len(),
            peers_alive: peers.iter().filter(|p| p.alive).count(),
            peers_total: peers.len(),
            pending_acks: self.endpoint.pending_count(),
        }
    }

    pub fn add_bootstrap_peer(&self, host: &str, port: u16) {
        if let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() {
            self.registry.add_bootstrap(addr);
        } else {
            log::warn!("[node] invalid bootstrap address {host}:{port}");
        }
    }

    /// Install (or clear, with `None`) a per-destination outbound packet
    /// filter on this node's endpoint. Intended for tests that need to
    /// exercise the retry/backoff path under controlled loss rather than
    /// whatever the real network happens to do; not something a production
    /// caller has a reason to touch.
    pub fn set_send_filter(&self, filter: Option<Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>>) {
        self.endpoint.set_send_filter(filter);
    }

    /// Spawn the socket receiver, dispatch worker, retry scanner, and the
    /// sync/heartbeat/discovery/liveness timers; emit an initial discovery
    /// to every bootstrap address. Idempotent no-op if already started.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        handles.push(self.endpoint.spawn_receiver(shutdown.clone()));
        handles.push(self.endpoint.spawn_dispatch_worker(shutdown.clone()));
        handles.push(self.endpoint.spawn_retry_loop(shutdown.clone(), self.hooks.clone()));

        handles.push(self.spawn_tick(shutdown.clone(), self.config.sync_interval, |n| n.sync_tick()));
        handles.push(self.spawn_tick(shutdown.clone(), self.config.heartbeat_interval, |n| n.heartbeat_tick()));
        handles.push(self.spawn_tick(shutdown.clone(), self.config.discovery_interval, |n| n.discovery_tick()));
        handles.push(self.spawn_tick(shutdown.clone(), self.config.heartbeat_interval, |n| n.liveness_tick()));

        self.discovery_tick();

        *workers = Some(Workers { shutdown, handles });
    }

    fn spawn_tick(
        &self,
        shutdown: Arc<AtomicBool>,
        period: std::time::Duration,
        action: impl Fn(&MeshNode) + Send + 'static,
    ) -> JoinHandle<()> {
        let node = self.clone();
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(period);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                action(&node);
            }
        })
    }

    /// Idempotent shutdown: flips the shared flag, waits for every worker to
    /// drain.
    pub fn stop(&self) {
        let workers = self.workers.lock().take();
        if let Some(Workers { shutdown, handles }) = workers {
            shutdown.store(true, Ordering::Relaxed);
            for h in handles {
                let _ = h.join();
            }
        }
    }
}
