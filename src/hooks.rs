// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback surface injected at construction, rather than a monkey-patched
//! callable field: implementations are supplied once, up front, and invoked
//! from background workers with no lock held.

use serde_json::Value;
use std::net::SocketAddr;

/// Observer for mesh-level events. Every method has a no-op default so
/// callers only implement what they need.
pub trait MeshHooks: Send + Sync {
    /// A key changed locally (`set`/`delete`) or via merge.
    fn on_state_change(&self, _key: &str, _value: Option<&Value>, _op: &str) {}
    /// A peer was seen for the first time, or came back from `dead`.
    fn on_peer_discovered(&self, _node_id: &str, _address: SocketAddr) {}
    /// A peer's liveness timed out.
    fn on_peer_failed(&self, _node_id: &str) {}
    /// A reliable send was abandoned after exhausting its retry budget.
    fn on_retry_exhausted(&self, _dest: SocketAddr, _seq: u32) {}
}

/// A no-op hook set, used when the caller doesn't care to observe anything.
pub struct NullHooks;
impl MeshHooks for NullHooks {}

type StateChangeFn = dyn Fn(&str, Option<&Value>, &str) + Send + Sync;
type PeerDiscoveredFn = dyn Fn(&str, SocketAddr) + Send + Sync;
type PeerFailedFn = dyn Fn(&str) + Send + Sync;
type RetryExhaustedFn = dyn Fn(SocketAddr, u32) + Send + Sync;

/// Adapter letting callers register plain closures instead of implementing
/// [`MeshHooks`] directly.
#[derive(Default)]
pub struct ClosureHooks {
    state_change: Option<Box<StateChangeFn>>,
    peer_discovered: Option<Box<PeerDiscoveredFn>>,
    peer_failed: Option<Box<PeerFailedFn>>,
    retry_exhausted: Option<Box<RetryExhaustedFn>>,
}

impl ClosureHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change(mut self, f: impl Fn(&str, Option<&Value>, &str) + Send + Sync + 'static) -> Self {
        self.state_change = Some(Box::new(f));
        self
    }

    pub fn on_peer_discovered(mut self, f: impl Fn(&str, SocketAddr) + Send + Sync + 'static) -> Self {
        self.peer_discovered = Some(Box::new(f));
        self
    }

    pub fn on_peer_failed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.peer_failed = Some(Box::new(f));
        self
    }

    pub fn on_retry_exhausted(mut self, f: impl Fn(SocketAddr, u32) + Send + Sync + 'static) -> Self {
        self.retry_exhausted = Some(Box::new(f));
        self
    }
}

impl MeshHooks for ClosureHooks {
    fn on_state_change(&self, key: &str, value: Option<&Value>, op: &str) {
        if let Some(f) = &self.state_change {
            f(key, value, op);
        }
    }

    fn on_peer_discovered(&self, node_id: &str, address: SocketAddr) {
        if let Some(f) = &self.peer_discovered {
            f(node_id, address);
        }
    }

    fn on_peer_failed(&self, node_id: &str) {
        if let Some(f) = &self.peer_failed {
            f(node_id);
        }
    }

    fn on_retry_exhausted(&self, dest: SocketAddr, seq: u32) {
        if let Some(f) = &self.retry_exhausted {
            f(dest, seq);
        }
    }
}
