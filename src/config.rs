// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh-wide timing, sizing, and wire-format constants.
//!
//! Centralizes the compiled-in defaults named throughout the design so they
//! are changed in exactly one place. Every one of these is overridable per
//! node via [`MeshConfig`]; the constants below are only the defaults.

use std::time::Duration;

/// Wire format version byte understood by this build.
pub const WIRE_VERSION: u8 = 1;

/// Fixed packet header length: version(1) + type(1) + seq(4) + checksum(4).
pub const HEADER_LEN: usize = 10;

/// Retry scan cadence for the pending-send table.
pub const RETRY_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Initial retransmit timeout for a pending send.
pub const INITIAL_RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Cap on the doubled retransmit timeout.
pub const MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(8);

/// Maximum retransmit attempts before a pending send is abandoned.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Soft cap on the per-peer received-sequence dedup set before eviction.
pub const DEDUP_SOFT_LIMIT: usize = 10_000;

/// Default heartbeat tick period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default peer liveness timeout (3x heartbeat interval).
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Default anti-entropy sync tick period.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Default gossip discovery tick period.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum UDP datagram this implementation will attempt to send or parse.
pub const MAX_PACKET_SIZE: usize = 65_536;

/// Per-node configuration. Defaults match the intervals named in the design;
/// construct with [`MeshConfig::default`] and override fields as needed.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// How often the sync ticker fires a `SYNC_REQUEST` to each alive peer.
    pub sync_interval: Duration,
    /// How often the heartbeat ticker fires a `HEARTBEAT` to every known peer.
    pub heartbeat_interval: Duration,
    /// How often the discovery ticker fires a `DISCOVERY` to bootstrap addresses.
    pub discovery_interval: Duration,
    /// How long since `last_seen` before a peer is marked dead.
    pub peer_timeout: Duration,
    /// Retry-scan cadence for the reliable endpoint.
    pub retry_scan_interval: Duration,
    /// Initial retransmit timeout.
    pub initial_retry_timeout: Duration,
    /// Retransmit timeout cap.
    pub max_retry_timeout: Duration,
    /// Retransmit attempt cap before abandonment.
    pub max_retry_attempts: u32,
    /// Per-peer dedup set soft cap.
    pub dedup_soft_limit: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            retry_scan_interval: RETRY_SCAN_INTERVAL,
            initial_retry_timeout: INITIAL_RETRY_TIMEOUT,
            max_retry_timeout: MAX_RETRY_TIMEOUT,
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            dedup_soft_limit: DEDUP_SOFT_LIMIT,
        }
    }
}

impl MeshConfig {
    /// Start a [`MeshConfigBuilder`] seeded with the compiled-in defaults.
    pub fn builder() -> MeshConfigBuilder {
        MeshConfigBuilder::new()
    }
}

/// Fluent builder over [`MeshConfig`], for callers that only want to override
/// one or two of the timing/sizing fields instead of naming every field of
/// the struct literal.
#[derive(Debug, Clone)]
pub struct MeshConfigBuilder(MeshConfig);

impl MeshConfigBuilder {
    pub fn new() -> Self {
        Self(MeshConfig::default())
    }

    pub fn sync_interval(mut self, d: Duration) -> Self {
        self.0.sync_interval = d;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.0.heartbeat_interval = d;
        self
    }

    pub fn discovery_interval(mut self, d: Duration) -> Self {
        self.0.discovery_interval = d;
        self
    }

    pub fn peer_timeout(mut self, d: Duration) -> Self {
        self.0.peer_timeout = d;
        self
    }

    pub fn retry_scan_interval(mut self, d: Duration) -> Self {
        self.0.retry_scan_interval = d;
        self
    }

    pub fn initial_retry_timeout(mut self, d: Duration) -> Self {
        self.0.initial_retry_timeout = d;
        self
    }

    pub fn max_retry_timeout(mut self, d: Duration) -> Self {
        self.0.max_retry_timeout = d;
        self
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.0.max_retry_attempts = n;
        self
    }

    pub fn dedup_soft_limit(mut self, n: usize) -> Self {
        self.0.dedup_soft_limit = n;
        self
    }

    pub fn build(self) -> MeshConfig {
        self.0
    }
}

impl Default for MeshConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_only_named_fields() {
        let cfg = MeshConfig::builder()
            .sync_interval(Duration::from_millis(50))
            .max_retry_attempts(2)
            .build();
        assert_eq!(cfg.sync_interval, Duration::from_millis(50));
        assert_eq!(cfg.max_retry_attempts, 2);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }
}
