// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # meshkv — a multi-master, eventually-consistent key/value mesh
//!
//! Each node is both client and server: it accepts local writes, reconciles
//! state with peers on a timer, detects failed peers via heartbeat, and
//! converges even under packet loss, variable latency, partitions, and
//! restarts.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          MeshNode (orchestrator)                    |
//! |   timers: sync | heartbeat | discovery | liveness-scan              |
//! +---------------------------------------------------------------------+
//! |   CrdtStore (LWW register + tombstones + vector clock)              |
//! |   PeerRegistry (bootstrap, liveness, gossip)                        |
//! +---------------------------------------------------------------------+
//! |   ReliableEndpoint (seq/ack/retry/dedup over UDP)                   |
//! +---------------------------------------------------------------------+
//! |                        wire codec (framed JSON + MD5 checksum)      |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use meshkv::{MeshConfig, MeshNode};
//! use serde_json::json;
//!
//! # fn main() -> meshkv::Result<()> {
//! let node = MeshNode::new("node_a", "0.0.0.0:5001".parse().unwrap(), MeshConfig::default())?;
//! node.start();
//! node.set("k", json!("v"));
//! node.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod node;
pub mod registry;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::{MeshConfig, MeshConfigBuilder};
pub use error::{Error, Result};
pub use hooks::{ClosureHooks, MeshHooks, NullHooks};
pub use node::{MeshNode, MeshStatus};
pub use registry::{PeerEvent, PeerRecord, PeerRegistry};
pub use store::{ChangeEvent, ChangeOp, CrdtStore, Snapshot};
