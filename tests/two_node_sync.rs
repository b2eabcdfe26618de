// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-node basic sync and failure detection, driven over real loopback UDP
//! sockets with shortened timers.

use meshkv::{MeshConfig, MeshNode};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

fn local(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn fast_config() -> MeshConfig {
    MeshConfig {
        sync_interval: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(150),
        discovery_interval: Duration::from_millis(150),
        peer_timeout: Duration::from_millis(400),
        retry_scan_interval: Duration::from_millis(30),
        initial_retry_timeout: Duration::from_millis(100),
        max_retry_timeout: Duration::from_millis(800),
        max_retry_attempts: 5,
        dedup_soft_limit: 10_000,
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn two_node_basic_sync() {
    let a = MeshNode::new("node_a", local(15001), fast_config()).expect("bind a");
    let b = MeshNode::new("node_b", local(15002), fast_config()).expect("bind b");
    b.add_bootstrap_peer("127.0.0.1", 15001);

    a.start();
    b.start();

    a.set("k", json!("v"));

    let converged = wait_until(Duration::from_secs(5), || b.get("k") == Some(json!("v")));
    assert!(converged, "b never converged: {:?}", b.get("k"));

    a.stop();
    b.stop();
}

#[test]
fn failure_detection_marks_peer_dead() {
    let a = MeshNode::new("node_a", local(15011), fast_config()).expect("bind a");
    let b = MeshNode::new("node_b", local(15012), fast_config()).expect("bind b");
    b.add_bootstrap_peer("127.0.0.1", 15011);

    a.start();
    b.start();

    let a_saw_b = wait_until(Duration::from_secs(3), || {
        a.status().peers_total >= 1
    });
    assert!(a_saw_b, "a never discovered b");

    b.stop();

    let dead = wait_until(Duration::from_secs(3), || a.status().peers_alive == 0);
    assert!(dead, "a never marked b dead: {:?}", a.status());

    a.stop();
}
