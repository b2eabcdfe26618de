// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interactive CLI for a single mesh node.
//!
//! Usage: `meshkv-cli <node_id> <port> [bootstrap_host bootstrap_port]`
//!
//! Commands at the prompt: `set <key> <value>`, `get <key>`, `delete <key>`,
//! `list`, `status`, `quit`.

use clap::Parser;
use meshkv::{MeshConfig, MeshNode};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single meshkv node with an interactive REPL.
#[derive(Parser, Debug)]
#[command(name = "meshkv-cli")]
#[command(about = "Interactive node in a multi-master eventually-consistent KV mesh")]
struct Args {
    /// This node's id, used as the origin tag on every local write.
    node_id: String,
    /// UDP port to bind.
    port: u16,
    /// Optional bootstrap peer host to seed discovery.
    bootstrap_host: Option<String>,
    /// Optional bootstrap peer port (required if `bootstrap_host` is given).
    bootstrap_port: Option<u16>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let bind_addr: SocketAddr = match format!("0.0.0.0:{}", args.port).parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("invalid port {}: {e}", args.port);
            std::process::exit(1);
        }
    };

    let node = match MeshNode::new(args.node_id.clone(), bind_addr, MeshConfig::default()) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    if let (Some(host), Some(port)) = (&args.bootstrap_host, args.bootstrap_port) {
        node.add_bootstrap_peer(host, port);
    }

    node.start();
    println!("meshkv node '{}' listening on {}", node.node_id(), node.address());

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    let _ = ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    });

    let exit_code = run_repl(&node, &shutdown);
    node.stop();
    std::process::exit(exit_code);
}

fn run_repl(node: &MeshNode, shutdown: &AtomicBool) -> i32 {
    let stdin = io::stdin();
    print_prompt();
    for line in stdin.lock().lines() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match dispatch(node, line.trim()) {
            Command::Quit => return 0,
            Command::Continue => {}
        }
        print_prompt();
    }
    0
}

enum Command {
    Quit,
    Continue,
}

fn dispatch(node: &MeshNode, line: &str) -> Command {
    let mut parts = line.splitn(3, ' ');
    match parts.next().unwrap_or("") {
        "set" => {
            let key = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("");
            let value = parse_value(rest);
            node.set(key, value);
            println!("ok");
        }
        "get" => {
            let key = parts.next().unwrap_or("");
            match node.get(key) {
                Some(v) => println!("{v}"),
                None => println!("(nil)"),
            }
        }
        "delete" => {
            let key = parts.next().unwrap_or("");
            node.delete(key);
            println!("ok");
        }
        "list" => {
            for (k, v) in node.list() {
                println!("{k} = {v}");
            }
        }
        "status" => {
            let s = node.status();
            println!(
                "node_id={} port={} state_version={} data_keys={} peers_alive={} peers_total={} pending_acks={}",
                s.node_id, s.port, s.state_version, s.data_keys, s.peers_alive, s.peers_total, s.pending_acks
            );
        }
        "quit" | "exit" => return Command::Quit,
        "" => {}
        other => println!("unknown command: {other}"),
    }
    Command::Continue
}

/// Best-effort JSON parse of the value argument; anything that doesn't parse
/// as JSON is kept as a plain string, so `set k hello` just works.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
