// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable datagram endpoint: sequencing, ACK tracking, retransmission with
//! exponential backoff, duplicate suppression, and integrity checking on top
//! of a plain UDP socket.
//!
//! Shutdown is timeout-polled rather than socket-close-unblocked: `std`'s
//! `UdpSocket` has no portable "close this to wake a blocked peer's
//! `recv_from`" primitive, so the receive loop instead uses a short read
//! timeout and re-checks the shutdown flag every pass — same responsiveness,
//! no platform-specific code.
//!
//! The socket receiver hands decoded packets to a dispatch worker over a
//! bounded [`crossbeam::channel`] rather than running ack/dedup/handler logic
//! inline: a slow handler (or a burst of traffic) never makes `recv_from`
//! fall behind the kernel's socket buffer. The channel is bounded and uses
//! `try_send`, so a saturated dispatch path sheds load instead of growing
//! without limit — same backpressure-over-unbounded-growth choice as the
//! teacher's control channel.

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::hooks::MeshHooks;
use crate::wire::{self, AckPayload, Packet, PacketType};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bounded capacity of the receiver-to-dispatch handoff channel.
const DISPATCH_CHANNEL_CAPACITY: usize = 4096;

/// `(sequence_number, encoded_packet, destination, first_send_time,
/// last_send_time, attempt_count, next_timeout)`.
struct PendingSend {
    packet: Vec<u8>,
    dest: SocketAddr,
    #[allow(dead_code)]
    first_send: Instant,
    #[allow(dead_code)]
    last_send: Instant,
    attempts: u32,
    next_timeout: Instant,
    current_timeout: Duration,
    #[allow(dead_code)]
    ty: PacketType,
}

struct DedupSet {
    seen: HashMap<u32, Instant>,
}

impl DedupSet {
    fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    /// Returns `true` if this `(peer, seq)` is new (caller should dispatch).
    fn check_and_insert(&mut self, seq: u32, soft_limit: usize) -> bool {
        if self.seen.contains_key(&seq) {
            return false;
        }
        self.seen.insert(seq, Instant::now());
        if self.seen.len() > soft_limit {
            evict_oldest_half(&mut self.seen);
        }
        true
    }
}

fn evict_oldest_half(seen: &mut HashMap<u32, Instant>) {
    let mut entries: Vec<(u32, Instant)> = seen.iter().map(|(s, t)| (*s, *t)).collect();
    entries.sort_by_key(|(_, t)| *t);
    let evict_count = entries.len() / 2;
    for (seq, _) in entries.into_iter().take(evict_count) {
        seen.remove(&seq);
    }
}

/// Guards the pending-sends table and the per-peer dedup sets — the same
/// mutex covers both, per the locking discipline: never held across a
/// socket send.
struct Inner {
    pending: HashMap<u32, PendingSend>,
    dedup: HashMap<SocketAddr, DedupSet>,
}

type Handler = dyn Fn(SocketAddr, u32, &[u8]) + Send + Sync;

/// Per-destination send filter: returns `true` if a packet to `dest` should
/// actually be put on the wire. Used to inject deterministic packet loss in
/// tests; absent (`None`) in production, where every send goes out.
type SendFilter = dyn Fn(SocketAddr) -> bool + Send + Sync;

/// Reliable, connectionless delivery of typed messages over a best-effort
/// UDP socket. Cheaply cloneable; the receive and retry loops each hold a
/// clone.
#[derive(Clone)]
pub struct ReliableEndpoint {
    socket: Arc<UdpSocket>,
    seq_counter: Arc<AtomicU32>,
    state: Arc<parking_lot::Mutex<Inner>>,
    handlers: Arc<parking_lot::Mutex<HashMap<u8, Arc<Handler>>>>,
    config: MeshConfig,
    dispatch_tx: Sender<(SocketAddr, Packet)>,
    dispatch_rx: Receiver<(SocketAddr, Packet)>,
    send_filter: Arc<parking_lot::Mutex<Option<Arc<SendFilter>>>>,
}

impl ReliableEndpoint {
    /// Bind a UDP socket at `addr`. Bind failure is fatal at startup.
    pub fn bind(addr: SocketAddr, config: MeshConfig) -> Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let sock2 = Socket::new(domain, Type::DGRAM, None).map_err(Error::BindFailed)?;
        sock2.set_reuse_address(true).map_err(Error::BindFailed)?;
        sock2.bind(&addr.into()).map_err(Error::BindFailed)?;
        let socket: UdpSocket = sock2.into();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .map_err(Error::BindFailed)?;
        log::info!("[transport] bound to {addr}");
        let (dispatch_tx, dispatch_rx) = channel::bounded(DISPATCH_CHANNEL_CAPACITY);

        Ok(Self {
            socket: Arc::new(socket),
            seq_counter: Arc::new(AtomicU32::new(0)),
            state: Arc::new(parking_lot::Mutex::new(Inner {
                pending: HashMap::new(),
                dedup: HashMap::new(),
            })),
            handlers: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            config,
            dispatch_tx,
            dispatch_rx,
            send_filter: Arc::new(parking_lot::Mutex::new(None)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register the handler invoked for packets of `ty` once deduped.
    pub fn on(&self, ty: PacketType, handler: impl Fn(SocketAddr, u32, &[u8]) + Send + Sync + 'static) {
        self.handlers.lock().insert(ty as u8, Arc::new(handler));
    }

    /// Install (or clear, with `None`) a per-destination outbound filter.
    /// Every `send_to` on this endpoint — reliable sends, acks, and retries
    /// alike — consults it first; a `false` result drops the packet on the
    /// floor while leaving all other bookkeeping (pending-send tracking,
    /// retry timers) untouched, so the rest of the reliability machinery
    /// behaves exactly as it would against a lossy network link.
    pub fn set_send_filter(&self, filter: Option<Arc<SendFilter>>) {
        *self.send_filter.lock() = filter;
    }

    fn allowed_to_send(&self, dest: SocketAddr) -> bool {
        match self.send_filter.lock().as_ref() {
            Some(f) => f(dest),
            None => true,
        }
    }

    /// Allocate the next sequence number, build the packet, record a
    /// pending-send entry, and transmit. Returns immediately.
    pub fn send_reliable<T: serde::Serialize>(
        &self,
        dest: SocketAddr,
        ty: PacketType,
        payload: &T,
    ) -> Result<u32> {
        let seq = self.seq_counter.fetch_add(1, Ordering::Relaxed);
        let packet = wire::encode(ty, seq, payload)?;

        {
            let mut state = self.state.lock();
            state.pending.insert(
                seq,
                PendingSend {
                    packet: packet.clone(),
                    dest,
                    first_send: Instant::now(),
                    last_send: Instant::now(),
                    attempts: 1,
                    next_timeout: Instant::now() + self.config.initial_retry_timeout,
                    current_timeout: self.config.initial_retry_timeout,
                    ty,
                },
            );
        }

        if !self.allowed_to_send(dest) {
            log::debug!("[transport] send_reliable to {dest} dropped by send filter");
            return Ok(seq);
        }
        if let Err(e) = self.socket.send_to(&packet, dest) {
            log::warn!("[transport] send_reliable to {dest} failed (will retry): {e}");
        }
        Ok(seq)
    }

    /// Synchronous best-effort send; never itself acknowledged. Encode
    /// failure here is logged and swallowed rather than propagated — an ACK
    /// has no retry path and no caller waiting on its result.
    pub fn send_ack(&self, dest: SocketAddr, seq: u32) {
        if !self.allowed_to_send(dest) {
            log::debug!("[transport] send_ack to {dest} dropped by send filter");
            return;
        }
        let packet = match wire::encode(PacketType::Ack, 0, &AckPayload { ack_seq: seq }) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[transport] failed to encode ack for seq={seq}: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&packet, dest) {
            log::debug!("[transport] send_ack to {dest} failed: {e}");
        }
    }

    /// One receive-path pass: read one datagram (bounded by the socket read
    /// timeout), validate its envelope, and hand the decoded packet off to
    /// the dispatch worker. Returns `false` on a timeout (caller should just
    /// loop again) so the shutdown flag gets re-checked. Never runs ack/
    /// dedup/handler logic itself — that happens on the dispatch worker, so
    /// this loop is back at `recv_from` as fast as the kernel can feed it.
    fn recv_once(&self) -> bool {
        let mut buf = [0u8; crate::config::MAX_PACKET_SIZE];
        let (n, src) = match self.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return false;
            }
            Err(e) => {
                log::debug!("[transport] recv_from error: {e}");
                return false;
            }
        };

        let pkt = match wire::decode(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("[transport] dropping packet from {src}: {e}");
                return true;
            }
        };

        if let Err(TrySendError::Full(_)) = self.dispatch_tx.try_send((src, pkt)) {
            log::warn!("[transport] dispatch channel saturated, dropping packet from {src}");
        }
        true
    }

    /// Pull one decoded packet off the dispatch channel and run ack/dedup/
    /// handler logic for it. Blocks briefly (bounded by `recv_timeout`) so
    /// the worker can re-check the shutdown flag between packets.
    fn dispatch_once(&self, recv_timeout: Duration) {
        if let Ok((src, pkt)) = self.dispatch_rx.recv_timeout(recv_timeout) {
            self.handle_decoded(src, pkt);
        }
    }

    fn handle_decoded(&self, src: SocketAddr, pkt: Packet) {
        if matches!(pkt.ty, PacketType::Ack) {
            let ack: AckPayload = match wire::decode_payload(&pkt.payload) {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("[transport] dropping malformed ACK from {src}: {e}");
                    return;
                }
            };
            self.state.lock().pending.remove(&ack.ack_seq);
            return;
        }

        if pkt.ty.needs_ack() {
            self.send_ack(src, pkt.seq);
        }

        let is_new = {
            let mut state = self.state.lock();
            let set = state.dedup.entry(src).or_insert_with(DedupSet::new);
            set.check_and_insert(pkt.seq, self.config.dedup_soft_limit)
        };
        if !is_new {
            log::debug!("[transport] duplicate seq={} from {src}, dropping", pkt.seq);
            return;
        }

        let handler = self.handlers.lock().get(&(pkt.ty as u8)).cloned();
        if let Some(handler) = handler {
            handler(src, pkt.seq, &pkt.payload);
        } else {
            log::debug!("[transport] no handler registered for {:?}", pkt.ty);
        }
    }

    /// Scan every pending send once; resend-and-backoff or abandon those
    /// past their deadline. Returns the `(dest, seq)` of any abandoned send
    /// so the caller can fire `on_retry_exhausted`.
    fn retry_scan(&self) -> Vec<(SocketAddr, u32)> {
        let now = Instant::now();
        let mut to_resend: Vec<(u32, Vec<u8>, SocketAddr)> = Vec::new();
        let mut abandoned = Vec::new();

        {
            let mut state = self.state.lock();
            let due: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, p)| now >= p.next_timeout)
                .map(|(seq, _)| *seq)
                .collect();

            for seq in due {
                let Some(entry) = state.pending.get_mut(&seq) else { continue };
                if entry.attempts >= self.config.max_retry_attempts {
                    abandoned.push((entry.dest, seq));
                    state.pending.remove(&seq);
                    continue;
                }
                entry.attempts += 1;
                entry.last_send = now;
                entry.current_timeout = (entry.current_timeout * 2).min(self.config.max_retry_timeout);
                entry.next_timeout = now + entry.current_timeout;
                to_resend.push((seq, entry.packet.clone(), entry.dest));
            }
        }

        for (seq, packet, dest) in to_resend {
            if !self.allowed_to_send(dest) {
                log::debug!("[transport] retry send seq={seq} to {dest} dropped by send filter");
                continue;
            }
            if let Err(e) = self.socket.send_to(&packet, dest) {
                log::debug!("[transport] retry send seq={seq} to {dest} failed: {e}");
            }
        }

        for (dest, seq) in &abandoned {
            log::warn!("[transport] retry exhausted seq={seq} dest={dest}, dropping pending send");
        }
        abandoned
    }

    /// Number of in-flight pending sends (for status snapshots).
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Spawn the socket-receiver worker. Blocks on `recv_from` (bounded by a
    /// read timeout) until `shutdown` is observed.
    pub fn spawn_receiver(&self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let endpoint = self.clone();
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                endpoint.recv_once();
            }
        })
    }

    /// Spawn the dispatch worker that drains the receiver's handoff channel
    /// and runs ack/dedup/handler logic.
    pub fn spawn_dispatch_worker(&self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let endpoint = self.clone();
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                endpoint.dispatch_once(Duration::from_millis(200));
            }
        })
    }

    /// Spawn the retry-scan worker at `config.retry_scan_interval` cadence.
    pub fn spawn_retry_loop(&self, shutdown: Arc<AtomicBool>, hooks: Arc<dyn MeshHooks>) -> JoinHandle<()> {
        let endpoint = self.clone();
        let interval = self.config.retry_scan_interval;
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                for (dest, seq) in endpoint.retry_scan() {
                    hooks.on_retry_exhausted(dest, seq);
                }
            }
        })
    }
}
