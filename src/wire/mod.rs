// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec: framed packets with an integrity check over a JSON payload.
//!
//! Frame layout: `[version:u8][type:u8][seq:u32 BE][checksum:u32 BE][payload]`.
//! The checksum is the first four bytes of MD5 over `version||type||seq||payload`
//! — integrity only, never a security property.

use crate::config::{HEADER_LEN, WIRE_VERSION};
use crate::error::{Error, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Packet type byte. All but [`PacketType::Ack`] are themselves acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    SyncRequest = 2,
    SyncResponse = 3,
    Heartbeat = 4,
    Discovery = 5,
}

impl PacketType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Data),
            1 => Ok(Self::Ack),
            2 => Ok(Self::SyncRequest),
            3 => Ok(Self::SyncResponse),
            4 => Ok(Self::Heartbeat),
            5 => Ok(Self::Discovery),
            other => Err(Error::UnknownType(other)),
        }
    }

    /// Whether the receiver must emit an `ACK` for this type.
    pub fn needs_ack(self) -> bool {
        !matches!(self, Self::Ack)
    }
}

/// A decoded packet: header fields plus the raw JSON payload bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub ty: PacketType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// `{host, port}` address shape used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireAddr {
    pub host: String,
    pub port: u16,
}

impl From<SocketAddr> for WireAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl WireAddr {
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub address: WireAddr,
    pub state_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
    pub node_id: String,
    pub address: WireAddr,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub node_id: String,
    pub address: WireAddr,
    pub known_peers: Vec<KnownPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub node_id: String,
    pub state_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub node_id: String,
    pub data: std::collections::HashMap<String, (serde_json::Value, f64, String)>,
    pub tombstones: std::collections::HashMap<String, (f64, String)>,
    pub vector_clock: std::collections::HashMap<String, u64>,
}

/// Build a framed packet from header fields and a JSON-serializable payload.
///
/// Fails with [`Error::SendFailed`] if `payload` cannot be serialized — this
/// should not happen for the payload types in this module, but a caller-
/// supplied `T` is not otherwise guaranteed to serialize.
pub fn encode<T: Serialize>(ty: PacketType, seq: u32, payload: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload).map_err(|e| Error::SendFailed(e.to_string()))?;
    Ok(encode_raw(ty, seq, &body))
}

/// Build a framed packet from header fields and raw JSON bytes.
pub fn encode_raw(ty: PacketType, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(WIRE_VERSION);
    buf.push(ty as u8);
    buf.extend_from_slice(&seq.to_be_bytes());
    let checksum = compute_checksum(WIRE_VERSION, ty as u8, seq, payload);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn compute_checksum(version: u8, ty: u8, seq: u32, payload: &[u8]) -> u32 {
    let mut hasher = Md5::new();
    hasher.update([version, ty]);
    hasher.update(seq.to_be_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Validate length and checksum, then parse the header. Does not decode the
/// JSON payload — callers decode into the type-specific shape they expect.
pub fn decode(buf: &[u8]) -> Result<Packet> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }
    let version = buf[0];
    if version != WIRE_VERSION {
        return Err(Error::UnknownVersion(version));
    }
    let ty = PacketType::from_byte(buf[1])?;
    let seq = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let checksum = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let payload = &buf[HEADER_LEN..];

    let expected = compute_checksum(version, buf[1], seq, payload);
    if expected != checksum {
        return Err(Error::ChecksumMismatch);
    }

    Ok(Packet {
        ty,
        seq,
        payload: payload.to_vec(),
    })
}

/// Decode a packet's payload as `T`, mapping a JSON error into [`Error::DecodeFailed`].
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::DecodeFailed(e.to_string()))
}
