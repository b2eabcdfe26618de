// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the mesh node.
//!
//! Mirrors the transport/integrity/decode/merge error classes described for
//! this system: most are recoverable and only ever logged by a background
//! worker, never propagated up through a panic.

/// Errors returned by public, synchronous `meshkv` operations.
#[derive(Debug)]
pub enum Error {
    /// Socket bind failed at startup (fatal).
    BindFailed(std::io::Error),
    /// A reliable send could not be queued (encode failure).
    SendFailed(String),
    /// Wire packet shorter than the 10-byte fixed header.
    Truncated,
    /// Checksum over `version||type||seq||payload` did not match.
    ChecksumMismatch,
    /// Protocol version byte not recognized.
    UnknownVersion(u8),
    /// Packet type byte not recognized.
    UnknownType(u8),
    /// Payload did not parse as the JSON shape expected for its type.
    DecodeFailed(String),
    /// A remote snapshot could not be applied (malformed keys/values).
    MalformedSnapshot(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BindFailed(e) => write!(f, "socket bind failed: {e}"),
            Error::SendFailed(msg) => write!(f, "send failed: {msg}"),
            Error::Truncated => write!(f, "packet truncated (< 10 byte header)"),
            Error::ChecksumMismatch => write!(f, "checksum mismatch"),
            Error::UnknownVersion(v) => write!(f, "unknown wire version: {v}"),
            Error::UnknownType(t) => write!(f, "unknown packet type: {t}"),
            Error::DecodeFailed(msg) => write!(f, "payload decode failed: {msg}"),
            Error::MalformedSnapshot(msg) => write!(f, "malformed snapshot: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::BindFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenient alias for `meshkv` results.
pub type Result<T> = core::result::Result<T, Error>;
