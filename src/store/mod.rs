// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CRDT store: an LWW register with tombstone-based deletion and a
//! vector-clock-tracked, deterministic and commutative merge.
//!
//! All public operations take the store's mutex; callbacks fire **after**
//! the guard is dropped so a callback may safely re-enter the store.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// `(value, timestamp, origin_node_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntry {
    pub value: Value,
    pub timestamp: f64,
    pub origin: String,
}

/// `(timestamp, origin_node_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub timestamp: f64,
    pub origin: String,
}

/// `(timestamp, origin)` ordering used by every LWW comparison in this
/// module: later timestamp wins; ties break on the lexicographically
/// greater node id. Equal-on-both wins resolve identically everywhere.
fn lww_order(a_ts: f64, a_id: &str, b_ts: f64, b_id: &str) -> std::cmp::Ordering {
    a_ts.partial_cmp(&b_ts)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}

/// A full point-in-time view of the store, as exchanged in `SYNC_RESPONSE`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: HashMap<String, (Value, f64, String)>,
    pub tombstones: HashMap<String, (f64, String)>,
    pub vector_clock: HashMap<String, u64>,
}

/// What kind of change fired a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Set,
    Delete,
    Merge,
}

impl ChangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Set => "set",
            ChangeOp::Delete => "delete",
            ChangeOp::Merge => "merge",
        }
    }
}

/// A single key mutation, reported outside the store's lock.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Option<Value>,
    pub op: ChangeOp,
}

struct Inner {
    self_id: String,
    registers: HashMap<String, RegisterEntry>,
    tombstones: HashMap<String, Tombstone>,
    vector_clock: HashMap<String, u64>,
    version: u64,
}

/// The replicated key/value CRDT. Cheaply cloneable (`Arc` inside); share one
/// instance between the mesh node's timers and the public API.
#[derive(Clone)]
pub struct CrdtStore {
    inner: Arc<Mutex<Inner>>,
}

impl CrdtStore {
    pub fn new(self_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        let mut vector_clock = HashMap::new();
        vector_clock.insert(self_id.clone(), 0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                self_id,
                registers: HashMap::new(),
                tombstones: HashMap::new(),
                vector_clock,
                version: 0,
            })),
        }
    }

    /// Current state version (bumped on every mutating local op or merge).
    pub fn state_version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Number of live (non-tombstoned) keys.
    pub fn len(&self) -> usize {
        self.inner.lock().registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local write: capture `now`, bump self's clock, fire `on_change("set")`.
    pub fn set(&self, key: impl Into<String>, value: Value) -> ChangeEvent {
        let key = key.into();
        let now = now_secs();
        let mut inner = self.inner.lock();
        let self_id = inner.self_id.clone();
        inner.registers.insert(
            key.clone(),
            RegisterEntry {
                value: value.clone(),
                timestamp: now,
                origin: self_id.clone(),
            },
        );
        // A fresher write erases a tombstone it strictly dominates.
        if let Some(tomb) = inner.tombstones.get(&key) {
            if lww_order(tomb.timestamp, &tomb.origin, now, &self_id).is_lt() {
                inner.tombstones.remove(&key);
            }
        }
        bump_clock_and_version(&mut inner);
        ChangeEvent {
            key,
            value: Some(value),
            op: ChangeOp::Set,
        }
    }

    /// Local delete: record a tombstone at `now`, remove the register entry.
    pub fn delete(&self, key: impl Into<String>) -> ChangeEvent {
        let key = key.into();
        let now = now_secs();
        let mut inner = self.inner.lock();
        let self_id = inner.self_id.clone();
        inner.registers.remove(&key);
        inner.tombstones.insert(
            key.clone(),
            Tombstone {
                timestamp: now,
                origin: self_id,
            },
        );
        bump_clock_and_version(&mut inner);
        ChangeEvent {
            key,
            value: None,
            op: ChangeOp::Delete,
        }
    }

    /// Live value for `key`, or `None` if absent or shadowed by a tombstone.
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock();
        inner.registers.get(key).map(|e| e.value.clone())
    }

    /// All live keys and their values.
    pub fn list(&self) -> Vec<(String, Value)> {
        let inner = self.inner.lock();
        inner
            .registers
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// A serializable view used to build `SYNC_RESPONSE`.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            data: inner
                .registers
                .iter()
                .map(|(k, e)| (k.clone(), (e.value.clone(), e.timestamp, e.origin.clone())))
                .collect(),
            tombstones: inner
                .tombstones
                .iter()
                .map(|(k, t)| (k.clone(), (t.timestamp, t.origin.clone())))
                .collect(),
            vector_clock: inner.vector_clock.clone(),
        }
    }

    /// Apply a remote snapshot key-by-key under LWW, merge the vector clock
    /// component-wise by max. Returns the per-key change events for every
    /// key actually mutated (empty if the merge changed nothing).
    ///
    /// A structurally invalid snapshot — a non-finite LWW timestamp — is
    /// rejected wholesale with [`Error::MalformedSnapshot`] before any of
    /// the store's state is touched; the caller discards it rather than
    /// merging a partial, possibly-corrupt view.
    pub fn merge(&self, remote: &Snapshot) -> Result<Vec<ChangeEvent>> {
        validate_snapshot(remote)?;

        let mut events = Vec::new();
        let mut inner = self.inner.lock();

        let mut keys: std::collections::HashSet<&String> = std::collections::HashSet::new();
        keys.extend(inner.registers.keys());
        keys.extend(inner.tombstones.keys());
        keys.extend(remote.data.keys());
        keys.extend(remote.tombstones.keys());
        let keys: Vec<String> = keys.into_iter().cloned().collect();

        for key in keys {
            if let Some(event) = merge_key(&mut inner, &key, remote) {
                events.push(event);
            }
        }

        for (node, remote_seq) in &remote.vector_clock {
            let entry = inner.vector_clock.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*remote_seq);
        }

        if !events.is_empty() {
            inner.version += 1;
        }

        Ok(events)
    }
}

/// Reject a snapshot carrying a non-finite (NaN or infinite) LWW timestamp —
/// such a value would make [`lww_order`]'s comparison non-deterministic
/// (`partial_cmp` returns `None`) and could let a single bad peer shadow
/// every other write for a key forever.
fn validate_snapshot(remote: &Snapshot) -> Result<()> {
    for (key, (_, ts, _)) in &remote.data {
        if !ts.is_finite() {
            return Err(Error::MalformedSnapshot(format!(
                "non-finite timestamp {ts} for key {key:?}"
            )));
        }
    }
    for (key, (ts, _)) in &remote.tombstones {
        if !ts.is_finite() {
            return Err(Error::MalformedSnapshot(format!(
                "non-finite tombstone timestamp {ts} for key {key:?}"
            )));
        }
    }
    Ok(())
}

/// Candidate writes considered during merge: either a live value or "dead"
/// (tombstoned). Ordered the same way on both sides per the LWW rule.
enum Candidate {
    Alive(Value, f64, String),
    Dead(f64, String),
}

impl Candidate {
    fn ts_id(&self) -> (f64, &str) {
        match self {
            Candidate::Alive(_, ts, id) => (*ts, id.as_str()),
            Candidate::Dead(ts, id) => (*ts, id.as_str()),
        }
    }
}

fn merge_key(inner: &mut Inner, key: &str, remote: &Snapshot) -> Option<ChangeEvent> {
    let mut candidates: Vec<Candidate> = Vec::with_capacity(4);

    if let Some(e) = inner.registers.get(key) {
        candidates.push(Candidate::Alive(e.value.clone(), e.timestamp, e.origin.clone()));
    }
    if let Some(t) = inner.tombstones.get(key) {
        candidates.push(Candidate::Dead(t.timestamp, t.origin.clone()));
    }
    if let Some((v, ts, id)) = remote.data.get(key) {
        candidates.push(Candidate::Alive(v.clone(), *ts, id.clone()));
    }
    if let Some((ts, id)) = remote.tombstones.get(key) {
        candidates.push(Candidate::Dead(*ts, id.clone()));
    }

    let winner_idx = candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            let (ats, aid) = a.ts_id();
            let (bts, bid) = b.ts_id();
            lww_order(ats, aid, bts, bid)
        })
        .map(|(i, _)| i)?;

    let before_alive = inner.registers.get(key).cloned();
    let before_dead = inner.tombstones.get(key).cloned();

    let changed = match &candidates[winner_idx] {
        Candidate::Dead(ts, id) => {
            let is_new = before_dead.as_ref().map(|t| t.timestamp != *ts || &t.origin != id).unwrap_or(true);
            inner.tombstones.insert(
                key.to_string(),
                Tombstone {
                    timestamp: *ts,
                    origin: id.clone(),
                },
            );
            let had_register = inner.registers.remove(key).is_some();
            is_new || had_register
        }
        Candidate::Alive(v, ts, id) => {
            let is_new = before_alive
                .as_ref()
                .map(|e| e.timestamp != *ts || &e.origin != id || &e.value != v)
                .unwrap_or(true);
            inner.registers.insert(
                key.to_string(),
                RegisterEntry {
                    value: v.clone(),
                    timestamp: *ts,
                    origin: id.clone(),
                },
            );
            let had_tombstone = inner.tombstones.remove(key).is_some();
            is_new || had_tombstone
        }
    };

    if !changed {
        return None;
    }

    let value = match &candidates[winner_idx] {
        Candidate::Dead(..) => None,
        Candidate::Alive(v, ..) => Some(v.clone()),
    };
    Some(ChangeEvent {
        key: key.to_string(),
        value,
        op: ChangeOp::Merge,
    })
}

fn bump_clock_and_version(inner: &mut Inner) {
    let self_id = inner.self_id.clone();
    let counter = inner.vector_clock.entry(self_id).or_insert(0);
    *counter += 1;
    inner.version += 1;
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap_from(store: &CrdtStore) -> Snapshot {
        store.snapshot()
    }

    #[test]
    fn set_then_get() {
        let store = CrdtStore::new("a");
        store.set("k", Value::String("v".into()));
        assert_eq!(store.get("k"), Some(Value::String("v".into())));
    }

    #[test]
    fn delete_shadows_register() {
        let store = CrdtStore::new("a");
        store.set("k", Value::from(1));
        store.delete("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn merge_is_idempotent() {
        let a = CrdtStore::new("node_a");
        a.set("x", Value::from("hello"));
        let snap = snap_from(&a);

        let b = CrdtStore::new("node_b");
        let first = b.merge(&snap).unwrap();
        assert_eq!(first.len(), 1);
        let second = b.merge(&snap).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn merge_is_commutative() {
        let a = CrdtStore::new("node_a");
        a.set("x", Value::from(1));
        let snap_a = a.snapshot();

        let b = CrdtStore::new("node_b");
        b.set("y", Value::from(2));
        let snap_b = b.snapshot();

        let left = CrdtStore::new("left");
        left.merge(&snap_a).unwrap();
        left.merge(&snap_b).unwrap();

        let right = CrdtStore::new("right");
        right.merge(&snap_b).unwrap();
        right.merge(&snap_a).unwrap();

        let mut left_list = left.list();
        let mut right_list = right.list();
        left_list.sort_by(|a, b| a.0.cmp(&b.0));
        right_list.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(left_list, right_list);
    }

    #[test]
    fn lww_tiebreak_on_node_id() {
        let a = CrdtStore::new("node_a");
        let b = CrdtStore::new("node_b");

        // Force identical timestamps to exercise the node-id tiebreak.
        {
            let mut inner = a.inner.lock();
            inner.registers.insert(
                "x".into(),
                RegisterEntry {
                    value: Value::from("A"),
                    timestamp: 1000.0,
                    origin: "node_a".into(),
                },
            );
        }
        {
            let mut inner = b.inner.lock();
            inner.registers.insert(
                "x".into(),
                RegisterEntry {
                    value: Value::from("B"),
                    timestamp: 1000.0,
                    origin: "node_b".into(),
                },
            );
        }

        let snap_b = b.snapshot();
        a.merge(&snap_b).unwrap();
        // node_b > node_a lexicographically, so B wins on both sides.
        assert_eq!(a.get("x"), Some(Value::from("B")));

        let snap_a = a.snapshot();
        let c = CrdtStore::new("node_c");
        c.merge(&snap_a).unwrap();
        assert_eq!(c.get("x"), Some(Value::from("B")));
    }

    #[test]
    fn delete_beats_earlier_write() {
        let a = CrdtStore::new("node_a");
        {
            let mut inner = a.inner.lock();
            inner.registers.insert(
                "k".into(),
                RegisterEntry {
                    value: Value::from("v1"),
                    timestamp: 100.0,
                    origin: "node_a".into(),
                },
            );
        }
        let b = CrdtStore::new("node_b");
        {
            let mut inner = b.inner.lock();
            inner.tombstones.insert(
                "k".into(),
                Tombstone {
                    timestamp: 200.0,
                    origin: "node_b".into(),
                },
            );
        }

        let snap_b = b.snapshot();
        a.merge(&snap_b).unwrap();
        assert_eq!(a.get("k"), None);

        let snap_a = a.snapshot();
        assert_eq!(
            snap_a.tombstones.get("k"),
            Some(&(200.0, "node_b".to_string()))
        );
    }

    #[test]
    fn write_beats_earlier_delete() {
        let a = CrdtStore::new("node_a");
        {
            let mut inner = a.inner.lock();
            inner.tombstones.insert(
                "k".into(),
                Tombstone {
                    timestamp: 100.0,
                    origin: "node_a".into(),
                },
            );
        }
        let b = CrdtStore::new("node_b");
        {
            let mut inner = b.inner.lock();
            inner.registers.insert(
                "k".into(),
                RegisterEntry {
                    value: Value::from("v2"),
                    timestamp: 200.0,
                    origin: "node_b".into(),
                },
            );
        }

        let snap_b = b.snapshot();
        a.merge(&snap_b).unwrap();
        assert_eq!(a.get("k"), Some(Value::from("v2")));
    }

    #[test]
    fn vector_clock_merges_by_max_and_never_shrinks() {
        let a = CrdtStore::new("node_a");
        a.set("k1", Value::from(1));
        a.set("k2", Value::from(2));
        assert_eq!(a.snapshot().vector_clock.get("node_a"), Some(&2));

        let b = CrdtStore::new("node_b");
        b.set("k3", Value::from(3));
        let snap_b = b.snapshot();

        a.merge(&snap_b).unwrap();
        let clock = a.snapshot().vector_clock;
        assert_eq!(clock.get("node_a"), Some(&2));
        assert_eq!(clock.get("node_b"), Some(&1));
    }

    #[test]
    fn empty_value_and_key_roundtrip() {
        let store = CrdtStore::new("a");
        store.set("", Value::Null);
        assert_eq!(store.get(""), Some(Value::Null));
    }

    #[test]
    fn merge_rejects_non_finite_timestamp() {
        let a = CrdtStore::new("node_a");
        let mut snap = a.snapshot();
        snap.data.insert("k".into(), (Value::from(1), f64::NAN, "node_x".into()));

        let b = CrdtStore::new("node_b");
        let err = b.merge(&snap).unwrap_err();
        assert!(matches!(err, Error::MalformedSnapshot(_)));
        // Rejected wholesale: nothing from the bad snapshot was applied.
        assert_eq!(b.get("k"), None);
    }
}
