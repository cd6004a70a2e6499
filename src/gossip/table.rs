// Cluster Table for CoreLink Gossip
//
// Owns everything the gossip node knows: the local node's announced
// state (sequence counter included) and one entry per remote node.
// Every mutation of remote state funnels through `merge`, which is
// monotone in `seq` per node. The table is wrapped in a single mutex
// by the gossip node; no method blocks or performs IO.

use super::message::{GpuInfo, NodeState};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Derived health of a remote entry, computed from `last_seen` age at
/// read time. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Stale,
}

/// One row of the cluster view handed to external consumers. A deep
/// copy: callers cannot reach internal state through it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub gpus: Vec<GpuInfo>,
    pub timestamp: String,
    pub status: NodeStatus,
    pub net_kbps: f64,
    pub epoch: f64,
    pub link_speed: u64,
    pub link_speed_max: u64,
}

/// State held for one remote node.
#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub gpus: Vec<GpuInfo>,
    pub timestamp: String,
    pub seq: u64,

    /// Local monotonic time of the last accepted update.
    pub last_seen: Instant,

    /// Source IPv4 of the last accepted update, "" if unknown.
    pub ip: String,

    pub net_kbps: f64,
    pub epoch: f64,
    pub link_speed: u64,
    pub link_speed_max: u64,
}

/// Cluster membership table plus the local node's own announced state.
pub(crate) struct ClusterTable {
    node_id: String,
    gpus: Vec<GpuInfo>,
    seq: u64,
    net_kbps: f64,
    clock_drift: f64,
    link_speed: u64,
    link_speed_max: u64,
    peers: HashMap<String, NodeEntry>,
}

impl ClusterTable {
    pub fn new(node_id: String, gpus: Vec<GpuInfo>, link_speed: u64, link_speed_max: u64) -> Self {
        Self {
            node_id,
            gpus,
            seq: 0,
            net_kbps: 0.0,
            clock_drift: 0.0,
            link_speed,
            link_speed_max,
            peers: HashMap::new(),
        }
    }

    pub fn set_net_kbps(&mut self, value: f64) {
        self.net_kbps = value;
    }

    pub fn set_clock_drift(&mut self, value: f64) {
        self.clock_drift = value;
    }

    pub fn clock_drift(&self) -> f64 {
        self.clock_drift
    }

    /// Ingest one remote state record. Returns true if the table
    /// changed. Entries about the local node and entries that do not
    /// dominate the stored `seq` are discarded; ties keep the existing
    /// entry. An accepted update refreshes `last_seen` and adopts
    /// `src_ip` when known.
    pub fn merge(&mut self, state: NodeState, src_ip: Option<IpAddr>, now: Instant) -> bool {
        if state.node_id.is_empty() || state.node_id == self.node_id {
            return false;
        }

        if let Some(existing) = self.peers.get(&state.node_id) {
            if state.seq <= existing.seq {
                return false;
            }
        }

        let ip = match src_ip {
            Some(addr) => addr.to_string(),
            None => self
                .peers
                .get(&state.node_id)
                .map(|e| e.ip.clone())
                .unwrap_or_default(),
        };

        self.peers.insert(
            state.node_id,
            NodeEntry {
                gpus: state.gpus,
                timestamp: state.timestamp,
                seq: state.seq,
                last_seen: now,
                ip,
                net_kbps: state.net_kbps,
                epoch: state.epoch,
                link_speed: state.link_speed,
                link_speed_max: state.link_speed_max,
            },
        );
        true
    }

    /// Advance the local sequence counter and return the state to
    /// announce. Called once per heartbeat, under the table lock, so a
    /// heartbeat with sequence k+1 is never built before the one with k.
    pub fn next_heartbeat(&mut self) -> NodeState {
        self.seq += 1;
        self.local_state()
    }

    /// The local node's current announced state with a freshly minted
    /// timestamp and epoch.
    pub fn local_state(&self) -> NodeState {
        NodeState {
            node_id: self.node_id.clone(),
            gpus: self.gpus.clone(),
            timestamp: wall_timestamp(),
            seq: self.seq,
            net_kbps: self.net_kbps,
            epoch: epoch_seconds(),
            link_speed: self.link_speed,
            link_speed_max: self.link_speed_max,
        }
    }

    /// Compact `{node_id -> seq}` summary of everything this node
    /// knows, itself included.
    pub fn digest(&self) -> BTreeMap<String, u64> {
        let mut digest: BTreeMap<String, u64> = self
            .peers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.seq))
            .collect();
        digest.insert(self.node_id.clone(), self.seq);
        digest
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Entries where this node is strictly ahead of the requester's
    /// digest (absent ids count as seq 0), the local node included.
    pub fn updates_since(&self, their_digest: &BTreeMap<String, u64>) -> Vec<NodeState> {
        let mut updates: Vec<NodeState> = self
            .peers
            .iter()
            .filter(|(id, entry)| entry.seq > their_digest.get(*id).copied().unwrap_or(0))
            .map(|(id, entry)| NodeState {
                node_id: id.clone(),
                gpus: entry.gpus.clone(),
                timestamp: entry.timestamp.clone(),
                seq: entry.seq,
                net_kbps: entry.net_kbps,
                epoch: entry.epoch,
                link_speed: entry.link_speed,
                link_speed_max: entry.link_speed_max,
            })
            .collect();

        if self.seq > their_digest.get(&self.node_id).copied().unwrap_or(0) {
            updates.push(self.local_state());
        }

        updates
    }

    /// Ordered cluster view: the local node first, then remote entries
    /// ascending by node id, each with its status derived from
    /// `last_seen` age against `node_timeout`.
    pub fn snapshot(&self, now: Instant, node_timeout: Duration) -> Vec<NodeSnapshot> {
        let mut nodes = Vec::with_capacity(self.peers.len() + 1);

        nodes.push(NodeSnapshot {
            node_id: self.node_id.clone(),
            gpus: self.gpus.clone(),
            timestamp: wall_timestamp(),
            status: NodeStatus::Online,
            net_kbps: self.net_kbps,
            epoch: epoch_seconds(),
            link_speed: self.link_speed,
            link_speed_max: self.link_speed_max,
        });

        let mut ids: Vec<&String> = self.peers.keys().collect();
        ids.sort();

        for id in ids {
            let entry = &self.peers[id];
            let status = if now.duration_since(entry.last_seen) < node_timeout {
                NodeStatus::Online
            } else {
                NodeStatus::Stale
            };
            nodes.push(NodeSnapshot {
                node_id: id.clone(),
                gpus: entry.gpus.clone(),
                timestamp: entry.timestamp.clone(),
                status,
                net_kbps: entry.net_kbps,
                epoch: entry.epoch,
                link_speed: entry.link_speed,
                link_speed_max: entry.link_speed_max,
            });
        }

        nodes
    }

    /// Drop every entry not heard from within `node_remove`. Returns
    /// the number of evicted entries.
    pub fn reap(&mut self, now: Instant, node_remove: Duration) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|_, entry| now.duration_since(entry.last_seen) <= node_remove);
        before - self.peers.len()
    }

    #[cfg(test)]
    pub fn peer(&self, node_id: &str) -> Option<&NodeEntry> {
        self.peers.get(node_id)
    }
}

/// Human-readable announce timestamp, e.g. "01JAN25 00:00:00utc".
fn wall_timestamp() -> String {
    let stamp = Utc::now().format("%d%b%y %H:%M:%S").to_string();
    format!("{}utc", stamp.to_uppercase())
}

/// Wall-clock seconds carried opaquely in the `epoch` field.
fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
