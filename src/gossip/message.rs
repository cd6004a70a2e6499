// Wire Codec for CoreLink Gossip
//
// Encodes and decodes the four gossip message kinds as self-describing
// JSON datagrams. The `type` field discriminates; every other field is
// optional on receive and defaults when absent (numeric -> 0, string ->
// "", list -> empty) so schema drift between versions is tolerated
// field-by-field. Unknown fields are ignored.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest payload that fits a single IPv4 UDP datagram.
pub const MAX_DATAGRAM: usize = 65_507;

/// One GPU record as announced by its origin node. The core forwards
/// these verbatim; only the web console interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    #[serde(default)]
    pub id: u32,

    #[serde(default)]
    pub model: String,

    /// PCIe link description, e.g. "4.0 x 16".
    #[serde(default)]
    pub limit: String,
}

/// A node's announced state: the payload of a heartbeat and of each
/// update entry inside a digest response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    #[serde(default)]
    pub node_id: String,

    #[serde(default)]
    pub gpus: Vec<GpuInfo>,

    /// Human-readable timestamp minted by the origin node; opaque here.
    #[serde(default)]
    pub timestamp: String,

    /// Monotonic per-origin counter; larger dominates when merging.
    #[serde(default)]
    pub seq: u64,

    #[serde(default)]
    pub net_kbps: f64,

    /// Origin wall-clock seconds; opaque, never used for ordering.
    #[serde(default)]
    pub epoch: f64,

    #[serde(default)]
    pub link_speed: u64,

    #[serde(default)]
    pub link_speed_max: u64,
}

/// Gossip message kinds on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Periodic multicast state announcement.
    Heartbeat(NodeState),

    /// Anti-entropy probe: `digest` summarizes what the sender knows.
    /// Only the node named by `target` responds.
    DigestReq {
        #[serde(default)]
        node_id: String,

        #[serde(default)]
        target: String,

        #[serde(default)]
        digest: BTreeMap<String, u64>,
    },

    /// Anti-entropy reply carrying the entries the requester is missing.
    DigestResp {
        #[serde(default)]
        node_id: String,

        #[serde(default)]
        updates: Vec<NodeState>,
    },
}

/// Serialize a message into a UDP payload.
pub fn encode(msg: &GossipMessage) -> Result<Vec<u8>> {
    serde_json::to_vec(msg)
        .map_err(|e| LinkError::Serialization(format!("Failed to encode message: {}", e)))
}

/// Parse a received datagram. Malformed payloads and unknown message
/// types surface as errors the receive loop drops silently.
pub fn decode(data: &[u8]) -> Result<GossipMessage> {
    serde_json::from_slice(data)
        .map_err(|e| LinkError::Serialization(format!("Failed to decode message: {}", e)))
}

/// Package digest-response updates into one or more datagrams, each at
/// most [`MAX_DATAGRAM`] bytes and independently parseable. An update
/// too large to fit a datagram on its own is dropped.
pub fn encode_digest_resp(node_id: &str, updates: Vec<NodeState>) -> Result<Vec<Vec<u8>>> {
    // Exact size bookkeeping for serde_json's compact output: the
    // envelope length plus each entry's length plus one comma per
    // entry after the first.
    let envelope = encode(&GossipMessage::DigestResp {
        node_id: node_id.to_string(),
        updates: Vec::new(),
    })?
    .len();

    let mut datagrams = Vec::new();
    let mut batch: Vec<NodeState> = Vec::new();
    let mut batch_len = envelope;

    for update in updates {
        let entry_len = serde_json::to_vec(&update)
            .map_err(|e| LinkError::Serialization(format!("Failed to encode update: {}", e)))?
            .len();

        if envelope + entry_len > MAX_DATAGRAM {
            tracing::warn!(
                "dropping oversized gossip update for {} ({} bytes)",
                update.node_id,
                entry_len
            );
            continue;
        }

        let added = entry_len + usize::from(!batch.is_empty());
        if batch_len + added > MAX_DATAGRAM {
            datagrams.push(flush(node_id, std::mem::take(&mut batch))?);
            batch_len = envelope + entry_len;
        } else {
            batch_len += added;
        }
        batch.push(update);
    }

    if !batch.is_empty() {
        datagrams.push(flush(node_id, batch)?);
    }

    Ok(datagrams)
}

fn flush(node_id: &str, updates: Vec<NodeState>) -> Result<Vec<u8>> {
    encode(&GossipMessage::DigestResp {
        node_id: node_id.to_string(),
        updates,
    })
}
