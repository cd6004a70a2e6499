// Lifecycle and ingest tests for a running gossip node.
//
// Datagrams are delivered over loopback to the node's unicast
// responder socket; the dispatcher routes by message kind regardless
// of which socket a datagram arrived on, so these tests avoid
// depending on multicast routing in the test environment.

use corelink::gossip::{GossipConfig, GossipNode};
use corelink::NodeStatus;
use serde_json::json;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::sleep;

async fn started_node(node_id: &str, port: u16) -> GossipNode {
    let config = GossipConfig::new(node_id).with_port(port);
    let node = GossipNode::new(config, Vec::new());
    node.start().await.expect("node should start");
    node
}

async fn send_json(value: &serde_json::Value, port: u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(value.to_string().as_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();
}

/// Poll the cluster state until `peer` appears or two seconds pass.
async fn wait_for_peer(node: &GossipNode, peer: &str) -> bool {
    for _ in 0..40 {
        if node
            .get_cluster_state()
            .iter()
            .any(|n| n.node_id == peer)
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

fn heartbeat(node_id: &str, seq: u64) -> serde_json::Value {
    json!({
        "type": "heartbeat",
        "node_id": node_id,
        "seq": seq,
        "gpus": [{"id": 0, "model": "A6000", "limit": "4.0 x 16"}],
        "timestamp": "01JAN25 00:00:00utc",
        "net_kbps": 0,
        "epoch": 0,
        "link_speed": 0,
        "link_speed_max": 0,
    })
}

#[tokio::test]
async fn test_heartbeat_ingest_and_idempotent_lifecycle() {
    let node = started_node("node-a", 49150).await;
    node.start().await.expect("second start is a no-op");

    send_json(&heartbeat("node-b", 1), 49151).await;
    assert!(wait_for_peer(&node, "node-b").await);

    let state = node.get_cluster_state();
    assert_eq!(state[0].node_id, "node-a");
    assert_eq!(state[0].status, NodeStatus::Online);

    let peer = state.iter().find(|n| n.node_id == "node-b").unwrap();
    assert_eq!(peer.status, NodeStatus::Online);
    assert_eq!(peer.gpus.len(), 1);
    assert_eq!(peer.gpus[0].model, "A6000");

    node.stop();
    node.stop();
    assert!(!node.is_running());
}

#[tokio::test]
async fn test_stale_sequence_ignored_over_wire() {
    let node = started_node("node-a", 49160).await;

    send_json(&heartbeat("node-b", 5), 49161).await;
    assert!(wait_for_peer(&node, "node-b").await);

    // Replay the same sequence with an empty GPU list; the stored
    // entry must keep the original GPUs.
    let mut replay = heartbeat("node-b", 5);
    replay["gpus"] = json!([]);
    send_json(&replay, 49161).await;
    sleep(Duration::from_millis(300)).await;

    let state = node.get_cluster_state();
    let peer = state.iter().find(|n| n.node_id == "node-b").unwrap();
    assert_eq!(peer.gpus.len(), 1);

    node.stop();
}

#[tokio::test]
async fn test_digest_resp_ingest_and_self_exclusion() {
    let node = started_node("node-a", 49170).await;

    // An anti-entropy burst carrying a new peer and an echo of this
    // node; the echo must never enter the table.
    let resp = json!({
        "type": "digest_resp",
        "node_id": "node-b",
        "updates": [
            {"node_id": "node-c", "seq": 2, "gpus": [], "timestamp": "01JAN25 00:00:00utc",
             "net_kbps": 1.5, "epoch": 0, "link_speed": 100, "link_speed_max": 1000},
            {"node_id": "node-a", "seq": 99, "gpus": [], "timestamp": "01JAN25 00:00:00utc",
             "net_kbps": 0, "epoch": 0, "link_speed": 0, "link_speed_max": 0},
        ],
    });
    send_json(&resp, 49171).await;
    assert!(wait_for_peer(&node, "node-c").await);

    let state = node.get_cluster_state();
    let own_rows = state.iter().filter(|n| n.node_id == "node-a").count();
    assert_eq!(own_rows, 1);

    let peer = state.iter().find(|n| n.node_id == "node-c").unwrap();
    assert_eq!(peer.net_kbps, 1.5);
    assert_eq!(peer.link_speed_max, 1000);

    node.stop();
}

#[tokio::test]
async fn test_malformed_datagrams_do_not_kill_the_receiver() {
    let node = started_node("node-a", 49180).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for garbage in [
        &b"{half a json"[..],
        &[0xff, 0xfe, 0x00][..],
        &br#"{"type":"leader_election"}"#[..],
        &b""[..],
    ] {
        socket.send_to(garbage, ("127.0.0.1", 49181)).await.unwrap();
    }

    // The loop must still be alive and ingesting afterwards.
    send_json(&heartbeat("node-b", 1), 49181).await;
    assert!(wait_for_peer(&node, "node-b").await);

    node.stop();
}

#[tokio::test]
async fn test_digest_req_for_other_target_is_ignored() {
    let node = started_node("node-a", 49190).await;

    send_json(&heartbeat("node-b", 3), 49191).await;
    assert!(wait_for_peer(&node, "node-b").await);

    // A probe addressed to a different node must not produce a reply
    // or disturb the table.
    let req = json!({
        "type": "digest_req",
        "node_id": "node-t",
        "target": "node-x",
        "digest": {},
    });
    send_json(&req, 49191).await;
    sleep(Duration::from_millis(200)).await;

    let state = node.get_cluster_state();
    assert_eq!(state.len(), 2);
    assert!(node.is_running());

    node.stop();
}

#[tokio::test]
async fn test_start_failure_leaves_node_stopped() {
    // Port 65535 leaves no room for the anti-entropy responder.
    let node = GossipNode::new(GossipConfig::new("node-x").with_port(65535), Vec::new());
    assert!(node.start().await.is_err());
    assert!(!node.is_running());
}
