// Gossip Engine for CoreLink
//
// Maintains a shared, eventually-consistent view of cluster membership
// and per-node GPU/metrics state across one multicast-reachable IPv4
// subnet, without a central coordinator. Two dissemination layers:
//
// - **Heartbeats**: periodic UDP-multicast announcements of the local
//   state, for low-latency spread.
// - **Anti-entropy**: periodic digest exchanges that repair divergence
//   when heartbeats are lost.
//
// Failure policy is best-effort, never fatal: after the sockets bind,
// every decode or IO error is logged and dropped, and the next
// periodic tick is the retry.

use crate::error::Result;
use parking_lot::Mutex;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};

pub mod message;
pub mod socket;
pub mod table;

use message::{GossipMessage, GpuInfo};
use socket::GossipSockets;
use table::{ClusterTable, NodeSnapshot};

/// Gossip multicast group; TTL 1 keeps traffic on the local subnet.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 77, 77);
pub const MULTICAST_TTL: u32 = 1;
pub const DEFAULT_GOSSIP_PORT: u16 = 47100;

/// Base period between heartbeats, jittered per emission.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);
pub const HEARTBEAT_JITTER: Duration = Duration::from_millis(1500);

/// Age at which a remote entry is reported stale.
pub const NODE_TIMEOUT: Duration = Duration::from_secs(20);

/// Age at which the reaper evicts a remote entry.
pub const NODE_REMOVE: Duration = Duration::from_secs(60);

/// Base period between anti-entropy digest rounds.
pub const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(10);

const ANTI_ENTROPY_JITTER_SECS: f64 = 2.0;
const REAPER_INTERVAL: Duration = Duration::from_secs(5);
const RECV_BUFFER: usize = 65_535;

/// Configuration for a gossip node. Wire-affecting values (group,
/// port, TTL) must match cluster-wide.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique per cluster, typically the hostname. Used verbatim on
    /// the wire; self-heartbeat suppression relies on it.
    pub node_id: String,

    /// Multicast gossip port; the anti-entropy responder binds port+1.
    pub port: u16,

    /// Negotiated link speed announced in heartbeats (Mbps).
    pub link_speed: u64,

    /// Maximum link speed announced in heartbeats (Mbps).
    pub link_speed_max: u64,

    pub multicast_group: Ipv4Addr,
    pub multicast_ttl: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_jitter: Duration,
    pub node_timeout: Duration,
    pub node_remove: Duration,
    pub anti_entropy_interval: Duration,
}

impl GossipConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port: DEFAULT_GOSSIP_PORT,
            link_speed: 0,
            link_speed_max: 0,
            multicast_group: MULTICAST_GROUP,
            multicast_ttl: MULTICAST_TTL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_jitter: HEARTBEAT_JITTER,
            node_timeout: NODE_TIMEOUT,
            node_remove: NODE_REMOVE,
            anti_entropy_interval: ANTI_ENTROPY_INTERVAL,
        }
    }

    /// Set the gossip port (anti-entropy responses use port + 1).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_link_speed(mut self, mbps: u64) -> Self {
        self.link_speed = mbps;
        self
    }

    pub fn with_link_speed_max(mut self, mbps: u64) -> Self {
        self.link_speed_max = mbps;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_anti_entropy_interval(mut self, interval: Duration) -> Self {
        self.anti_entropy_interval = interval;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_node_remove(mut self, timeout: Duration) -> Self {
        self.node_remove = timeout;
        self
    }

    pub fn anti_entropy_port(&self) -> u16 {
        self.port.wrapping_add(1)
    }
}

/// Handle to a gossip node. Cheap to clone; all clones address the
/// same node.
#[derive(Clone)]
pub struct GossipNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: GossipConfig,
    table: Mutex<ClusterTable>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<()>>>,
}

impl GossipNode {
    /// Create a node announcing `gpus`. Sockets are not bound until
    /// [`start`](Self::start).
    pub fn new(config: GossipConfig, gpus: Vec<GpuInfo>) -> Self {
        let table = ClusterTable::new(
            config.node_id.clone(),
            gpus,
            config.link_speed,
            config.link_speed_max,
        );
        Self {
            inner: Arc::new(NodeInner {
                config,
                table: Mutex::new(table),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Bind the sockets and spawn the four gossip loops. Idempotent;
    /// a second call on a running node is a no-op. Bind failures
    /// propagate and leave the node stopped.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = &self.inner.config;
        let sockets = match GossipSockets::bind(
            config.multicast_group,
            config.port,
            config.multicast_ttl,
        ) {
            Ok(sockets) => Arc::new(sockets),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        *self.inner.shutdown.lock() = Some(shutdown_tx);

        info!(
            "gossip node {} joined {}:{} (anti-entropy on {})",
            config.node_id,
            config.multicast_group,
            config.port,
            config.anti_entropy_port()
        );

        tokio::spawn(
            self.inner
                .clone()
                .heartbeat_loop(sockets.clone(), shutdown_rx.clone()),
        );
        tokio::spawn(
            self.inner
                .clone()
                .receive_loop(sockets.clone(), shutdown_rx.clone()),
        );
        tokio::spawn(
            self.inner
                .clone()
                .anti_entropy_loop(sockets, shutdown_rx.clone()),
        );
        tokio::spawn(self.inner.clone().reaper_loop(shutdown_rx));

        Ok(())
    }

    /// Signal all loops to exit; each observes the signal within ~1 s
    /// and the sockets close as the loops drop them. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(());
        }
        info!("gossip node {} stopped", self.inner.config.node_id);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Update the announced network throughput (Kbps). Callable from
    /// any thread at any rate.
    pub fn set_net_kbps(&self, value: f64) {
        self.inner.table.lock().set_net_kbps(value);
    }

    /// Record the most recent clock-drift sample (seconds). Local
    /// only; never carried on the wire.
    pub fn set_clock_drift(&self, value: f64) {
        self.inner.table.lock().set_clock_drift(value);
    }

    pub fn clock_drift(&self) -> f64 {
        self.inner.table.lock().clock_drift()
    }

    /// Ordered cluster view: the local node first (always online),
    /// remote nodes ascending by id with status derived at call time.
    /// Returns an owned copy; mutating it cannot touch node state.
    pub fn get_cluster_state(&self) -> Vec<NodeSnapshot> {
        self.inner
            .table
            .lock()
            .snapshot(Instant::now(), self.inner.config.node_timeout)
    }
}

impl NodeInner {
    /// Announce the local state every `heartbeat_interval`, jittered
    /// so node bursts decorrelate, with a 1 s floor.
    async fn heartbeat_loop(
        self: Arc<Self>,
        sockets: Arc<GossipSockets>,
        mut shutdown: watch::Receiver<()>,
    ) {
        while self.running.load(Ordering::SeqCst) {
            let heartbeat = GossipMessage::Heartbeat(self.table.lock().next_heartbeat());
            match message::encode(&heartbeat) {
                Ok(data) => {
                    if let Err(e) = sockets.send_multicast(&data).await {
                        debug!("heartbeat send failed: {}", e);
                    }
                }
                Err(e) => debug!("heartbeat encode failed: {}", e),
            }

            let jitter_secs = self.config.heartbeat_jitter.as_secs_f64();
            let jitter = rand::rng().random_range(-jitter_secs..=jitter_secs);
            let delay = (self.config.heartbeat_interval.as_secs_f64() + jitter).max(1.0);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(Duration::from_secs_f64(delay)) => {}
            }
        }
    }

    /// Wait for datagrams on the multicast and unicast sockets and
    /// dispatch by message kind. Receive errors never end the loop.
    async fn receive_loop(
        self: Arc<Self>,
        sockets: Arc<GossipSockets>,
        mut shutdown: watch::Receiver<()>,
    ) {
        let mut mcast_buf = vec![0u8; RECV_BUFFER];
        let mut unicast_buf = vec![0u8; RECV_BUFFER];

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = sockets.mcast_recv.recv_from(&mut mcast_buf) => {
                    match received {
                        Ok((len, src)) => self.handle_datagram(&mcast_buf[..len], src, &sockets).await,
                        Err(e) => debug!("multicast receive failed: {}", e),
                    }
                }
                received = sockets.unicast.recv_from(&mut unicast_buf) => {
                    match received {
                        Ok((len, src)) => self.handle_datagram(&unicast_buf[..len], src, &sockets).await,
                        Err(e) => debug!("unicast receive failed: {}", e),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr, sockets: &GossipSockets) {
        let msg = match message::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping datagram from {}: {}", src, e);
                return;
            }
        };

        match msg {
            GossipMessage::Heartbeat(state) => {
                // Our own heartbeats loop back via the multicast group.
                if state.node_id == self.config.node_id {
                    return;
                }
                self.table.lock().merge(state, Some(src.ip()), Instant::now());
            }

            GossipMessage::DigestReq { node_id, target, digest } => {
                if target != self.config.node_id {
                    return;
                }
                let updates = self.table.lock().updates_since(&digest);
                if updates.is_empty() {
                    return;
                }

                match message::encode_digest_resp(&self.config.node_id, updates) {
                    Ok(datagrams) => {
                        for datagram in datagrams {
                            if let Err(e) = sockets.send_unicast(&datagram, src.ip()).await {
                                debug!("anti-entropy reply to {} failed: {}", node_id, e);
                            }
                        }
                    }
                    Err(e) => debug!("anti-entropy reply encode failed: {}", e),
                }
            }

            GossipMessage::DigestResp { updates, .. } => {
                let now = Instant::now();
                let mut table = self.table.lock();
                for update in updates {
                    table.merge(update, None, now);
                }
            }
        }
    }

    /// Every `anti_entropy_interval` (jittered, 2 s floor), summarize
    /// the table and ask one random peer for what we are missing. The
    /// request is multicast with an explicit target so no unicast
    /// address is needed; only the target replies (unicast, port+1).
    async fn anti_entropy_loop(
        self: Arc<Self>,
        sockets: Arc<GossipSockets>,
        mut shutdown: watch::Receiver<()>,
    ) {
        while self.running.load(Ordering::SeqCst) {
            let jitter = rand::rng().random_range(-ANTI_ENTROPY_JITTER_SECS..=ANTI_ENTROPY_JITTER_SECS);
            let delay = (self.config.anti_entropy_interval.as_secs_f64() + jitter).max(2.0);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(Duration::from_secs_f64(delay)) => {}
            }

            let request = {
                let table = self.table.lock();
                let peers = table.peer_ids();
                if peers.is_empty() {
                    continue;
                }
                let target = peers[rand::rng().random_range(0..peers.len())].clone();
                GossipMessage::DigestReq {
                    node_id: self.config.node_id.clone(),
                    target,
                    digest: table.digest(),
                }
            };

            match message::encode(&request) {
                Ok(data) => {
                    if let Err(e) = sockets.send_multicast(&data).await {
                        debug!("digest request send failed: {}", e);
                    }
                }
                Err(e) => debug!("digest request encode failed: {}", e),
            }
        }
    }

    /// Evict entries that have been silent past `node_remove`.
    async fn reaper_loop(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(REAPER_INTERVAL) => {}
            }

            let removed = self
                .table
                .lock()
                .reap(Instant::now(), self.config.node_remove);
            if removed > 0 {
                info!("reaped {} silent node(s)", removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = GossipConfig::new("hostA");
        assert_eq!(config.node_id, "hostA");
        assert_eq!(config.port, 47100);
        assert_eq!(config.anti_entropy_port(), 47101);
        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 77, 77, 77));
        assert_eq!(config.multicast_ttl, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.node_timeout, Duration::from_secs(20));
        assert_eq!(config.node_remove, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = GossipConfig::new("hostA")
            .with_port(48200)
            .with_link_speed(1000)
            .with_link_speed_max(10000)
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_node_timeout(Duration::from_secs(4));

        assert_eq!(config.port, 48200);
        assert_eq!(config.anti_entropy_port(), 48201);
        assert_eq!(config.link_speed, 1000);
        assert_eq!(config.link_speed_max, 10000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.node_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_unstarted_node_serves_local_state() {
        let node = GossipNode::new(
            GossipConfig::new("hostA").with_link_speed(2500),
            vec![GpuInfo {
                id: 0,
                model: "A6000".to_string(),
                limit: "4.0 x 16".to_string(),
            }],
        );

        node.set_net_kbps(321.5);
        node.set_clock_drift(-0.04);

        let state = node.get_cluster_state();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].node_id, "hostA");
        assert_eq!(state[0].net_kbps, 321.5);
        assert_eq!(state[0].link_speed, 2500);
        assert_eq!(state[0].gpus.len(), 1);
        assert_eq!(node.clock_drift(), -0.04);
        assert!(!node.is_running());
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let node = GossipNode::new(GossipConfig::new("hostA"), Vec::new());
        node.stop();
        node.stop();
        assert!(!node.is_running());
    }
}
