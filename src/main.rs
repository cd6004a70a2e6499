// # CoreLink Node
//
// Main entry point for a CoreLink cluster node. Probes the local
// GPUs, starts the gossip engine, and feeds it resource metrics
// until interrupted.

use corelink::gossip::{GossipConfig, GossipNode, DEFAULT_GOSSIP_PORT};
use corelink::monitor::{drift, AppMonitor, MonitorConfig};
use corelink::{gpu, LinkError, Result, VERSION};
use std::time::Duration;
use tracing::{debug, info, warn};

const METRICS_INTERVAL: Duration = Duration::from_secs(3);
const DRIFT_INTERVAL: Duration = Duration::from_secs(900);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let hostname = std::env::var("CORELINK_HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| sys_info::hostname().ok())
        .unwrap_or_else(|| "corelink-node".to_string());

    let port = std::env::var("CORELINK_GOSSIP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_GOSSIP_PORT);

    info!("Initializing CoreLink node {}", hostname);
    info!("Version: {}", VERSION);

    let gpus = gpu::detect_gpus().await;
    if gpus.is_empty() {
        warn!("No NVIDIA GPUs detected; announcing an empty GPU list");
    } else {
        for gpu in &gpus {
            info!("GPU {}: {} ({})", gpu.id, gpu.model, gpu.limit);
        }
    }

    let monitor = AppMonitor::new(MonitorConfig::default());
    let link_speed = monitor.link_speed();
    if link_speed > 0 {
        info!("Link speed: {} Mbps", link_speed);
    }

    let config = GossipConfig::new(hostname)
        .with_port(port)
        .with_link_speed(link_speed)
        .with_link_speed_max(link_speed);

    let node = GossipNode::new(config, gpus);
    node.start().await?;
    info!("Gossip engine running on port {}", port);

    spawn_metrics_push(node.clone(), monitor);
    spawn_drift_refresh(node.clone());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| LinkError::Internal(format!("Failed to wait for shutdown signal: {}", e)))?;

    info!("Shutting down");
    node.stop();
    Ok(())
}

/// Sample resource metrics every few seconds and push the network
/// rate into the gossip state.
fn spawn_metrics_push(node: GossipNode, mut monitor: AppMonitor) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(METRICS_INTERVAL);
        tick.tick().await; // first tick fires immediately
        loop {
            tick.tick().await;
            monitor.collect();
            let metrics = monitor.metrics();
            node.set_net_kbps(metrics.net_mbps * 1000.0);
            debug!(
                "metrics: cpu {:.1}% ram {:.1}% net {:.1} Mbps disk {:.2}%",
                metrics.cpu, metrics.ram, metrics.net_mbps, metrics.disk
            );
        }
    });
}

/// Refresh the clock-drift estimate in the background; failures keep
/// the previous value.
fn spawn_drift_refresh(node: GossipNode) {
    tokio::spawn(async move {
        loop {
            match drift::clock_drift(drift::DEFAULT_NTP_SERVER).await {
                Ok(seconds) => {
                    node.set_clock_drift(seconds);
                    debug!("clock drift: {:+.3}s", seconds);
                }
                Err(e) => debug!("clock drift query failed: {}", e),
            }
            tokio::time::sleep(DRIFT_INTERVAL).await;
        }
    });
}

fn print_banner() {
    println!();
    println!("  CoreLink v{}", VERSION);
    println!("  GPU Cluster Communication Framework");
    println!("  ========================================");
    println!();
}
