// GPU Discovery for CoreLink
//
// Queries nvidia-smi for the locally installed NVIDIA GPUs. The probe
// is best-effort: a missing binary, non-zero exit, parse failure, or
// timeout all yield an empty list, and the node simply announces no
// GPUs.

use crate::gossip::message::GpuInfo;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Enumerate local NVIDIA GPUs, including the current PCIe link
/// (generation and width) rendered into the `limit` field.
pub async fn detect_gpus() -> Vec<GpuInfo> {
    let probe = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,pcie.link.gen.current,pcie.link.width.current",
            "--format=csv,noheader,nounits",
        ])
        .output();

    let output = match tokio::time::timeout(GPU_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("nvidia-smi not available: {}", e);
            return Vec::new();
        }
        Err(_) => {
            debug!("nvidia-smi timed out");
            return Vec::new();
        }
    };

    if !output.status.success() {
        debug!("nvidia-smi exited with {}", output.status);
        return Vec::new();
    }

    parse_gpu_csv(&String::from_utf8_lossy(&output.stdout))
}

/// Parse nvidia-smi CSV lines of the form
/// `0, NVIDIA RTX A6000, 4, 16`.
fn parse_gpu_csv(text: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(", ").collect();
        if parts.len() < 2 {
            continue;
        }

        let id = match parts[0].trim().parse::<u32>() {
            Ok(id) => id,
            Err(_) => continue,
        };

        // The model name sits between the index and the two PCIe
        // columns; older driver output may omit the PCIe columns.
        let (model, limit) = if parts.len() >= 4 {
            let model = parts[1..parts.len() - 2].join(", ");
            let gen = parts[parts.len() - 2].trim();
            let width = parts[parts.len() - 1].trim();
            (model, pcie_limit(gen, width))
        } else {
            (parts[1..].join(", "), String::new())
        };

        gpus.push(GpuInfo { id, model, limit });
    }

    gpus
}

/// Render the PCIe link as e.g. "4.0 x 16"; unreadable link fields
/// (driver reports "[N/A]" in low-power states) leave it empty.
fn pcie_limit(gen: &str, width: &str) -> String {
    match (gen.parse::<u32>(), width.parse::<u32>()) {
        (Ok(gen), Ok(width)) => format!("{}.0 x {}", gen, width),
        _ => String::new(),
    }
}
