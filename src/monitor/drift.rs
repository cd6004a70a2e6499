// Clock-Drift Probe for CoreLink
//
// Single-shot SNTP query measuring how far the local clock sits from
// an NTP server. The whole exchange is capped at 2 seconds; errors
// propagate so the caller can skip the sample and keep the previous
// value.

use crate::error::{LinkError, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org:123";

/// Cap on the whole query, resolution included.
pub const DRIFT_TIMEOUT: Duration = Duration::from_secs(2);

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;

/// Offset of the server clock relative to the local clock, in
/// seconds. Positive means the local clock is behind.
pub async fn clock_drift(server: &str) -> Result<f64> {
    timeout(DRIFT_TIMEOUT, query(server))
        .await
        .map_err(|_| LinkError::Network(format!("NTP query to {} timed out", server)))?
}

async fn query(server: &str) -> Result<f64> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;

    // 48-byte SNTP request: LI=0, VN=3, Mode=3 (client).
    let mut request = [0u8; 48];
    request[0] = 0x1b;
    socket.send(&request).await?;

    let mut response = [0u8; 48];
    let len = socket.recv(&mut response).await?;
    if len < 48 {
        return Err(LinkError::Network(format!(
            "Short NTP response: {} bytes",
            len
        )));
    }

    let local = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    Ok(transmit_seconds(&response) - local)
}

/// Server transmit timestamp (bytes 40..48) as Unix seconds: a 32-bit
/// seconds count since 1900 plus a 32-bit binary fraction.
fn transmit_seconds(response: &[u8; 48]) -> f64 {
    let secs = be_u32(&response[40..44]) as f64;
    let frac = be_u32(&response[44..48]) as f64 / 4_294_967_296.0;
    secs + frac - NTP_UNIX_OFFSET
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_seconds() {
        let mut response = [0u8; 48];
        // 2_208_988_800 + 1000 seconds, fraction 0.5.
        response[40..44].copy_from_slice(&2_208_989_800u32.to_be_bytes());
        response[44..48].copy_from_slice(&0x8000_0000u32.to_be_bytes());

        let unix = transmit_seconds(&response);
        assert!((unix - 1000.5).abs() < 1e-6);
    }

    #[test]
    fn test_transmit_seconds_zero_packet() {
        let response = [0u8; 48];
        assert_eq!(transmit_seconds(&response), -NTP_UNIX_OFFSET);
    }

    #[test]
    fn test_be_u32() {
        assert_eq!(be_u32(&[0, 0, 0, 1]), 1);
        assert_eq!(be_u32(&[0xff, 0xff, 0xff, 0xff]), u32::MAX);
    }
}
