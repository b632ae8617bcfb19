//! Synthetic traffic source
//!
//! Emits one generated packet per interval through the same decode path as
//! NFLOG, so the bridge and hub see identical events on hosts without a
//! kernel logging channel.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Callbacks, ErrorCallback, TrafficCallback, TrafficEvent, TrafficMonitor};
use crate::core::error::Result;

const PREFIXES: [&str; 4] = [
    "HOSTWALL-IN:ACCEPT:",
    "HOSTWALL-IN:DROP:",
    "HOSTWALL-IN:REJECT:",
    "HOSTWALL-OUT:ACCEPT:",
];

const SERVICE_PORTS: [u16; 6] = [22, 53, 80, 443, 3306, 8080];

/// Protocol numbers the generator picks from: ICMP, TCP, UDP
const PROTOCOLS: [u8; 3] = [1, 6, 17];

pub const INTERFACE: &str = "synth0";

pub struct SyntheticMonitor {
    interval: Duration,
    callbacks: Callbacks,
}

impl SyntheticMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            callbacks: Callbacks::default(),
        }
    }
}

/// Builds a random IPv4 packet between documentation networks.
///
/// Addresses are never loopback, link-local or multicast, so generated
/// traffic always passes the bridge's internal-traffic filter.
pub fn generate_packet() -> (Vec<u8>, &'static str) {
    let mut rng = rand::rng();
    let protocol = *PROTOCOLS.choose(&mut rng).unwrap_or(&6);
    let prefix = *PREFIXES.choose(&mut rng).unwrap_or(&PREFIXES[0]);

    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&[203, 0, 113, rng.random_range(1..=254)]);
    packet[16..20].copy_from_slice(&[198, 51, 100, rng.random_range(1..=254)]);

    if protocol != 1 {
        let src_port: u16 = rng.random_range(1024..=65535);
        let dst_port = *SERVICE_PORTS.choose(&mut rng).unwrap_or(&443);
        packet.extend_from_slice(&src_port.to_be_bytes());
        packet.extend_from_slice(&dst_port.to_be_bytes());
    }

    let total = packet.len() as u16;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    (packet, prefix)
}

#[async_trait]
impl TrafficMonitor for SyntheticMonitor {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Synthetic traffic every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Synthetic capture stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let (packet, prefix) = generate_packet();
                    let event = TrafficEvent::from_packet(&packet, prefix, INTERFACE.to_string(), Utc::now());
                    self.callbacks.deliver(event);
                }
            }
        }
    }

    fn set_callback(&self, callback: TrafficCallback) {
        self.callbacks.set_traffic(callback);
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.set_error(callback);
    }
}
