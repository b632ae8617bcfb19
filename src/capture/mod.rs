//! Traffic capture
//!
//! A [`TrafficMonitor`] reads packets the kernel copied to a logging channel
//! and hands each one, decoded into a [`TrafficEvent`], to a single callback.
//! The callback runs in-line on the capture task and must stay cheap.
//!
//! - [`nflog`]: Linux NFLOG netlink channel
//! - [`synthetic`]: generated traffic for hosts without NFLOG and for tests

#[cfg(target_os = "linux")]
pub mod nflog;
pub mod packet;
pub mod synthetic;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::error::{Error, Result};
use crate::core::rule::Action;

/// One observed packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEvent {
    /// When the kernel saw the packet; the hub adds its own publish time
    #[serde(rename = "captured_at")]
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub length: usize,
    pub action: Action,
    pub prefix: String,
    pub interface: String,
}

impl TrafficEvent {
    /// Builds an event from a raw packet and the log prefix that came with it.
    pub fn from_packet(payload: &[u8], prefix: &str, interface: String, timestamp: DateTime<Utc>) -> Self {
        let headers = packet::decode(payload);
        Self {
            timestamp,
            src_ip: headers.src_ip,
            dst_ip: headers.dst_ip,
            src_port: headers.src_port,
            dst_port: headers.dst_port,
            protocol: headers.protocol.to_string(),
            length: payload.len(),
            action: packet::parse_verdict(prefix),
            prefix: prefix.to_string(),
            interface,
        }
    }
}

pub type TrafficCallback = Arc<dyn Fn(TrafficEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Source of decoded traffic events
#[async_trait]
pub trait TrafficMonitor: Send + Sync {
    /// Opens the channel and delivers events until `cancel` fires.
    ///
    /// Failing to open the channel is returned. Later read errors go to the
    /// error callback and capture continues. Cancellation returns `Ok`.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Replaces the traffic callback; takes effect for the next packet.
    fn set_callback(&self, callback: TrafficCallback);

    fn set_error_callback(&self, callback: ErrorCallback);
}

/// Callback slots shared between a monitor and its capture task
#[derive(Clone, Default)]
pub struct Callbacks {
    traffic: Arc<RwLock<Option<TrafficCallback>>>,
    error: Arc<RwLock<Option<ErrorCallback>>>,
}

impl Callbacks {
    pub fn set_traffic(&self, callback: TrafficCallback) {
        *self.traffic.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn set_error(&self, callback: ErrorCallback) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Passes an event to the current callback. Events before one is set are dropped.
    pub fn deliver(&self, event: TrafficEvent) {
        // Clone the Arc so a concurrent set_callback never waits on a running callback
        let callback = self.traffic.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub fn report(&self, err: &Error) {
        let callback = self.error.read().unwrap_or_else(PoisonError::into_inner).clone();
        match callback {
            Some(callback) => callback(err),
            None => warn!("Capture error: {err}"),
        }
    }
}

/// Which traffic source the daemon runs
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Nflog,
    Synthetic,
    Off,
}

/// Builds the monitor for `mode`, or `None` when capture is off.
///
/// NFLOG is only available on Linux; elsewhere the synthetic generator
/// stands in.
pub fn create_monitor(mode: CaptureMode, group: u16, interval: Duration) -> Option<Arc<dyn TrafficMonitor>> {
    match mode {
        CaptureMode::Off => None,
        CaptureMode::Synthetic => Some(Arc::new(synthetic::SyntheticMonitor::new(interval))),
        #[cfg(target_os = "linux")]
        CaptureMode::Nflog => Some(Arc::new(nflog::NflogMonitor::new(group))),
        #[cfg(not(target_os = "linux"))]
        CaptureMode::Nflog => {
            warn!("NFLOG capture (group {group}) needs Linux; using synthetic traffic");
            Some(Arc::new(synthetic::SyntheticMonitor::new(interval)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> TrafficEvent {
        let mut packet = vec![0x45, 0, 0, 24, 0, 0, 0, 0, 64, 6, 0, 0];
        packet.extend_from_slice(&[203, 0, 113, 1, 198, 51, 100, 2]);
        packet.extend_from_slice(&[0xc3, 0x50, 0x00, 0x16]);
        TrafficEvent::from_packet(&packet, "HOSTWALL-IN:DROP:", "eth0".to_string(), Utc::now())
    }

    #[test]
    fn test_event_from_packet() {
        let event = sample();
        assert_eq!(event.protocol, "TCP");
        assert_eq!(event.action, Action::Drop);
        assert_eq!(event.src_port, 50000);
        assert_eq!(event.dst_port, 22);
        assert_eq!(event.length, 24);
        assert_eq!(event.interface, "eth0");
    }

    #[test]
    fn test_event_serializes_capture_time() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("captured_at").is_some());
        assert!(json.get("timestamp").is_none());
        assert_eq!(json["action"], "DROP");
        assert_eq!(json["dst_ip"], "198.51.100.2");
    }

    #[test]
    fn test_last_callback_wins() {
        let callbacks = Callbacks::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        // Nothing registered yet: dropped silently
        callbacks.deliver(sample());

        let counter = first.clone();
        callbacks.set_traffic(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        callbacks.deliver(sample());

        let counter = second.clone();
        callbacks.set_traffic(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        callbacks.deliver(sample());
        callbacks.deliver(sample());

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_callback_receives_errors() {
        let callbacks = Callbacks::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        callbacks.set_error(Arc::new(move |e| {
            assert!(e.to_string().contains("recv"));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        callbacks.report(&Error::Capture("recv failed".to_string()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capture_off() {
        assert!(create_monitor(CaptureMode::Off, 100, Duration::from_millis(10)).is_none());
        assert!(create_monitor(CaptureMode::Synthetic, 100, Duration::from_millis(10)).is_some());
    }
}
