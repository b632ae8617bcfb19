//! Capture → hub bridge
//!
//! Runs a [`TrafficMonitor`] and republishes its events on the hub, minus
//! internal traffic and anything above [`RATE_LIMIT`] events per second.
//! The filter runs in-line on the capture task, so both checks are O(1).

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{TrafficEvent, TrafficMonitor};
use crate::core::error::Result;
use crate::hub::HubHandle;

/// Events forwarded per one-second window
pub const RATE_LIMIT: u32 = 20;

const WINDOW: Duration = Duration::from_secs(1);

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_unicast_link_local(),
    }
}

fn is_broadcast(ip: IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.is_broadcast())
}

/// Traffic that never leaves the host or its link, and is not worth showing.
pub fn is_internal(src: IpAddr, dst: IpAddr) -> bool {
    src.is_loopback()
        || dst.is_loopback()
        || src == dst
        || is_link_local(src)
        || is_link_local(dst)
        || dst.is_multicast()
        || is_broadcast(dst)
        || dst.is_unspecified()
}

/// Fixed-window counter
#[derive(Debug)]
pub struct RateLimiter {
    count: AtomicU32,
    limit: u32,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    /// Counts one event and says whether it fits in the current window.
    pub fn allow(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed).saturating_add(1) <= self.limit
    }

    /// Starts a new window, returning how many events the last one saw.
    pub fn reset(&self) -> u32 {
        self.count.swap(0, Ordering::Relaxed)
    }
}

pub struct Bridge {
    monitor: Arc<dyn TrafficMonitor>,
    hub: HubHandle,
    limiter: Arc<RateLimiter>,
}

impl Bridge {
    pub fn new(monitor: Arc<dyn TrafficMonitor>, hub: HubHandle) -> Self {
        Self {
            monitor,
            hub,
            limiter: Arc::new(RateLimiter::new(RATE_LIMIT)),
        }
    }

    /// Filters and publishes one event. Returns whether it reached the hub.
    pub fn forward(&self, event: TrafficEvent) -> bool {
        forward(&self.limiter, &self.hub, event)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs capture until `cancel` fires.
    ///
    /// An error opening the capture channel is returned as is; cancellation
    /// is a normal return.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let limiter = self.limiter.clone();
        let hub = self.hub.clone();
        self.monitor.set_callback(Arc::new(move |event| {
            forward(&limiter, &hub, event);
        }));

        let hub = self.hub.clone();
        self.monitor.set_error_callback(Arc::new(move |err| {
            warn!("Capture error: {err}");
            hub.emit_error("capture", err.to_string());
        }));

        let ticker = tokio::spawn(reset_windows(self.limiter.clone(), cancel.child_token()));

        info!("Traffic bridge running ({RATE_LIMIT} events/s)");
        let result = self.monitor.run(cancel.clone()).await;

        ticker.abort();
        info!("Traffic bridge stopped");
        result
    }
}

fn forward(limiter: &RateLimiter, hub: &HubHandle, event: TrafficEvent) -> bool {
    if is_internal(event.src_ip, event.dst_ip) {
        return false;
    }
    if !limiter.allow() {
        return false;
    }
    hub.emit_traffic(event);
    true
}

async fn reset_windows(limiter: Arc<RateLimiter>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(WINDOW);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let seen = limiter.reset();
                if seen > limiter.limit {
                    debug!("Rate limit dropped {} events", seen - limiter.limit);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::generate_packet;
    use crate::hub::Hub;
    use chrono::Utc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn external_event() -> TrafficEvent {
        let (packet, prefix) = generate_packet();
        TrafficEvent::from_packet(&packet, prefix, "eth0".to_string(), Utc::now())
    }

    #[test]
    fn test_is_internal() {
        assert!(is_internal(ip("127.0.0.1"), ip("10.0.0.5")));
        assert!(is_internal(ip("10.0.0.5"), ip("10.0.0.5")));
        assert!(!is_internal(ip("203.0.113.1"), ip("198.51.100.2")));

        assert!(is_internal(ip("10.0.0.5"), ip("::1")));
        assert!(is_internal(ip("169.254.1.1"), ip("10.0.0.5")));
        assert!(is_internal(ip("fe80::1"), ip("2001:db8::1")));
        assert!(is_internal(ip("10.0.0.5"), ip("224.0.0.251")));
        assert!(is_internal(ip("10.0.0.5"), ip("255.255.255.255")));
        assert!(is_internal(ip("10.0.0.5"), ip("0.0.0.0")));
        assert!(is_internal(ip("2001:db8::1"), ip("ff02::1")));
        // Multicast source is not filtered, only destination
        assert!(!is_internal(ip("224.0.0.1"), ip("10.0.0.5")));
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.reset(), 4);
        assert!(limiter.allow());
    }

    #[tokio::test]
    async fn test_twenty_five_events_forward_twenty() {
        let (hub, task) = Hub::spawn(64, 64);
        let mut client = hub.register();
        let bridge = Bridge::new(
            Arc::new(crate::capture::synthetic::SyntheticMonitor::new(Duration::from_secs(60))),
            hub.clone(),
        );

        let forwarded = (0..25).filter(|_| bridge.forward(external_event())).count();
        assert_eq!(forwarded, 20);

        bridge.limiter().reset();
        assert!(bridge.forward(external_event()));

        hub.shutdown();
        task.await.unwrap();
        let mut received = 0;
        while client.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 21);
    }

    #[tokio::test]
    async fn test_internal_events_do_not_count() {
        let (hub, task) = Hub::spawn(64, 64);
        let bridge = Bridge::new(
            Arc::new(crate::capture::synthetic::SyntheticMonitor::new(Duration::from_secs(60))),
            hub.clone(),
        );

        let mut local = external_event();
        local.dst_ip = ip("127.0.0.1");
        for _ in 0..30 {
            assert!(!bridge.forward(local.clone()));
        }
        assert!(bridge.forward(external_event()));

        hub.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_on_cancel() {
        let (hub, task) = Hub::spawn(64, 64);
        let mut client = hub.register();
        let bridge = Bridge::new(
            Arc::new(crate::capture::synthetic::SyntheticMonitor::new(Duration::from_millis(5))),
            hub.clone(),
        );

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });
        assert!(bridge.run(cancel).await.is_ok());

        let line = client.recv().await.unwrap();
        assert!(line.contains("\"type\":\"traffic\""));

        hub.shutdown();
        task.await.unwrap();
    }
}
