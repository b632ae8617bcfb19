//! Observer endpoint
//!
//! Every accepted TCP connection becomes a hub client and receives one JSON
//! object per line. A `keepalive` frame is written on a fixed interval so
//! dead peers surface as write errors. Anything the peer sends is ignored;
//! EOF or an I/O error unregisters the client.

use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::Result;
use crate::hub::HubHandle;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

fn keepalive_frame() -> String {
    json!({ "type": "keepalive", "timestamp": chrono::Utc::now() }).to_string()
}

/// Accepts observers until `cancel` fires.
pub async fn serve(listener: TcpListener, hub: HubHandle, keepalive: Duration, cancel: CancellationToken) -> Result<()> {
    info!("Observer endpoint listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, hub.clone(), keepalive, cancel.child_token()));
                }
                Err(e) => warn!("Observer accept failed: {e}"),
            },
        }
    }

    info!("Observer endpoint stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: HubHandle,
    keepalive: Duration,
    cancel: CancellationToken,
) {
    let mut client = hub.register();
    let id = client.id();
    info!("Observer {peer} connected as {id}");

    let (mut reader, mut writer) = stream.into_split();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    let mut scratch = [0u8; 512];

    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            message = client.recv() => match message {
                Some(line) => line.to_string(),
                // Hub shut down
                None => break,
            },
            _ = ticker.tick() => keepalive_frame(),
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        };

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await
        };
        if let Err(e) = write.await {
            debug!("Observer {peer} write failed: {e}");
            break;
        }
    }

    hub.unregister(id);
    info!("Observer {peer} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, Payload};
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn read_json(lines: &mut tokio::io::Lines<BufReader<TcpStream>>) -> serde_json::Value {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_observer_gets_keepalive_and_events() {
        let (hub, hub_task) = Hub::spawn(16, 16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, hub.clone(), Duration::from_millis(50), cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();

        // The first keepalive proves the connection is registered
        let frame = read_json(&mut lines).await;
        assert_eq!(frame["type"], "keepalive");
        assert!(frame["timestamp"].is_string());

        hub.emit(Payload::Error {
            source: "test".to_string(),
            message: "boom".to_string(),
        });
        let event = loop {
            let value = read_json(&mut lines).await;
            if value["type"] != "keepalive" {
                break value;
            }
        };
        assert_eq!(event["type"], "error");
        assert_eq!(event["message"], "boom");

        cancel.cancel();
        server.await.unwrap().unwrap();
        hub.shutdown();
        hub_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hub_shutdown_ends_connection() {
        let (hub, hub_task) = Hub::spawn(16, 16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, hub.clone(), Duration::from_millis(50), cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(read_json(&mut lines).await["type"], "keepalive");

        hub.shutdown();
        hub_task.await.unwrap();

        // Server side closes the socket once its queue is closed
        let end = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match lines.next_line().await {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        })
        .await;
        assert!(end.is_ok());

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
