//! Event hub
//!
//! A single actor task owns the registry of connected observers. Everything
//! else talks to it through a [`HubHandle`]:
//!
//! - register / unregister go over an unbounded command channel
//! - events go over a bounded broadcast channel, enqueued without waiting
//!
//! Each event is serialized once and offered to every client queue with
//! `try_send`; a full queue loses that event instead of stalling the actor.
//! When the actor stops every client queue is closed, so writers draining a
//! [`Client`] see the end of the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::TrafficEvent;
use crate::core::rule::{ImmutablePort, Rule};

/// Default capacity of the broadcast channel
pub const BROADCAST_CAPACITY: usize = 1024;

/// Default capacity of each client's outbound queue
pub const CLIENT_BUFFER: usize = 256;

pub type ClientId = Uuid;

/// What happened to the rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleChange {
    Added,
    Deleted,
    Applied,
    Flushed,
    ImmutablePortAdded,
    ImmutablePortRemoved,
}

/// Event body, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    RuleChange {
        change: RuleChange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        rules: Vec<Rule>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<ImmutablePort>,
    },
    Traffic(TrafficEvent),
    Error {
        source: String,
        message: String,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::RuleChange { .. } => "rule_change",
            Payload::Traffic(_) => "traffic",
            Payload::Error { .. } => "error",
        }
    }
}

/// A published event: payload plus the time the hub accepted it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// One connected observer's end of its queue
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    rx: mpsc::Receiver<Arc<str>>,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next serialized event; `None` once the hub closed this queue.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

enum Command {
    Register { id: ClientId, tx: mpsc::Sender<Arc<str>> },
    Unregister(ClientId),
}

/// Cloneable entry point to the hub actor
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
    client_buffer: usize,
}

impl HubHandle {
    /// Registers a new observer with an outbound queue of the configured size.
    pub fn register(&self) -> Client {
        let (tx, rx) = mpsc::channel(self.client_buffer);
        let id = Uuid::new_v4();
        if self.commands.send(Command::Register { id, tx }).is_err() {
            // Actor gone: tx was dropped with the command, so rx is already closed
            debug!("Hub stopped; client {id} starts closed");
        }
        Client { id, rx }
    }

    /// Removes an observer and closes its queue. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        let _ = self.commands.send(Command::Unregister(id));
    }

    /// Stamps `payload` with the current time and queues it for broadcast.
    ///
    /// Never waits: when the broadcast channel is full the event is dropped.
    pub fn emit(&self, payload: Payload) {
        let kind = payload.kind();
        let event = Event {
            timestamp: Utc::now(),
            payload,
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("Hub backlog full, dropping {kind} event"),
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("Hub stopped, dropping {kind} event"),
        }
    }

    pub fn emit_traffic(&self, event: TrafficEvent) {
        self.emit(Payload::Traffic(event));
    }

    pub fn emit_rule_change(&self, change: RuleChange, rule_id: Option<String>, rules: Vec<Rule>) {
        self.emit(Payload::RuleChange {
            change,
            rule_id,
            rules,
            port: None,
        });
    }

    pub fn emit_port_change(&self, change: RuleChange, port: ImmutablePort) {
        self.emit(Payload::RuleChange {
            change,
            rule_id: None,
            rules: Vec::new(),
            port: Some(port),
        });
    }

    pub fn emit_error(&self, source: &str, message: impl Into<String>) {
        self.emit(Payload::Error {
            source: source.to_string(),
            message: message.into(),
        });
    }

    /// Stops the actor. Remaining clients see their queues close.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The actor. Create with [`Hub::new`], then drive [`Hub::run`] on a task.
pub struct Hub {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Receiver<Event>,
    clients: HashMap<ClientId, mpsc::Sender<Arc<str>>>,
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(broadcast_capacity: usize, client_buffer: usize) -> (Hub, HubHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(broadcast_capacity.max(1));
        let cancel = CancellationToken::new();

        let hub = Hub {
            commands,
            events,
            clients: HashMap::new(),
            cancel: cancel.clone(),
        };
        let handle = HubHandle {
            commands: commands_tx,
            events: events_tx,
            cancel,
            client_buffer: client_buffer.max(1),
        };
        (hub, handle)
    }

    /// Spawns the actor on the current runtime.
    pub fn spawn(broadcast_capacity: usize, client_buffer: usize) -> (HubHandle, tokio::task::JoinHandle<()>) {
        let (hub, handle) = Hub::new(broadcast_capacity, client_buffer);
        (handle, tokio::spawn(hub.run()))
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { id, tx } => {
                self.clients.insert(id, tx);
                debug!("Observer {id} registered ({} connected)", self.clients.len());
            }
            Command::Unregister(id) => {
                // Dropping the sender closes the queue; a second unregister finds nothing
                if self.clients.remove(&id).is_some() {
                    debug!("Observer {id} unregistered ({} connected)", self.clients.len());
                }
            }
        }
    }

    fn broadcast(&mut self, event: &Event) {
        let line: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("Failed to serialize {} event: {e}", event.payload.kind());
                return;
            }
        };

        self.clients.retain(|id, tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Observer {id} is slow, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Observer {id} went away");
                false
            }
        });
    }

    pub async fn run(mut self) {
        info!("Event hub started");

        loop {
            // Commands first so a register queued before an emit sees that event
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.events.recv() => self.broadcast(&event),
                else => break,
            }
        }

        let remaining = self.clients.len();
        self.clients.clear();
        info!("Event hub stopped, closed {remaining} observer queues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(client: &mut Client) -> Option<serde_json::Value> {
        let line = tokio::time::timeout(Duration::from_secs(1), client.recv()).await.ok()??;
        serde_json::from_str(&line).ok()
    }

    fn error(message: &str) -> Payload {
        Payload::Error {
            source: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_three_clients_in_order() {
        let (handle, task) = Hub::spawn(16, 16);
        let mut clients: Vec<Client> = (0..3).map(|_| handle.register()).collect();

        handle.emit(error("first"));
        handle.emit(error("second"));

        for client in &mut clients {
            let first = next(client).await.unwrap();
            assert_eq!(first["type"], "error");
            assert_eq!(first["message"], "first");
            assert!(first["timestamp"].is_string());
            assert_eq!(next(client).await.unwrap()["message"], "second");
        }

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_double_unregister_is_noop() {
        let (handle, task) = Hub::spawn(16, 16);
        let mut gone = handle.register();
        let mut stays = handle.register();

        handle.unregister(gone.id());
        handle.unregister(gone.id());
        assert!(gone.recv().await.is_none());

        handle.emit(error("still here"));
        assert_eq!(next(&mut stays).await.unwrap()["message"], "still here");

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_drops_instead_of_blocking() {
        let (handle, task) = Hub::spawn(64, 2);
        let mut slow = handle.register();
        let mut fast = handle.register();

        for i in 0..5 {
            handle.emit(error(&i.to_string()));
            // Drain the fast client so only the slow one backs up
            assert_eq!(next(&mut fast).await.unwrap()["message"], i.to_string());
        }

        assert_eq!(next(&mut slow).await.unwrap()["message"], "0");
        assert_eq!(next(&mut slow).await.unwrap()["message"], "1");
        assert!(slow.try_recv().is_none());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_queues() {
        let (handle, task) = Hub::spawn(16, 16);
        let mut a = handle.register();
        let mut b = handle.register();
        handle.emit(error("last"));
        assert!(next(&mut a).await.is_some());

        handle.shutdown();
        task.await.unwrap();

        assert!(a.recv().await.is_none());
        // b still drains what was queued before shutdown, then sees the close
        assert_eq!(next(&mut b).await.unwrap()["message"], "last");
        assert!(b.recv().await.is_none());

        // Emitting after shutdown is harmless
        handle.emit(error("late"));
        let mut late = handle.register();
        assert!(late.recv().await.is_none());
    }

    #[test]
    fn test_event_wire_shapes() {
        let event = Event {
            timestamp: Utc::now(),
            payload: Payload::RuleChange {
                change: RuleChange::ImmutablePortAdded,
                rule_id: None,
                rules: Vec::new(),
                port: Some(ImmutablePort::new(8443, crate::core::rule::Protocol::Tcp)),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rule_change");
        assert_eq!(json["change"], "immutable_port_added");
        assert_eq!(json["port"]["port"], 8443);
        assert!(json.get("rule_id").is_none());
        assert!(json.get("rules").is_none());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
