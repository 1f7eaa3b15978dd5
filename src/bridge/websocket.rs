//! WebSocket surface: one live bidirectional channel per connected node.

use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedSender};

use super::http::BridgeState;
use super::registry::{NodeInfo, NodeTransport};
use super::NodeEvent;
use crate::error::BridgeError;
use crate::now_ms_lossy;

const MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Register {
        node_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        firmware_version: Option<String>,
        #[serde(default)]
        battery_level: Option<f32>,
    },
    Data {
        payload: Value,
    },
    Heartbeat {
        #[serde(default)]
        battery_level: Option<f32>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Registered { node_id: &'a str, server_time: u64 },
    HeartbeatAck { server_time: u64 },
    Command { command: &'a str, params: &'a Value },
    Error { message: String },
}

struct Binding {
    conn_id: u64,
    tx: UnboundedSender<Message>,
}

/// node id -> live connection.
#[derive(Clone, Default)]
pub(crate) struct Connections {
    bindings: Arc<Mutex<HashMap<String, Binding>>>,
    next_id: Arc<AtomicU64>,
}

impl Connections {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn bind(&self, node_id: &str, conn_id: u64, tx: UnboundedSender<Message>) {
        let previous = self
            .lock()
            .insert(node_id.to_string(), Binding { conn_id, tx });
        if previous.is_some_and(|b| b.conn_id != conn_id) {
            log::info!("node '{}' reconnected; replacing its previous socket", node_id);
        }
    }

    /// Remove the binding if it still belongs to `conn_id`. Returns true when removed.
    fn unbind(&self, node_id: &str, conn_id: u64) -> bool {
        let mut bindings = self.lock();
        if bindings.get(node_id).is_some_and(|b| b.conn_id == conn_id) {
            bindings.remove(node_id);
            return true;
        }
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn send_command(
        &self,
        node_id: &str,
        command: &str,
        params: Value,
    ) -> Result<(), BridgeError> {
        let text = serde_json::to_string(&Outbound::Command {
            command,
            params: &params,
        })
        .map_err(|e| BridgeError::Internal(e.into()))?;
        let bindings = self.lock();
        let binding = bindings
            .get(node_id)
            .ok_or_else(|| BridgeError::NodeOffline(node_id.to_string()))?;
        binding
            .tx
            .send(Message::Text(text.into()))
            .map_err(|_| BridgeError::NodeOffline(node_id.to_string()))?;
        log::info!("command '{}' sent to node '{}'", command, node_id);
        Ok(())
    }
}

fn to_message(outbound: &Outbound<'_>) -> Option<Message> {
    match serde_json::to_string(outbound) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            log::error!("failed to serialize websocket reply: {}", err);
            None
        }
    }
}

fn error_reply(message: impl Into<String>) -> Option<Message> {
    to_message(&Outbound::Error {
        message: message.into(),
    })
}

/// Apply one inbound text frame. Returns the reply to send, if any.
fn handle_text(
    text: &str,
    conn_id: u64,
    tx: &UnboundedSender<Message>,
    bound: &mut Option<String>,
    state: &BridgeState,
) -> Option<Message> {
    if text.len() > MAX_MESSAGE_BYTES {
        return error_reply(format!("message exceeds {} bytes", MAX_MESSAGE_BYTES));
    }
    let inbound: Inbound = match serde_json::from_str(text) {
        Ok(inbound) => inbound,
        Err(err) => return error_reply(format!("invalid message: {}", err)),
    };

    match inbound {
        Inbound::Register {
            node_id,
            name,
            firmware_version,
            battery_level,
        } => {
            let node_id = node_id.trim().to_string();
            if node_id.is_empty() {
                return error_reply("node_id is required");
            }
            if let Some(previous) = bound.take().filter(|prev| *prev != node_id) {
                state.connections.unbind(&previous, conn_id);
            }
            state.connections.bind(&node_id, conn_id, tx.clone());
            let info = NodeInfo {
                name,
                firmware_version,
                battery_level,
                ..NodeInfo::default()
            };
            let node = state
                .registry
                .register(&node_id, info, NodeTransport::WebSocket);
            if let Err(err) = state.events.emit(NodeEvent::Registered(node)) {
                log::debug!("registration event for '{}' not forwarded: {}", node_id, err);
            }
            let reply = to_message(&Outbound::Registered {
                node_id: &node_id,
                server_time: now_ms_lossy(),
            });
            *bound = Some(node_id);
            reply
        }
        Inbound::Data { payload } => {
            let Some(node_id) = bound.as_deref() else {
                return error_reply("register before sending data");
            };
            state.registry.touch(node_id, NodeTransport::WebSocket);
            let event = NodeEvent::Data {
                node_id: node_id.to_string(),
                transport: NodeTransport::WebSocket,
                payload,
            };
            match state.events.emit(event) {
                Ok(()) => None,
                Err(err) => error_reply(err.to_string()),
            }
        }
        Inbound::Heartbeat { battery_level } => {
            if let Some(node_id) = bound.as_deref() {
                let info = NodeInfo {
                    battery_level,
                    ..NodeInfo::default()
                };
                state.registry.register(node_id, info, NodeTransport::WebSocket);
            }
            to_message(&Outbound::HeartbeatAck {
                server_time: now_ms_lossy(),
            })
        }
    }
}

pub(crate) async fn handle_socket(mut socket: WebSocket, state: BridgeState) {
    let conn_id = state.connections.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut shutdown = state.shutdown.clone();
    let mut bound: Option<String> = None;
    log::debug!("websocket connection {} opened", conn_id);

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let reply = match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(text.as_str(), conn_id, &tx, &mut bound, &state)
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(err)) => {
                        log::warn!("websocket connection {} error: {}", conn_id, err);
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if socket.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Some(node_id) = bound {
        if state.connections.unbind(&node_id, conn_id) {
            state.registry.mark_offline(&node_id);
        }
    }
    log::debug!("websocket connection {} closed", conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{EventSink, MemoryConfigStore, NodeRegistry};
    use std::sync::mpsc::Receiver;

    fn state() -> (BridgeState, Receiver<NodeEvent>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(16);
        let (_shutdown_tx, shutdown) = tokio::sync::watch::channel(false);
        let state = BridgeState {
            registry: NodeRegistry::new(),
            connections: Connections::default(),
            config_store: Arc::new(MemoryConfigStore::default()),
            events: EventSink {
                tx,
                dropped: Default::default(),
            },
            max_image_bytes: 1024,
            shutdown,
        };
        (state, rx)
    }

    fn reply_json(message: Option<Message>) -> Value {
        match message {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text reply, got {:?}", other),
        }
    }

    #[test]
    fn register_binds_and_commands_flow() {
        let (state, _events) = state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bound = None;

        let reply = handle_text(
            r#"{"type":"register","node_id":"ws-1","firmware_version":"2.1"}"#,
            7,
            &tx,
            &mut bound,
            &state,
        );
        assert_eq!(reply_json(reply)["type"], "registered");
        assert_eq!(bound.as_deref(), Some("ws-1"));

        state
            .connections
            .send_command("ws-1", "capture", serde_json::json!({"burst": 3}))
            .unwrap();
        let pushed = reply_json(rx.try_recv().ok());
        assert_eq!(pushed["type"], "command");
        assert_eq!(pushed["command"], "capture");
        assert_eq!(pushed["params"]["burst"], 3);
    }

    #[test]
    fn data_before_register_is_rejected() {
        let (state, events) = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bound = None;
        let reply = handle_text(
            r#"{"type":"data","payload":{"x":1}}"#,
            1,
            &tx,
            &mut bound,
            &state,
        );
        assert_eq!(reply_json(reply)["type"], "error");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn heartbeat_is_acknowledged() {
        let (state, _events) = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bound = Some("ws-2".to_string());
        state.registry.touch("ws-2", NodeTransport::WebSocket);
        let reply = handle_text(
            r#"{"type":"heartbeat","battery_level":42.5}"#,
            1,
            &tx,
            &mut bound,
            &state,
        );
        assert_eq!(reply_json(reply)["type"], "heartbeat_ack");
        assert_eq!(state.registry.get("ws-2").unwrap().battery_level, Some(42.5));
    }

    #[test]
    fn stale_connection_does_not_unbind_newer_one() {
        let connections = Connections::default();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        connections.bind("n", 1, old_tx);
        connections.bind("n", 2, new_tx);
        assert!(!connections.unbind("n", 1));
        assert_eq!(connections.len(), 1);
        assert!(connections.unbind("n", 2));
        assert!(matches!(
            connections.send_command("n", "reboot", Value::Null),
            Err(BridgeError::NodeOffline(_))
        ));
    }
}
