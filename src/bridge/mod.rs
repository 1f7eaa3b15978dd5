//! Field-node protocol bridge.
//!
//! Three independent transports share one [`NodeRegistry`]:
//! - HTTP (`/node/...`) and WebSocket (`/ws`), served by axum on a current-thread
//!   tokio runtime in a dedicated thread
//! - a LoRa-style serial link read by a background thread
//!
//! Inbound payloads leave the bridge as [`NodeEvent`]s on a bounded channel. The bridge
//! never talks to the cloud itself.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::BridgeError;
use crate::join_with_timeout;

mod http;
pub mod radio;
mod registry;
mod websocket;

pub use radio::{encode_packet, RadioPacket, RadioPacketKind, RadioStats};
pub use registry::{Esp32Node, NodeInfo, NodeRegistry, NodeStatus, NodeTransport};

use radio::RadioCounters;
use websocket::Connections;

pub const DEFAULT_NODE_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 256;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

/// Inbound traffic from field nodes, forwarded to the orchestrator.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    Registered(Esp32Node),
    Data {
        node_id: String,
        transport: NodeTransport,
        payload: Value,
    },
    Image {
        node_id: String,
        image: Vec<u8>,
        content_type: Option<String>,
        metadata: Value,
    },
    Alert {
        node_id: String,
        payload: Value,
    },
}

/// Non-blocking sender of node events shared by every transport.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: SyncSender<NodeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub(crate) fn emit(&self, event: NodeEvent) -> Result<(), BridgeError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::Busy)
            }
            Err(TrySendError::Disconnected(_)) => Err(BridgeError::ChannelClosed),
        }
    }
}

/// Externally owned per-node configuration.
pub trait NodeConfigStore: Send + Sync {
    fn get(&self, node_id: &str) -> Result<Option<Value>>;
    fn set(&self, node_id: &str, config: Value) -> Result<()>;
}

/// Process-local config store, used when nothing else is wired in.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: Mutex<HashMap<String, Value>>,
}

impl NodeConfigStore for MemoryConfigStore {
    fn get(&self, node_id: &str) -> Result<Option<Value>> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| anyhow!("config store lock poisoned"))?;
        Ok(configs.get(node_id).cloned())
    }

    fn set(&self, node_id: &str, config: Value) -> Result<()> {
        let mut configs = self
            .configs
            .lock()
            .map_err(|_| anyhow!("config store lock poisoned"))?;
        configs.insert(node_id.to_string(), config);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BridgeSettings {
    /// HTTP/WebSocket listen address. `None` disables the network surfaces.
    pub http_addr: Option<String>,
    /// Serial device for the radio link. `None` disables the radio unless a link is
    /// injected with [`ProtocolBridge::with_radio_link`].
    pub radio_device: Option<PathBuf>,
    pub event_queue_size: usize,
    pub max_image_bytes: usize,
    pub stop_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            http_addr: Some(DEFAULT_NODE_ADDR.to_string()),
            radio_device: None,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            stop_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BridgeStats {
    pub nodes_total: usize,
    pub nodes_online: usize,
    pub websocket_connections: usize,
    pub events_dropped: u64,
    pub http_addr: Option<SocketAddr>,
    pub radio: RadioStats,
}

struct ServerHandle {
    addr: SocketAddr,
    shutdown: tokio::sync::watch::Sender<bool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct RadioHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct ProtocolBridge {
    settings: BridgeSettings,
    registry: NodeRegistry,
    connections: Connections,
    config_store: Arc<dyn NodeConfigStore>,
    events: EventSink,
    radio_counters: Arc<RadioCounters>,
    radio_link: Mutex<Option<Box<dyn Read + Send>>>,
    /// Shutdown signal for routers handed out by [`ProtocolBridge::router`].
    embedded_shutdown: tokio::sync::watch::Sender<bool>,
    server: Mutex<Option<ServerHandle>>,
    radio: Mutex<Option<RadioHandle>>,
}

impl ProtocolBridge {
    /// Create a bridge and the receiving end of its node event channel.
    pub fn new(
        settings: BridgeSettings,
        config_store: Arc<dyn NodeConfigStore>,
    ) -> (Self, Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::sync_channel(settings.event_queue_size.max(1));
        let bridge = Self {
            settings,
            registry: NodeRegistry::new(),
            connections: Connections::default(),
            config_store,
            events: EventSink {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            radio_counters: Arc::new(RadioCounters::default()),
            radio_link: Mutex::new(None),
            embedded_shutdown: tokio::sync::watch::channel(false).0,
            server: Mutex::new(None),
            radio: Mutex::new(None),
        };
        (bridge, rx)
    }

    /// Use an already-open byte stream as the radio link for the next `start()`.
    pub fn with_radio_link(mut self, link: Box<dyn Read + Send>) -> Self {
        *self
            .radio_link
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(link);
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Router over this bridge's state, for embedding or in-process tests.
    pub fn router(&self) -> axum::Router {
        http::router(self.http_state(self.embedded_shutdown.subscribe()))
    }

    fn http_state(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> http::BridgeState {
        http::BridgeState {
            registry: self.registry.clone(),
            connections: self.connections.clone(),
            config_store: self.config_store.clone(),
            events: self.events.clone(),
            max_image_bytes: self.settings.max_image_bytes,
            shutdown,
        }
    }

    /// Bound HTTP address, once started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.server.lock().ok()?.as_ref().map(|s| s.addr)
    }

    pub fn start(&self) -> Result<()> {
        self.start_server()?;
        self.start_radio()?;
        Ok(())
    }

    fn start_server(&self) -> Result<()> {
        let Some(addr) = self.settings.http_addr.as_deref() else {
            return Ok(());
        };
        let mut server = self
            .server
            .lock()
            .map_err(|_| anyhow!("bridge server lock poisoned"))?;
        if server.is_some() {
            return Ok(());
        }

        let configured: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid node listen address '{}'", addr))?;
        let listener = std::net::TcpListener::bind(configured)
            .with_context(|| format!("failed to bind node api on {}", configured))?;
        let bound = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let state = self.http_state(shutdown_rx);
        let (done_tx, done_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("node-api".to_string())
            .spawn(move || {
                if let Err(err) = http::serve(listener, state) {
                    log::error!("node api stopped: {:#}", err);
                }
                let _ = done_tx.send(());
            })?;
        log::info!("node api listening on {}", bound);
        *server = Some(ServerHandle {
            addr: bound,
            shutdown: shutdown_tx,
            handle,
            done: done_rx,
        });
        Ok(())
    }

    fn start_radio(&self) -> Result<()> {
        let mut radio = self
            .radio
            .lock()
            .map_err(|_| anyhow!("bridge radio lock poisoned"))?;
        if radio.is_some() {
            return Ok(());
        }
        let injected = self.radio_link.lock().ok().and_then(|mut slot| slot.take());
        let link: Box<dyn Read + Send> = match (injected, &self.settings.radio_device) {
            (Some(link), _) => link,
            (None, Some(path)) => Box::new(
                std::fs::File::open(path)
                    .with_context(|| format!("failed to open radio device {}", path.display()))?,
            ),
            (None, None) => return Ok(()),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let counters = self.radio_counters.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("radio-reader".to_string())
            .spawn(move || {
                radio::read_loop(link, registry, events, counters, thread_stop);
                let _ = done_tx.send(());
            })?;
        log::info!("radio reader started");
        *radio = Some(RadioHandle {
            stop,
            handle,
            done: done_rx,
        });
        Ok(())
    }

    /// Stop the network surfaces and the radio reader. Idempotent.
    pub fn stop(&self) {
        let _ = self.embedded_shutdown.send(true);
        let server = self.server.lock().ok().and_then(|mut s| s.take());
        if let Some(server) = server {
            let _ = server.shutdown.send(true);
            join_with_timeout("node-api", server.handle, &server.done, self.settings.stop_timeout);
            log::info!("node api stopped");
        }
        let radio = self.radio.lock().ok().and_then(|mut r| r.take());
        if let Some(radio) = radio {
            radio.stop.store(true, Ordering::SeqCst);
            join_with_timeout("radio-reader", radio.handle, &radio.done, self.settings.stop_timeout);
        }
    }

    /// Push a command to a node over its live WebSocket.
    pub fn send_command(&self, node_id: &str, command: &str, params: Value) -> Result<(), BridgeError> {
        if command.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("command must not be empty".into()));
        }
        self.connections.send_command(node_id, command, params)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            nodes_total: self.registry.len(),
            nodes_online: self.registry.online_count(),
            websocket_connections: self.connections.len(),
            events_dropped: self.events.dropped.load(Ordering::Relaxed),
            http_addr: self.http_addr(),
            radio: self.radio_counters.snapshot(),
        }
    }
}

impl Drop for ProtocolBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
