//! Shared registry of field nodes.
//!
//! Every transport writes through the same registry, so `last_seen_ms` and `status`
//! reflect whichever transport most recently heard from a node. Nodes are never
//! removed, only marked offline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::now_ms_lossy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTransport {
    Http,
    WebSocket,
    Radio,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Esp32Node {
    pub node_id: String,
    pub name: String,
    /// Network address; absent for radio-only nodes.
    pub address: Option<String>,
    pub firmware_version: Option<String>,
    /// Battery charge in percent.
    pub battery_level: Option<f32>,
    pub status: NodeStatus,
    pub transport: NodeTransport,
    pub registered_at_ms: u64,
    pub last_seen_ms: u64,
}

/// Self-reported node properties. `None` fields keep their previous value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub battery_level: Option<f32>,
}

#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<Mutex<BTreeMap<String, Esp32Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Esp32Node>> {
        // A poisoned registry still holds consistent per-node records.
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or update a node from a registration or beacon.
    pub fn register(&self, node_id: &str, info: NodeInfo, transport: NodeTransport) -> Esp32Node {
        let now = now_ms_lossy();
        let mut nodes = self.lock();
        let node = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| {
                log::info!("node '{}' registered via {:?}", node_id, transport);
                new_node(node_id, transport, now)
            });
        if let Some(name) = info.name.filter(|n| !n.trim().is_empty()) {
            node.name = name;
        }
        if info.address.is_some() {
            node.address = info.address;
        }
        if info.firmware_version.is_some() {
            node.firmware_version = info.firmware_version;
        }
        if let Some(level) = info.battery_level {
            node.battery_level = Some(level.clamp(0.0, 100.0));
        }
        seen(node, transport, now);
        node.clone()
    }

    /// Record that a node was heard from. Unknown nodes are created.
    pub fn touch(&self, node_id: &str, transport: NodeTransport) -> Esp32Node {
        let now = now_ms_lossy();
        let mut nodes = self.lock();
        let node = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| new_node(node_id, transport, now));
        seen(node, transport, now);
        node.clone()
    }

    pub fn get(&self, node_id: &str) -> Option<Esp32Node> {
        self.lock().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.lock().contains_key(node_id)
    }

    pub fn list(&self) -> Vec<Esp32Node> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn online_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .count()
    }

    /// Mark one node offline. Returns false for unknown nodes.
    pub fn mark_offline(&self, node_id: &str) -> bool {
        match self.lock().get_mut(node_id) {
            Some(node) => {
                if node.status == NodeStatus::Online {
                    log::info!("node '{}' is offline", node_id);
                }
                node.status = NodeStatus::Offline;
                true
            }
            None => false,
        }
    }

    /// Mark every online node not heard from within `max_age` offline.
    ///
    /// Returns the ids that changed state.
    pub fn mark_stale(&self, max_age: Duration) -> Vec<String> {
        let cutoff = now_ms_lossy().saturating_sub(max_age.as_millis() as u64);
        let mut changed = Vec::new();
        for node in self.lock().values_mut() {
            if node.status == NodeStatus::Online && node.last_seen_ms < cutoff {
                node.status = NodeStatus::Offline;
                changed.push(node.node_id.clone());
            }
        }
        if !changed.is_empty() {
            log::info!("marked {} stale node(s) offline: {:?}", changed.len(), changed);
        }
        changed
    }
}

fn new_node(node_id: &str, transport: NodeTransport, now: u64) -> Esp32Node {
    Esp32Node {
        node_id: node_id.to_string(),
        name: node_id.to_string(),
        address: None,
        firmware_version: None,
        battery_level: None,
        status: NodeStatus::Online,
        transport,
        registered_at_ms: now,
        last_seen_ms: now,
    }
}

fn seen(node: &mut Esp32Node, transport: NodeTransport, now: u64) {
    node.status = NodeStatus::Online;
    node.transport = transport;
    node.last_seen_ms = node.last_seen_ms.max(now);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_merges_reported_fields() {
        let registry = NodeRegistry::new();
        registry.register(
            "trail-1",
            NodeInfo {
                name: Some("Trail cam".into()),
                firmware_version: Some("1.0.0".into()),
                battery_level: Some(88.0),
                ..NodeInfo::default()
            },
            NodeTransport::Http,
        );
        let node = registry.register(
            "trail-1",
            NodeInfo {
                battery_level: Some(120.0),
                ..NodeInfo::default()
            },
            NodeTransport::Radio,
        );
        assert_eq!(node.name, "Trail cam");
        assert_eq!(node.firmware_version.as_deref(), Some("1.0.0"));
        assert_eq!(node.battery_level, Some(100.0));
        assert_eq!(node.transport, NodeTransport::Radio);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_creates_and_revives() {
        let registry = NodeRegistry::new();
        let node = registry.touch("lora-7", NodeTransport::Radio);
        assert_eq!(node.name, "lora-7");
        assert!(node.address.is_none());

        assert!(registry.mark_offline("lora-7"));
        assert_eq!(registry.online_count(), 0);
        registry.touch("lora-7", NodeTransport::WebSocket);
        assert_eq!(registry.get("lora-7").unwrap().status, NodeStatus::Online);
    }

    #[test]
    fn mark_offline_unknown_is_false() {
        assert!(!NodeRegistry::new().mark_offline("ghost"));
    }

    #[test]
    fn mark_stale_only_touches_old_nodes() {
        let registry = NodeRegistry::new();
        registry.touch("old", NodeTransport::Http);
        registry.touch("fresh", NodeTransport::Http);
        registry
            .nodes
            .lock()
            .unwrap()
            .get_mut("old")
            .unwrap()
            .last_seen_ms -= 60_000;

        let changed = registry.mark_stale(Duration::from_secs(30));
        assert_eq!(changed, vec!["old".to_string()]);
        assert_eq!(registry.get("fresh").unwrap().status, NodeStatus::Online);
        assert!(registry.contains("old"));
    }
}
