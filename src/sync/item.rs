use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemType {
    Detection,
    Telemetry,
    NodeData,
}

impl SyncItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Telemetry => "telemetry",
            Self::NodeData => "node_data",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "detection" => Ok(Self::Detection),
            "telemetry" => Ok(Self::Telemetry),
            "node_data" => Ok(Self::NodeData),
            other => Err(anyhow!("unknown sync item type '{}'", other)),
        }
    }

    /// Higher is sent sooner.
    pub fn default_priority(self) -> i32 {
        match self {
            Self::Detection => 2,
            Self::NodeData => 1,
            Self::Telemetry => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Retry,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "retry" => Ok(Self::Retry),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown sync status '{}'", other)),
        }
    }

    /// Completed and failed items are never picked up again automatically.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Binary payload sent ahead of the item itself (detection snapshots).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// One unit of data awaiting cloud delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncItem {
    pub id: String,
    pub item_type: SyncItemType,
    /// Camera name, node id or gateway id the item came from.
    pub source: String,
    pub payload: Value,
    pub attachment: Option<Attachment>,
    pub priority: i32,
    pub created_at_ms: u64,
    pub attempts: u32,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    /// Earliest time the next attempt may run.
    pub next_attempt_at_ms: u64,
}

impl SyncItem {
    /// Build a pending item. `nonce` disambiguates items with equal type, source and
    /// timestamp.
    pub fn new(
        item_type: SyncItemType,
        source: impl Into<String>,
        payload: Value,
        created_at_ms: u64,
        nonce: u64,
    ) -> Self {
        let source = source.into();
        Self {
            id: item_id(item_type, &source, created_at_ms, nonce),
            item_type,
            source,
            payload,
            attachment: None,
            priority: item_type.default_priority(),
            created_at_ms,
            attempts: 0,
            status: SyncStatus::Pending,
            last_error: None,
            next_attempt_at_ms: 0,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Cloud path this item is posted to.
    pub fn endpoint(&self) -> String {
        match self.item_type {
            SyncItemType::Detection => "/detections".to_string(),
            SyncItemType::Telemetry => "/telemetry".to_string(),
            SyncItemType::NodeData => format!("/field_nodes/{}/data", self.source),
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at_ms <= now_ms
    }
}

fn item_id(item_type: SyncItemType, source: &str, created_at_ms: u64, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at_ms.to_le_bytes());
    hasher.update(b"|");
    hasher.update(nonce.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_stable_and_distinct() {
        let a = SyncItem::new(SyncItemType::Detection, "cam-a", json!({}), 1000, 0);
        let b = SyncItem::new(SyncItemType::Detection, "cam-a", json!({"x": 1}), 1000, 0);
        let c = SyncItem::new(SyncItemType::Detection, "cam-a", json!({}), 1000, 1);
        let d = SyncItem::new(SyncItemType::Telemetry, "cam-a", json!({}), 1000, 0);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
        assert_eq!(a.id.len(), 32);
    }

    #[test]
    fn priorities_follow_type() {
        assert!(SyncItemType::Detection.default_priority() > SyncItemType::NodeData.default_priority());
        assert!(SyncItemType::NodeData.default_priority() > SyncItemType::Telemetry.default_priority());
    }

    #[test]
    fn node_data_posts_under_node() {
        let item = SyncItem::new(SyncItemType::NodeData, "trail-1", json!({}), 1, 0);
        assert_eq!(item.endpoint(), "/field_nodes/trail-1/data");
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::InProgress,
            SyncStatus::Retry,
            SyncStatus::Completed,
            SyncStatus::Failed,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SyncStatus::parse("lost").is_err());
    }
}
