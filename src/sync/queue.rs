//! Bounded in-memory priority queue of sync items.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use super::item::SyncItem;

struct Entry(SyncItem);

impl Entry {
    fn key(&self) -> (i32, std::cmp::Reverse<u64>, std::cmp::Reverse<&str>) {
        (
            self.0.priority,
            std::cmp::Reverse(self.0.created_at_ms),
            std::cmp::Reverse(self.0.id.as_str()),
        )
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then older items.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Push {
    Queued,
    Duplicate,
    Full,
}

/// Each id is present at most once.
pub(crate) struct SyncQueue {
    heap: BinaryHeap<Entry>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn push(&mut self, item: SyncItem) -> Push {
        if self.ids.contains(&item.id) {
            return Push::Duplicate;
        }
        if self.heap.len() >= self.capacity {
            return Push::Full;
        }
        self.ids.insert(item.id.clone());
        self.heap.push(Entry(item));
        Push::Queued
    }

    /// Remove up to `max` due items in priority-then-age order. Items not yet due stay.
    pub fn pop_due(&mut self, max: usize, now_ms: u64) -> Vec<SyncItem> {
        let mut due = Vec::new();
        let mut waiting = Vec::new();
        while due.len() < max {
            let Some(Entry(item)) = self.heap.pop() else {
                break;
            };
            if item.is_due(now_ms) {
                self.ids.remove(&item.id);
                due.push(item);
            } else {
                waiting.push(Entry(item));
            }
        }
        self.heap.extend(waiting);
        due
    }

    /// Empty the queue, highest priority first.
    pub fn drain(&mut self) -> Vec<SyncItem> {
        self.ids.clear();
        let mut items = std::mem::take(&mut self.heap).into_sorted_vec();
        items.reverse();
        items.into_iter().map(|Entry(item)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::item::SyncItemType;
    use serde_json::json;

    fn item(kind: SyncItemType, created: u64) -> SyncItem {
        SyncItem::new(kind, "src", json!({}), created, 0)
    }

    #[test]
    fn pops_by_priority_then_age() {
        let mut queue = SyncQueue::new(10);
        queue.push(item(SyncItemType::Telemetry, 1));
        queue.push(item(SyncItemType::Detection, 5));
        queue.push(item(SyncItemType::Detection, 3));
        queue.push(item(SyncItemType::NodeData, 2));

        let order: Vec<_> = queue
            .pop_due(10, u64::MAX)
            .into_iter()
            .map(|i| (i.item_type, i.created_at_ms))
            .collect();
        assert_eq!(
            order,
            vec![
                (SyncItemType::Detection, 3),
                (SyncItemType::Detection, 5),
                (SyncItemType::NodeData, 2),
                (SyncItemType::Telemetry, 1),
            ]
        );
    }

    #[test]
    fn rejects_duplicates_and_overflow() {
        let mut queue = SyncQueue::new(2);
        let a = item(SyncItemType::Telemetry, 1);
        assert_eq!(queue.push(a.clone()), Push::Queued);
        assert_eq!(queue.push(a), Push::Duplicate);
        assert_eq!(queue.push(item(SyncItemType::Telemetry, 2)), Push::Queued);
        assert_eq!(queue.push(item(SyncItemType::Telemetry, 3)), Push::Full);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn items_not_yet_due_stay_queued() {
        let mut queue = SyncQueue::new(10);
        let mut later = item(SyncItemType::Detection, 1);
        later.next_attempt_at_ms = 500;
        let later_id = later.id.clone();
        queue.push(later);
        queue.push(item(SyncItemType::Telemetry, 2));

        let due = queue.pop_due(10, 100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].item_type, SyncItemType::Telemetry);
        assert!(queue.contains(&later_id));
        assert_eq!(queue.pop_due(10, 500).len(), 1);
    }

    #[test]
    fn drain_empties_in_priority_order() {
        let mut queue = SyncQueue::new(10);
        queue.push(item(SyncItemType::Telemetry, 1));
        queue.push(item(SyncItemType::Detection, 2));
        let drained = queue.drain();
        assert_eq!(drained[0].item_type, SyncItemType::Detection);
        assert_eq!(queue.len(), 0);
        assert!(!queue.contains(&drained[0].id));
    }
}
