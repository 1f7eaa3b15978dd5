//! Durable sync store.
//!
//! One actor thread owns the SQLite connection. Everything else holds a cloneable
//! [`StoreHandle`] and talks to it over a channel, one request at a time, so the
//! database handle never crosses threads.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use super::item::{Attachment, SyncItem, SyncItemType, SyncStatus};

/// Per-status row counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Mutable delivery state of one item.
#[derive(Clone, Debug)]
pub(crate) struct ItemState {
    pub status: SyncStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at_ms: u64,
}

impl ItemState {
    pub fn of(item: &SyncItem) -> Self {
        Self {
            status: item.status,
            attempts: item.attempts,
            last_error: item.last_error.clone(),
            next_attempt_at_ms: item.next_attempt_at_ms,
        }
    }
}

type Reply<T> = Sender<Result<T>>;

enum Request {
    Insert(SyncItem, Reply<bool>),
    UpdateState(String, ItemState, Reply<bool>),
    Get(String, Reply<Option<SyncItem>>),
    LoadActive(usize, Reply<Vec<SyncItem>>),
    ResetInProgress(Reply<usize>),
    Counts(Reply<StatusCounts>),
    PurgeCompleted(u64, Reply<usize>),
    Shutdown,
}

/// Handle to the store actor.
#[derive(Clone)]
pub struct StoreHandle {
    tx: Sender<Request>,
}

impl StoreHandle {
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| anyhow!("sync store is closed"))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("sync store dropped the request"))?
    }

    /// Persist a new item. Returns false if the id already exists.
    pub fn insert(&self, item: SyncItem) -> Result<bool> {
        self.call(|reply| Request::Insert(item, reply))
    }

    /// Persist delivery state. Completed rows are never changed and attempts never
    /// decrease. Returns false if nothing was updated.
    pub(crate) fn update_state(&self, id: &str, state: ItemState) -> Result<bool> {
        let id = id.to_string();
        self.call(|reply| Request::UpdateState(id, state, reply))
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncItem>> {
        let id = id.to_string();
        self.call(|reply| Request::Get(id, reply))
    }

    /// Pending, retry and in-progress items in priority-then-age order.
    pub fn load_active(&self, limit: usize) -> Result<Vec<SyncItem>> {
        self.call(|reply| Request::LoadActive(limit, reply))
    }

    /// Turn interrupted attempts back into retries. Run once at startup.
    pub fn reset_in_progress(&self) -> Result<usize> {
        self.call(Request::ResetInProgress)
    }

    pub fn counts(&self) -> Result<StatusCounts> {
        self.call(Request::Counts)
    }

    /// Delete completed rows last updated before `cutoff_ms`.
    pub fn purge_completed(&self, cutoff_ms: u64) -> Result<usize> {
        self.call(|reply| Request::PurgeCompleted(cutoff_ms, reply))
    }
}

/// Running store actor.
pub struct SyncStore {
    handle: StoreHandle,
    thread: Option<JoinHandle<()>>,
}

impl SyncStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sync store {}", path.display()))?;
        Self::start(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::start(Connection::open_in_memory()?)
    }

    fn start(conn: Connection) -> Result<Self> {
        let actor = StoreActor { conn };
        actor.ensure_schema()?;
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("sync-store".to_string())
            .spawn(move || actor.run(rx))?;
        Ok(Self {
            handle: StoreHandle { tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    /// Stop the actor. Outstanding handles fail with "sync store is closed" afterwards.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(Request::Shutdown);
            if thread.join().is_err() {
                log::error!("sync store thread panicked");
            }
        }
    }
}

impl Drop for SyncStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct StoreActor {
    conn: Connection,
}

impl StoreActor {
    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sync_items (
              id TEXT PRIMARY KEY,
              item_type TEXT NOT NULL,
              source TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              attachment BLOB,
              attachment_type TEXT,
              priority INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              status TEXT NOT NULL,
              last_error TEXT,
              next_attempt_at INTEGER NOT NULL DEFAULT 0,
              updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_items_status
              ON sync_items(status, priority DESC, created_at);
            "#,
        )?;
        Ok(())
    }

    fn run(self, rx: Receiver<Request>) {
        while let Ok(request) = rx.recv() {
            match request {
                Request::Insert(item, reply) => {
                    let _ = reply.send(self.insert(&item));
                }
                Request::UpdateState(id, state, reply) => {
                    let _ = reply.send(self.update_state(&id, &state));
                }
                Request::Get(id, reply) => {
                    let _ = reply.send(self.get(&id));
                }
                Request::LoadActive(limit, reply) => {
                    let _ = reply.send(self.load_active(limit));
                }
                Request::ResetInProgress(reply) => {
                    let _ = reply.send(self.reset_in_progress());
                }
                Request::Counts(reply) => {
                    let _ = reply.send(self.counts());
                }
                Request::PurgeCompleted(cutoff, reply) => {
                    let _ = reply.send(self.purge_completed(cutoff));
                }
                Request::Shutdown => break,
            }
        }
        log::debug!("sync store closed");
    }

    fn insert(&self, item: &SyncItem) -> Result<bool> {
        let payload = serde_json::to_string(&item.payload)?;
        let (attachment, attachment_type) = match &item.attachment {
            Some(a) => (Some(a.data.as_slice()), Some(a.content_type.as_str())),
            None => (None, None),
        };
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO sync_items
               (id, item_type, source, payload_json, attachment, attachment_type, priority,
                created_at, attempts, status, last_error, next_attempt_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                item.id,
                item.item_type.as_str(),
                item.source,
                payload,
                attachment,
                attachment_type,
                item.priority,
                item.created_at_ms as i64,
                item.attempts,
                item.status.as_str(),
                item.last_error,
                item.next_attempt_at_ms as i64,
                crate::now_ms()? as i64,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn update_state(&self, id: &str, state: &ItemState) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE sync_items
                SET status = ?2,
                    attempts = MAX(attempts, ?3),
                    last_error = ?4,
                    next_attempt_at = ?5,
                    updated_at = ?6
              WHERE id = ?1 AND status != 'completed'",
            params![
                id,
                state.status.as_str(),
                state.attempts,
                state.last_error,
                state.next_attempt_at_ms as i64,
                crate::now_ms()? as i64,
            ],
        )?;
        Ok(updated == 1)
    }

    fn get(&self, id: &str) -> Result<Option<SyncItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM sync_items WHERE id = ?1", ITEM_COLUMNS))?;
        let row = stmt
            .query_row(params![id], |row| Ok(RawRow::read(row)))
            .optional()?;
        row.transpose()?.map(RawRow::into_item).transpose()
    }

    fn load_active(&self, limit: usize) -> Result<Vec<SyncItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sync_items
              WHERE status IN ('pending', 'retry', 'in_progress')
              ORDER BY priority DESC, created_at ASC, id ASC
              LIMIT ?1",
            ITEM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], |row| Ok(RawRow::read(row)))?;
        let mut items = Vec::new();
        for row in rows {
            match row?.and_then(RawRow::into_item) {
                Ok(item) => items.push(item),
                Err(err) => log::warn!("skipping unreadable sync row: {:#}", err),
            }
        }
        Ok(items)
    }

    fn reset_in_progress(&self) -> Result<usize> {
        let reset = self.conn.execute(
            "UPDATE sync_items SET status = 'retry', updated_at = ?1 WHERE status = 'in_progress'",
            params![crate::now_ms()? as i64],
        )?;
        Ok(reset)
    }

    fn counts(&self) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM sync_items GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let n: i64 = row.get(1)?;
            let n = n.max(0) as u64;
            match SyncStatus::parse(&status)? {
                SyncStatus::Pending => counts.pending = n,
                SyncStatus::InProgress => counts.in_progress = n,
                SyncStatus::Retry => counts.retry = n,
                SyncStatus::Completed => counts.completed = n,
                SyncStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    fn purge_completed(&self, cutoff_ms: u64) -> Result<usize> {
        let purged = self.conn.execute(
            "DELETE FROM sync_items WHERE status = 'completed' AND updated_at < ?1",
            params![cutoff_ms as i64],
        )?;
        Ok(purged)
    }
}

const ITEM_COLUMNS: &str = "id, item_type, source, payload_json, attachment, attachment_type, \
     priority, created_at, attempts, status, last_error, next_attempt_at";

struct RawRow {
    id: String,
    item_type: String,
    source: String,
    payload_json: String,
    attachment: Option<Vec<u8>>,
    attachment_type: Option<String>,
    priority: i32,
    created_at: i64,
    attempts: u32,
    status: String,
    last_error: Option<String>,
    next_attempt_at: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_type: row.get(1)?,
            source: row.get(2)?,
            payload_json: row.get(3)?,
            attachment: row.get(4)?,
            attachment_type: row.get(5)?,
            priority: row.get(6)?,
            created_at: row.get(7)?,
            attempts: row.get(8)?,
            status: row.get(9)?,
            last_error: row.get(10)?,
            next_attempt_at: row.get(11)?,
        })
    }

    fn into_item(self) -> Result<SyncItem> {
        let payload = serde_json::from_str(&self.payload_json)
            .with_context(|| format!("sync item {} has invalid payload", self.id))?;
        let attachment = self.attachment.map(|data| Attachment {
            content_type: self
                .attachment_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            data,
        });
        Ok(SyncItem {
            item_type: SyncItemType::parse(&self.item_type)?,
            status: SyncStatus::parse(&self.status)?,
            id: self.id,
            source: self.source,
            payload,
            attachment,
            priority: self.priority,
            created_at_ms: self.created_at.max(0) as u64,
            attempts: self.attempts,
            last_error: self.last_error,
            next_attempt_at_ms: self.next_attempt_at.max(0) as u64,
        })
    }
}
