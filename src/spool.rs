//! Persistent FIFO of outbound publish requests (spec §3/§6). The spool
//! itself is an external collaborator in the original system (a
//! filesystem/memory-backed queue plugin); this module defines the
//! interface plus an in-memory implementation sufficient to run and test
//! the publisher loop without a disk-backed dependency.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::transport::QosLevel;

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct SpoolEntry {
    pub id: u64,
    pub request: PublishRequest,
    pub retried: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    /// Not implemented by this crate — a disk-backed spool is an external
    /// collaborator per spec §1. Present so configuration can name it.
    Disk,
}

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub keep_qos0_when_offline: bool,
    pub spool_size_in_bytes: usize,
    pub storage_type: StorageType,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            keep_qos0_when_offline: false,
            spool_size_in_bytes: crate::limits::DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES * 64,
            storage_type: StorageType::Memory,
        }
    }
}

#[async_trait::async_trait]
pub trait Spool: Send + Sync {
    async fn add_message(&self, request: PublishRequest) -> Result<SpoolEntry>;
    /// Blocks until an id is available or the spool is interrupted.
    async fn pop_id(&self) -> Result<u64>;
    /// Re-enqueues `id` at the head of the FIFO (priority re-delivery of a
    /// retried publish).
    async fn add_id(&self, id: u64);
    async fn get_message_by_id(&self, id: u64) -> Option<SpoolEntry>;
    async fn remove_message_by_id(&self, id: u64);
    async fn pop_all_qos0(&self);
    fn spool_config(&self) -> SpoolConfig;
    /// Wakes any task blocked in `pop_id` with `Error::Interrupted`, for
    /// cooperative shutdown.
    fn interrupt(&self);
}

struct Inner {
    queue: VecDeque<u64>,
    entries: HashMap<u64, SpoolEntry>,
    bytes_used: usize,
}

pub struct MemorySpool {
    inner: StdMutex<Inner>,
    notify: Notify,
    interrupted: AtomicBool,
    next_id: AtomicU64,
    config: SpoolConfig,
}

impl MemorySpool {
    pub fn new(config: SpoolConfig) -> Self {
        Self {
            inner: StdMutex::new(Inner {
                queue: VecDeque::new(),
                entries: HashMap::new(),
                bytes_used: 0,
            }),
            notify: Notify::new(),
            interrupted: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            config,
        }
    }
}

#[async_trait::async_trait]
impl Spool for MemorySpool {
    async fn add_message(&self, request: PublishRequest) -> Result<SpoolEntry> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(Error::SpoolInterrupted);
        }

        let payload_len = request.payload.len();
        let mut inner = self.inner.lock().unwrap();

        if inner.bytes_used + payload_len > self.config.spool_size_in_bytes {
            return Err(Error::SpoolFull);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = SpoolEntry { id, request, retried: 0 };
        inner.bytes_used += payload_len;
        inner.entries.insert(id, entry.clone());
        inner.queue.push_back(id);
        drop(inner);

        self.notify.notify_one();
        Ok(entry)
    }

    async fn pop_id(&self) -> Result<u64> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(id) = inner.queue.pop_front() {
                    return Ok(id);
                }
            }
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }
            self.notify.notified().await;
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }
        }
    }

    async fn add_id(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.retried += 1;
            inner.queue.push_front(id);
            drop(inner);
            self.notify.notify_one();
        }
    }

    async fn get_message_by_id(&self, id: u64) -> Option<SpoolEntry> {
        self.inner.lock().unwrap().entries.get(&id).cloned()
    }

    async fn remove_message_by_id(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(&id) {
            inner.bytes_used = inner.bytes_used.saturating_sub(entry.request.payload.len());
        }
    }

    async fn pop_all_qos0(&self) {
        let mut inner = self.inner.lock().unwrap();
        let qos0_ids: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.request.qos, QosLevel::AtMostOnce))
            .map(|(id, _)| *id)
            .collect();

        for id in qos0_ids {
            if let Some(entry) = inner.entries.remove(&id) {
                inner.bytes_used = inner.bytes_used.saturating_sub(entry.request.payload.len());
            }
            inner.queue.retain(|queued| *queued != id);
        }
    }

    fn spool_config(&self) -> SpoolConfig {
        self.config.clone()
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(topic: &str, qos: QosLevel) -> PublishRequest {
        PublishRequest {
            topic: topic.to_owned(),
            payload: Bytes::from_static(b"hi"),
            qos,
            retain: false,
        }
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let spool = MemorySpool::new(SpoolConfig::default());
        let a = spool.add_message(request("a", QosLevel::AtLeastOnce)).await.unwrap();
        let b = spool.add_message(request("b", QosLevel::AtLeastOnce)).await.unwrap();

        assert_eq!(spool.pop_id().await.unwrap(), a.id);
        assert_eq!(spool.pop_id().await.unwrap(), b.id);
    }

    #[tokio::test]
    async fn add_id_reenqueues_at_head() {
        let spool = MemorySpool::new(SpoolConfig::default());
        let a = spool.add_message(request("a", QosLevel::AtLeastOnce)).await.unwrap();
        let b = spool.add_message(request("b", QosLevel::AtLeastOnce)).await.unwrap();

        let popped = spool.pop_id().await.unwrap();
        assert_eq!(popped, a.id);
        spool.add_id(popped).await;

        assert_eq!(spool.pop_id().await.unwrap(), a.id);
        assert_eq!(spool.pop_id().await.unwrap(), b.id);
    }

    #[tokio::test]
    async fn full_spool_rejects_enqueue() {
        let spool = MemorySpool::new(SpoolConfig {
            spool_size_in_bytes: 1,
            ..SpoolConfig::default()
        });
        let result = spool.add_message(request("a", QosLevel::AtLeastOnce)).await;
        assert!(matches!(result, Err(Error::SpoolFull)));
    }

    #[tokio::test]
    async fn pop_all_qos0_purges_only_qos0() {
        let spool = MemorySpool::new(SpoolConfig::default());
        let qos0 = spool.add_message(request("a", QosLevel::AtMostOnce)).await.unwrap();
        let qos1 = spool.add_message(request("b", QosLevel::AtLeastOnce)).await.unwrap();

        spool.pop_all_qos0().await;

        assert!(spool.get_message_by_id(qos0.id).await.is_none());
        assert!(spool.get_message_by_id(qos1.id).await.is_some());
    }

    #[tokio::test]
    async fn interrupted_spool_rejects_new_enqueues() {
        let spool = MemorySpool::new(SpoolConfig::default());
        spool.interrupt();

        let result = spool.add_message(request("a", QosLevel::AtLeastOnce)).await;
        assert!(matches!(result, Err(Error::SpoolInterrupted)));
    }

    #[tokio::test]
    async fn interrupt_wakes_blocked_pop() {
        let spool = std::sync::Arc::new(MemorySpool::new(SpoolConfig::default()));
        let spool2 = spool.clone();
        let handle = tokio::spawn(async move { spool2.pop_id().await });

        tokio::task::yield_now().await;
        spool.interrupt();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Interrupted)));
    }
}
