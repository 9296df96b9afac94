//! Registry of live notification connections.
//!
//! Entries are kept most-recent-first. Every send only enqueues an encoded
//! frame on the entry's outbound channel; the connection's writer task does
//! the socket I/O, so the lock is never held across the network.

use bytes::Bytes;
use guard_wire::{encode_frame, DeviceId, MsgType, ADMIN_CONSOLE_ID};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// Internal id of one accepted connection
pub type ConnId = u64;

/// What to do when an identifier registers while already present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep both; lookups hit the newest
    #[default]
    Allow,
    /// Evict and close the older connection
    Replace,
}

/// Outbound side of a live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: ConnId,
    device_id: DeviceId,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Bytes>,
    closed: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains
    pub fn new(
        conn_id: ConnId,
        device_id: DeviceId,
        peer: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            conn_id,
            device_id,
            peer,
            tx,
            closed: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    /// Connection id
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Registered identifier
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Remote address, when known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a typed frame; false when the payload cannot be framed or the
    /// writer is gone
    pub fn send_frame(&self, typ: impl Into<u8>, payload: &[u8]) -> bool {
        let typ = typ.into();
        match encode_frame(typ, payload) {
            Ok(bytes) => self.tx.send(bytes).is_ok(),
            Err(e) => {
                warn!("Dropping frame for {}: {}", self.device_id, e);
                false
            }
        }
    }

    /// Queue a `MSG_SOCKET` frame
    pub fn send(&self, payload: &[u8]) -> bool {
        self.send_frame(MsgType::Socket, payload)
    }

    /// Whether the writer task is still draining the queue
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Ask the connection task to shut down
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.closed.notified().await
    }
}

/// Concurrency-safe registry of connected devices
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: RwLock<VecDeque<ConnectionHandle>>,
    policy: DuplicatePolicy,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    /// Duplicate handling in effect
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Allocate a connection id
    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert at the head. Under [`DuplicatePolicy::Replace`] older entries
    /// with the same identifier are removed, closed and returned.
    pub async fn register(&self, handle: ConnectionHandle) -> Vec<ConnectionHandle> {
        let mut entries = self.entries.write().await;

        let mut evicted = Vec::new();
        if self.policy == DuplicatePolicy::Replace {
            entries.retain(|e| {
                if e.device_id == handle.device_id {
                    evicted.push(e.clone());
                    false
                } else {
                    true
                }
            });
        }

        debug!(
            "Registered {} (conn {}), {} entries",
            handle.device_id,
            handle.conn_id,
            entries.len() + 1
        );
        entries.push_front(handle);
        drop(entries);

        for old in &evicted {
            info!(device_id = %old.device_id, "Evicting older connection {}", old.conn_id);
            old.close();
        }
        evicted
    }

    /// Remove the first entry with this identifier
    pub async fn unregister(&self, device_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter().position(|e| e.device_id == device_id) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remove exactly the entry created by one connection
    pub async fn unregister_connection(&self, conn_id: ConnId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter().position(|e| e.conn_id == conn_id) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Newest handle for an identifier
    pub async fn find(&self, device_id: &str) -> Option<ConnectionHandle> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| e.device_id == device_id).cloned()
    }

    /// Send a `MSG_SOCKET` frame to one device
    pub async fn unicast(&self, device_id: &str, payload: &[u8]) -> bool {
        self.send_to_device(device_id, MsgType::Socket, payload).await
    }

    /// Send a typed frame (e.g. a server command) to one device
    pub async fn send_to_device(&self, device_id: &str, typ: impl Into<u8>, payload: &[u8]) -> bool {
        let entries = self.entries.read().await;
        match entries.iter().find(|e| e.device_id == device_id) {
            Some(entry) => entry.send_frame(typ, payload),
            None => {
                debug!(device_id, "Device not connected");
                false
            }
        }
    }

    /// Send to every admin console except `sender_id`; returns the number of
    /// recipients
    pub async fn broadcast(&self, sender_id: &str, payload: &[u8]) -> usize {
        let entries = self.entries.read().await;
        let mut sent = 0;
        for entry in entries.iter() {
            if entry.device_id == sender_id || entry.device_id != ADMIN_CONSOLE_ID {
                continue;
            }
            if entry.send(payload) {
                sent += 1;
            }
        }
        sent
    }

    /// Snapshot of identifiers, newest first
    pub async fn list(&self) -> Vec<DeviceId> {
        let entries = self.entries.read().await;
        entries.iter().map(|e| e.device_id.clone()).collect()
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove every entry and close its connection
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.entries.write().await.drain(..).collect();
        for entry in &drained {
            entry.close();
        }
        drained.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_wire::FrameDecoder;

    fn handle(registry: &ConnectionRegistry, id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Bytes>) {
        ConnectionHandle::new(registry.next_conn_id(), DeviceId::new(id).unwrap(), None)
    }

    fn payload_of(bytes: Bytes) -> String {
        let mut buf = bytes::BytesMut::from(&bytes[..]);
        FrameDecoder::new().decode(&mut buf).unwrap().unwrap().text()
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let registry = ConnectionRegistry::default();
        let (a, _ra) = handle(&registry, "a");
        let (b, _rb) = handle(&registry, "b");
        registry.register(a).await;
        registry.register(b).await;

        let ids: Vec<String> = registry.list().await.into_iter().map(String::from).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_unicast_to_absent_device() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.unicast("ghost", b"hello").await);
        assert!(!registry.unregister("ghost").await);
    }

    #[tokio::test]
    async fn test_unicast_and_typed_send() {
        let registry = ConnectionRegistry::default();
        let (a, mut rx) = handle(&registry, "laptop");
        registry.register(a).await;

        assert!(registry.unicast("laptop", b"ping").await);
        assert!(registry.send_to_device("laptop", MsgType::ServerGetLogCmd, b"{}").await);

        assert_eq!(payload_of(rx.recv().await.unwrap()), "ping");
        let raw = rx.recv().await.unwrap();
        assert_eq!(raw[0], MsgType::ServerGetLogCmd.code());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_admin_only_and_skips_sender() {
        let registry = ConnectionRegistry::default();
        let (admin, mut admin_rx) = handle(&registry, ADMIN_CONSOLE_ID);
        let (dev, mut dev_rx) = handle(&registry, "dev-1");
        registry.register(admin).await;
        registry.register(dev).await;

        assert_eq!(registry.broadcast("dev-1", b"Device dev-1 Online").await, 1);
        assert_eq!(payload_of(admin_rx.recv().await.unwrap()), "Device dev-1 Online");
        assert!(dev_rx.try_recv().is_err());

        // the admin console never receives its own broadcast
        assert_eq!(registry.broadcast(ADMIN_CONSOLE_ID, b"self").await, 0);
        assert!(admin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_allow_keeps_both() {
        let registry = ConnectionRegistry::new(DuplicatePolicy::Allow);
        let (first, _r1) = handle(&registry, "dup");
        let (second, _r2) = handle(&registry, "dup");
        let second_id = second.conn_id();
        registry.register(first).await;
        assert!(registry.register(second).await.is_empty());

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.find("dup").await.unwrap().conn_id(), second_id);
    }

    #[tokio::test]
    async fn test_duplicate_replace_evicts_and_closes() {
        let registry = ConnectionRegistry::new(DuplicatePolicy::Replace);
        let (first, _r1) = handle(&registry, "dup");
        let watcher = first.clone();
        let (second, _r2) = handle(&registry, "dup");
        registry.register(first).await;

        let evicted = registry.register(second).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(registry.len().await, 1);
        // close() stored a permit, so this resolves immediately
        tokio::time::timeout(std::time::Duration::from_secs(1), watcher.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unregister_connection_removes_exact_entry() {
        let registry = ConnectionRegistry::new(DuplicatePolicy::Allow);
        let (old, _r1) = handle(&registry, "dup");
        let (new, _r2) = handle(&registry, "dup");
        let old_id = old.conn_id();
        let new_id = new.conn_id();
        registry.register(old).await;
        registry.register(new).await;

        assert!(registry.unregister_connection(old_id).await);
        assert_eq!(registry.find("dup").await.unwrap().conn_id(), new_id);
        assert!(!registry.unregister_connection(old_id).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_unregister() {
        let registry = Arc::new(ConnectionRegistry::default());
        let mut tasks = Vec::new();

        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("dev-{}", i);
                let (h, _rx) =
                    ConnectionHandle::new(registry.next_conn_id(), DeviceId::new(id.clone()).unwrap(), None);
                registry.register(h).await;
                let _ = registry.list().await;
                if i % 2 == 0 {
                    assert!(registry.unregister(&id).await);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let ids = registry.list().await;
        assert_eq!(ids.len(), 32);
        assert!(ids.iter().all(|id| {
            let n: usize = id.as_str()[4..].parse().unwrap();
            n % 2 == 1
        }));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::default();
        let (a, _ra) = handle(&registry, "a");
        let watcher = a.clone();
        registry.register(a).await;

        assert_eq!(registry.close_all().await, 1);
        assert!(registry.is_empty().await);
        tokio::time::timeout(std::time::Duration::from_secs(1), watcher.closed())
            .await
            .unwrap();
    }
}
