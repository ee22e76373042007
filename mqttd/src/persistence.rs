//! Session persistence.
//!
//! The [`Persistence`] trait is the only path through which the registry and
//! the outbound pipeline touch durable storage. [`MemoryPersistence`] keeps
//! everything in process memory.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PersistenceError, PersistenceResult};
use crate::types::ProtocolVersion;

/// One encoded packet together with its message expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPacket {
    /// Complete wire frame in the session's protocol version.
    pub data: Vec<u8>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Snapshot of an outbound pipeline taken when it stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedPackets {
    pub qos0: Vec<PersistedPacket>,
    pub qos12: Vec<PersistedPacket>,
    /// Sent but not acknowledged, in send order.
    pub unack: Vec<PersistedPacket>,
}

impl PersistedPackets {
    pub fn is_empty(&self) -> bool {
        self.qos0.is_empty() && self.qos12.is_empty() && self.unack.is_empty()
    }
}

/// Record written when a session is first created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBase {
    pub timestamp: DateTime<Utc>,
    pub version: ProtocolVersion,
}

/// Delayed will stored with an expiry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedWill {
    pub delay: u32,
    /// MQTT 5.0 encoded PUBLISH.
    pub data: Vec<u8>,
}

/// State of an expiry timer that did not fire before the broker stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiryState {
    /// When the session went offline.
    pub since: DateTime<Utc>,
    /// Session expiry interval in seconds, `EXPIRY_NEVER` to keep the
    /// session until the client returns.
    pub expire_in: u32,
    pub will: Option<PersistedWill>,
}

/// Everything known about one persisted session, handed to the startup loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub base: SessionBase,
    pub subscriptions: Option<Vec<u8>>,
    pub expiry: Option<ExpiryState>,
    /// Problems the backend hit while reading this record.
    pub errors: Vec<String>,
}

/// Packet visitor. Return false to stop; the refused entry and everything
/// after it stay stored.
pub type PacketVisitor<'a> = &'a mut dyn FnMut(&PersistedPacket) -> bool;

/// Durable storage for sessions.
///
/// The `packets_for_each_*` methods drain what their visitor accepts.
pub trait Persistence: Send + Sync {
    fn exists(&self, id: &str) -> bool;
    fn create(&self, id: &str, base: SessionBase) -> PersistenceResult<()>;
    fn delete(&self, id: &str) -> PersistenceResult<()>;
    /// Number of persisted sessions.
    fn count(&self) -> u64;

    /// Visit every persisted session once. Stops early when `cancel` fires.
    fn load_for_each(
        &self,
        cancel: &CancellationToken,
        visitor: &mut dyn FnMut(&str, SessionState),
    ) -> PersistenceResult<()>;

    fn packets_store(&self, id: &str, packets: PersistedPackets) -> PersistenceResult<()>;
    fn packets_delete(&self, id: &str) -> PersistenceResult<()>;
    fn packet_store_qos0(&self, id: &str, packet: PersistedPacket) -> PersistenceResult<()>;
    fn packet_store_qos12(&self, id: &str, packet: PersistedPacket) -> PersistenceResult<()>;
    fn packets_for_each_qos0(&self, id: &str, visitor: PacketVisitor<'_>) -> PersistenceResult<()>;
    fn packets_for_each_qos12(&self, id: &str, visitor: PacketVisitor<'_>) -> PersistenceResult<()>;
    fn packets_for_each_unack(&self, id: &str, visitor: PacketVisitor<'_>) -> PersistenceResult<()>;

    fn subscriptions_store(&self, id: &str, blob: &[u8]) -> PersistenceResult<()>;
    fn subscriptions_delete(&self, id: &str) -> PersistenceResult<()>;

    fn expiry_store(&self, id: &str, state: ExpiryState) -> PersistenceResult<()>;
    fn expiry_delete(&self, id: &str) -> PersistenceResult<()>;
}

#[derive(Debug, Clone)]
struct Record {
    base: SessionBase,
    subscriptions: Option<Vec<u8>>,
    expiry: Option<ExpiryState>,
    qos0: VecDeque<PersistedPacket>,
    qos12: VecDeque<PersistedPacket>,
    unack: VecDeque<PersistedPacket>,
}

impl Record {
    fn new(base: SessionBase) -> Self {
        Self {
            base,
            subscriptions: None,
            expiry: None,
            qos0: VecDeque::new(),
            qos12: VecDeque::new(),
            unack: VecDeque::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Queue {
    QoS0,
    QoS12,
    Unack,
}

/// In-memory persistence for tests and embedded brokers.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryPersistence {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored packets for `id`, as (qos0, qos12, unack).
    pub fn packet_counts(&self, id: &str) -> (usize, usize, usize) {
        self.records
            .lock()
            .get(id)
            .map(|r| (r.qos0.len(), r.qos12.len(), r.unack.len()))
            .unwrap_or_default()
    }

    /// Stored subscription blob for `id`.
    pub fn subscriptions(&self, id: &str) -> Option<Vec<u8>> {
        self.records.lock().get(id)?.subscriptions.clone()
    }

    /// Stored expiry state for `id`.
    pub fn expiry(&self, id: &str) -> Option<ExpiryState> {
        self.records.lock().get(id)?.expiry.clone()
    }

    fn with_record<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Record) -> T,
    ) -> PersistenceResult<T> {
        let mut records = self.records.lock();
        let record = records.get_mut(id).ok_or(PersistenceError::NotFound)?;
        Ok(f(record))
    }

    fn for_each(&self, id: &str, queue: Queue, visitor: PacketVisitor<'_>) -> PersistenceResult<()> {
        // Drain under the lock, visit outside it.
        let pending: Vec<PersistedPacket> = self.with_record(id, |r| {
            let q = match queue {
                Queue::QoS0 => &mut r.qos0,
                Queue::QoS12 => &mut r.qos12,
                Queue::Unack => &mut r.unack,
            };
            q.drain(..).collect()
        })?;

        let mut pending = pending.into_iter();
        let mut rest = Vec::new();
        while let Some(packet) = pending.next() {
            if !visitor(&packet) {
                rest.push(packet);
                rest.extend(pending);
                break;
            }
        }
        if !rest.is_empty() {
            let mut records = self.records.lock();
            if let Some(r) = records.get_mut(id) {
                let q = match queue {
                    Queue::QoS0 => &mut r.qos0,
                    Queue::QoS12 => &mut r.qos12,
                    Queue::Unack => &mut r.unack,
                };
                for packet in rest.into_iter().rev() {
                    q.push_front(packet);
                }
            }
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn exists(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }

    fn create(&self, id: &str, base: SessionBase) -> PersistenceResult<()> {
        self.records
            .lock()
            .entry(id.to_string())
            .and_modify(|r| r.base = base.clone())
            .or_insert_with(|| Record::new(base));
        Ok(())
    }

    fn delete(&self, id: &str) -> PersistenceResult<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    fn count(&self) -> u64 {
        self.records.lock().len() as u64
    }

    fn load_for_each(
        &self,
        cancel: &CancellationToken,
        visitor: &mut dyn FnMut(&str, SessionState),
    ) -> PersistenceResult<()> {
        let snapshot: Vec<(String, SessionState)> = {
            let records = self.records.lock();
            let mut out: Vec<_> = records
                .iter()
                .map(|(id, r)| {
                    (
                        id.clone(),
                        SessionState {
                            base: r.base.clone(),
                            subscriptions: r.subscriptions.clone(),
                            expiry: r.expiry.clone(),
                            errors: Vec::new(),
                        },
                    )
                })
                .collect();
            out.sort_by(|a, b| a.0.cmp(&b.0));
            out
        };

        for (id, state) in snapshot {
            if cancel.is_cancelled() {
                break;
            }
            visitor(&id, state);
        }
        Ok(())
    }

    fn packets_store(&self, id: &str, packets: PersistedPackets) -> PersistenceResult<()> {
        self.with_record(id, |r| {
            r.qos0.extend(packets.qos0);
            r.qos12.extend(packets.qos12);
            r.unack.extend(packets.unack);
        })
    }

    fn packets_delete(&self, id: &str) -> PersistenceResult<()> {
        // Deleting packets of an unknown session is a no-op.
        if let Some(r) = self.records.lock().get_mut(id) {
            r.qos0.clear();
            r.qos12.clear();
            r.unack.clear();
        }
        Ok(())
    }

    fn packet_store_qos0(&self, id: &str, packet: PersistedPacket) -> PersistenceResult<()> {
        self.with_record(id, |r| r.qos0.push_back(packet))
    }

    fn packet_store_qos12(&self, id: &str, packet: PersistedPacket) -> PersistenceResult<()> {
        self.with_record(id, |r| r.qos12.push_back(packet))
    }

    fn packets_for_each_qos0(&self, id: &str, visitor: PacketVisitor<'_>) -> PersistenceResult<()> {
        self.for_each(id, Queue::QoS0, visitor)
    }

    fn packets_for_each_qos12(&self, id: &str, visitor: PacketVisitor<'_>) -> PersistenceResult<()> {
        self.for_each(id, Queue::QoS12, visitor)
    }

    fn packets_for_each_unack(&self, id: &str, visitor: PacketVisitor<'_>) -> PersistenceResult<()> {
        self.for_each(id, Queue::Unack, visitor)
    }

    fn subscriptions_store(&self, id: &str, blob: &[u8]) -> PersistenceResult<()> {
        self.with_record(id, |r| r.subscriptions = Some(blob.to_vec()))
    }

    fn subscriptions_delete(&self, id: &str) -> PersistenceResult<()> {
        if let Some(r) = self.records.lock().get_mut(id) {
            r.subscriptions = None;
        }
        Ok(())
    }

    fn expiry_store(&self, id: &str, state: ExpiryState) -> PersistenceResult<()> {
        self.with_record(id, |r| r.expiry = Some(state))
    }

    fn expiry_delete(&self, id: &str) -> PersistenceResult<()> {
        if let Some(r) = self.records.lock().get_mut(id) {
            r.expiry = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SessionBase {
        SessionBase {
            timestamp: Utc::now(),
            version: ProtocolVersion::V5,
        }
    }

    fn packet(b: u8) -> PersistedPacket {
        PersistedPacket {
            data: vec![b],
            expire_at: None,
        }
    }

    #[test]
    fn test_create_exists_delete() {
        let store = MemoryPersistence::new();
        assert!(!store.exists("c1"));
        store.create("c1", base()).unwrap();
        assert!(store.exists("c1"));
        assert_eq!(store.count(), 1);
        store.delete("c1").unwrap();
        assert!(!store.exists("c1"));
    }

    #[test]
    fn test_store_requires_session() {
        let store = MemoryPersistence::new();
        assert!(matches!(
            store.packet_store_qos0("nope", packet(1)),
            Err(PersistenceError::NotFound)
        ));
    }

    #[test]
    fn test_for_each_drains_accepted_only() {
        let store = MemoryPersistence::new();
        store.create("c1", base()).unwrap();
        for b in 1..=3 {
            store.packet_store_qos12("c1", packet(b)).unwrap();
        }

        let mut seen = Vec::new();
        store
            .packets_for_each_qos12("c1", &mut |p| {
                seen.push(p.data[0]);
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
        // 2 was refused and stays
        assert_eq!(store.packet_counts("c1"), (0, 2, 0));

        seen.clear();
        store
            .packets_for_each_qos12("c1", &mut |p| {
                seen.push(p.data[0]);
                true
            })
            .unwrap();
        assert_eq!(seen, vec![2, 3]);
        assert_eq!(store.packet_counts("c1"), (0, 0, 0));
    }

    #[test]
    fn test_load_for_each_cancelled() {
        let store = MemoryPersistence::new();
        store.create("a", base()).unwrap();
        store.create("b", base()).unwrap();
        let cancel = CancellationToken::new();
        let mut ids = Vec::new();
        store
            .load_for_each(&cancel, &mut |id, _| {
                ids.push(id.to_string());
                cancel.cancel();
            })
            .unwrap();
        assert_eq!(ids, vec!["a"]);
    }
}
