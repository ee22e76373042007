//! Outbound flow window.
//!
//! Hands out packet identifiers for QoS 1/2 deliveries and tracks the send
//! quota negotiated with the client (its Receive Maximum).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::types::MAX_PACKET_ID;

/// Bounded allocator of in-flight packet identifiers.
pub struct FlowWindow {
    /// Goes negative when restored packets outnumber the negotiated quota.
    quota: AtomicI32,
    ids: Mutex<Ids>,
}

struct Ids {
    in_use: HashSet<u16>,
    next: u16,
}

impl FlowWindow {
    /// Create a window allowing `quota` outstanding deliveries.
    pub fn new(quota: u16) -> Self {
        Self {
            quota: AtomicI32::new(i32::from(quota.max(1))),
            ids: Mutex::new(Ids {
                in_use: HashSet::new(),
                next: 1,
            }),
        }
    }

    /// Whether a new identifier can be acquired.
    pub fn quota_available(&self) -> bool {
        self.quota.load(Ordering::Acquire) > 0
    }

    /// Remaining quota.
    pub fn quota(&self) -> u32 {
        self.quota.load(Ordering::Acquire).max(0) as u32
    }

    /// Acquire a fresh identifier, consuming one unit of quota.
    pub fn acquire(&self) -> Option<u16> {
        if !self.take_quota() {
            return None;
        }
        let mut ids = self.ids.lock();
        if ids.in_use.len() >= usize::from(MAX_PACKET_ID) {
            drop(ids);
            self.quota.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        loop {
            let id = ids.next;
            ids.next = if id == MAX_PACKET_ID { 1 } else { id + 1 };
            if ids.in_use.insert(id) {
                return Some(id);
            }
        }
    }

    /// Re-claim an identifier restored from persistence.
    ///
    /// Consumes quota even past zero; restored packets must keep their
    /// identifiers. Returns false if `id` is already taken.
    pub fn re_acquire(&self, id: u16) -> bool {
        if id == 0 || !self.ids.lock().in_use.insert(id) {
            return false;
        }
        self.quota.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Release an identifier after its acknowledgment, returning one unit of quota.
    pub fn release(&self, id: u16) -> bool {
        if !self.ids.lock().in_use.remove(&id) {
            return false;
        }
        self.quota.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Number of identifiers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.ids.lock().in_use.len()
    }

    fn take_quota(&self) -> bool {
        self.quota
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| (q > 0).then(|| q - 1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_release() {
        let flow = FlowWindow::new(2);
        let a = flow.acquire().unwrap();
        let b = flow.acquire().unwrap();
        assert_ne!(a, b);
        assert!(!flow.quota_available());
        assert!(flow.acquire().is_none());

        assert!(flow.release(a));
        assert!(flow.quota_available());
        assert!(flow.acquire().is_some());
        assert!(flow.acquire().is_none());
    }

    #[test]
    fn test_release_unknown_id() {
        let flow = FlowWindow::new(1);
        assert!(!flow.release(42));
        assert_eq!(flow.quota(), 1);
    }

    #[test]
    fn test_re_acquire_blocks_reuse() {
        let flow = FlowWindow::new(10);
        assert!(flow.re_acquire(1));
        assert!(flow.re_acquire(2));
        assert!(!flow.re_acquire(2));
        assert_eq!(flow.acquire(), Some(3));
        assert_eq!(flow.in_flight(), 3);
    }

    #[test]
    fn test_re_acquire_beyond_quota() {
        let flow = FlowWindow::new(1);
        assert!(flow.re_acquire(5));
        assert!(flow.re_acquire(6));
        assert_eq!(flow.quota(), 0);
        assert!(flow.acquire().is_none());
        flow.release(5);
        assert!(!flow.quota_available());
        flow.release(6);
        assert!(flow.quota_available());
        assert_eq!(flow.quota(), 1);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let flow = std::sync::Arc::new(FlowWindow::new(8));
        let (tx, rx) = std::sync::mpsc::channel();

        let producer = {
            let flow = flow.clone();
            std::thread::spawn(move || {
                let mut sent = 0;
                while sent < 10_000 {
                    if let Some(id) = flow.acquire() {
                        tx.send(id).unwrap();
                        sent += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };
        for id in rx.iter().take(10_000) {
            assert!(flow.release(id));
        }
        producer.join().unwrap();

        assert_eq!(flow.in_flight(), 0);
        assert_eq!(flow.quota(), 8);
    }
}
