//! Connection admission control.
//!
//! Grounded in the original `ConnectionManager` (`asyncio.Lock` guarding a
//! `set`) and the teacher's `DashMap`-based per-entity registries; ported
//! here as a `tokio::sync::Mutex<HashSet<u64>>` guarding a plain counter
//! cap, since admission only needs identity + a count, not a full registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A unique, process-local handle identifying an admitted connection.
pub type SlotId = u64;

pub struct ConnectionManager {
    max: usize,
    active: Mutex<HashSet<SlotId>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max: max_connections.max(1),
            active: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attempt to admit a connection. Must be called before the socket is
    /// accepted. Returns the slot id on success.
    pub fn try_admit(&self) -> Option<SlotId> {
        let mut active = self.active.lock().expect("admission lock poisoned");
        if active.len() >= self.max {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        active.insert(id);
        Some(id)
    }

    pub fn release(&self, slot: SlotId) {
        self.active
            .lock()
            .expect("admission lock poisoned")
            .remove(&slot);
    }

    pub fn count(&self) -> usize {
        self.active.lock().expect("admission lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_rejects() {
        let mgr = ConnectionManager::new(2);
        let a = mgr.try_admit().expect("first admit");
        let b = mgr.try_admit().expect("second admit");
        assert!(mgr.try_admit().is_none());
        assert_eq!(mgr.count(), 2);

        mgr.release(a);
        assert_eq!(mgr.count(), 1);
        assert!(mgr.try_admit().is_some());
        mgr.release(b);
    }

    #[test]
    fn release_is_idempotent() {
        let mgr = ConnectionManager::new(1);
        let a = mgr.try_admit().unwrap();
        mgr.release(a);
        mgr.release(a);
        assert_eq!(mgr.count(), 0);
    }
}
