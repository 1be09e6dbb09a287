//! Allocation tracking for host-function registrations.
//!
//! Every guest allocation a host function touches while decoding parameters
//! or encoding results is recorded here until the end of the call frees it.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Thread-safe map of guest offset to allocated size, plus the running
/// total of live bytes.
///
/// One tracker belongs to one host-function registration. The engine may
/// run several calls of the same registration at once, so every operation
/// takes the internal lock.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    entries: HashMap<u32, u32>,
    total: u64,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `size` bytes at `offset`. Storing an offset again replaces
    /// its previous size.
    pub fn store(&self, offset: u32, size: u32) {
        let mut state = self.state.lock();
        if let Some(previous) = state.entries.insert(offset, size) {
            state.total -= previous as u64;
        }
        state.total += size as u64;
    }

    pub fn load(&self, offset: u32) -> Option<u32> {
        self.state.lock().entries.get(&offset).copied()
    }

    /// Forgets `offset`. Unknown offsets are ignored so that cleanup paths
    /// may release the same region more than once.
    pub fn delete(&self, offset: u32) -> Option<u32> {
        let mut state = self.state.lock();
        let removed = state.entries.remove(&offset);
        if let Some(size) = removed {
            state.total -= size as u64;
        }
        removed
    }

    /// Live bytes across all entries. Diagnostics only.
    pub fn total_size(&self) -> u64 {
        self.state.lock().total
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Snapshot of the tracked offsets, in no particular order.
    pub fn offsets(&self) -> Vec<u32> {
        self.state.lock().entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_is_idempotent() {
        let tracker = AllocationTracker::new();
        tracker.store(5, 100);
        tracker.store(9, 200);
        tracker.delete(5);
        assert_eq!(tracker.total_size(), 200);

        assert_eq!(tracker.delete(5), None);
        assert_eq!(tracker.total_size(), 200);
        assert_eq!(tracker.load(9), Some(200));
        assert_eq!(tracker.load(5), None);
    }

    #[test]
    fn overwrite_replaces_the_previous_size() {
        let tracker = AllocationTracker::new();
        tracker.store(16, 8);
        tracker.store(16, 32);
        assert_eq!(tracker.total_size(), 32);
        assert_eq!(tracker.len(), 1);

        tracker.delete(16);
        assert!(tracker.is_empty());
        assert_eq!(tracker.total_size(), 0);
    }

    #[test]
    fn concurrent_store_and_delete_balance_out() {
        let tracker = AllocationTracker::new();
        std::thread::scope(|s| {
            for worker in 0..8u32 {
                let tracker = &tracker;
                s.spawn(move || {
                    for i in 0..1_000u32 {
                        let offset = worker * 1_000_000 + i * 8;
                        tracker.store(offset, 8);
                        assert_eq!(tracker.load(offset), Some(8));
                        tracker.delete(offset);
                    }
                });
            }
        });
        assert!(tracker.is_empty());
        assert_eq!(tracker.total_size(), 0);
    }
}
