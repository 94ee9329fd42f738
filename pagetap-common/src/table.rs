//! Host-side fixed-capacity correlator table.
//!
//! Open addressing with linear probing and backward-shift deletion over an
//! inline array of `N` slots. Never allocates and never grows: an insert of a
//! new key into a full table fails, mirroring a `BPF_MAP_TYPE_HASH` with
//! `max_entries = N`.

use crate::correlate::{PendingStore, StoreFull};
use crate::{PendingFault, ThreadKey};

#[derive(Clone, Copy)]
struct Slot {
    used: bool,
    key: ThreadKey,
    value: PendingFault,
}

impl Slot {
    const EMPTY: Slot =
        Slot { used: false, key: ThreadKey { pid: 0, tid: 0 }, value: PendingFault { address: 0, captured_at_ns: 0 } };
}

pub struct FixedTable<const N: usize> {
    slots: [Slot; N],
    len: usize,
}

impl<const N: usize> Default for FixedTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FixedTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: [Slot::EMPTY; N], len: 0 }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn get(&self, key: &ThreadKey) -> Option<&PendingFault> {
        self.find(key).map(|i| &self.slots[i].value)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.slots = [Slot::EMPTY; N];
        self.len = 0;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn home(key: &ThreadKey) -> usize {
        let packed = (u64::from(key.pid) << 32) | u64::from(key.tid);
        // Fibonacci hashing; the high bits are the well-mixed ones.
        let hash = packed.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((hash >> 32) as usize) % N
    }

    fn find(&self, key: &ThreadKey) -> Option<usize> {
        if N == 0 {
            return None;
        }
        let mut idx = Self::home(key);
        for _ in 0..N {
            let slot = &self.slots[idx];
            if !slot.used {
                return None;
            }
            if slot.key == *key {
                return Some(idx);
            }
            idx = (idx + 1) % N;
        }
        None
    }

    fn remove_at(&mut self, mut hole: usize) {
        self.slots[hole].used = false;
        self.len -= 1;

        let mut next = hole;
        loop {
            next = (next + 1) % N;
            if !self.slots[next].used {
                break;
            }
            let home = Self::home(&self.slots[next].key);
            // Move `next` back unless its home lies cyclically in (hole, next].
            let stays = if hole <= next {
                home > hole && home <= next
            } else {
                home > hole || home <= next
            };
            if !stays {
                self.slots[hole] = self.slots[next];
                self.slots[next].used = false;
                hole = next;
            }
        }
    }
}

impl<const N: usize> PendingStore for FixedTable<N> {
    fn put(&mut self, key: &ThreadKey, pending: &PendingFault) -> Result<(), StoreFull> {
        if N == 0 {
            return Err(StoreFull);
        }
        let mut idx = Self::home(key);
        for _ in 0..N {
            let slot = &mut self.slots[idx];
            if slot.used && slot.key == *key {
                slot.value = *pending;
                return Ok(());
            }
            if !slot.used {
                *slot = Slot { used: true, key: *key, value: *pending };
                self.len += 1;
                return Ok(());
            }
            idx = (idx + 1) % N;
        }
        Err(StoreFull)
    }

    fn take(&mut self, key: &ThreadKey) -> Option<PendingFault> {
        let idx = self.find(key)?;
        let value = self.slots[idx].value;
        self.remove_at(idx);
        Some(value)
    }
}
