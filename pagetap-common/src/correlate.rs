//! Entry/exit correlator.
//!
//! Per-thread state machine with two states: `NoPending` (key absent) and
//! `Pending` (key present). The table behind it is abstracted as a
//! [`PendingStore`] so the kernel hash map and [`crate::table::FixedTable`]
//! share the exact same transitions.
//!
//! ```text
//!            entry (non-retry, overwrites)
//! NoPending ─────────────────────────────▶ Pending
//!     ▲                                      │
//!     └──────────── exit (non-retry) ────────┘
//! ```
//!
//! Retry entries and retry exits never change state.

use crate::{transform::page_base, PendingFault, ThreadKey};

/// Returned by [`PendingStore::put`] when the table is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreFull;

/// Fixed-capacity map from [`ThreadKey`] to [`PendingFault`].
pub trait PendingStore {
    /// Insert or overwrite. Overwriting an existing key must succeed even at capacity.
    ///
    /// # Errors
    /// [`StoreFull`] when `key` is new and the table is full.
    fn put(&mut self, key: &ThreadKey, pending: &PendingFault) -> Result<(), StoreFull>;

    /// Remove and return the entry for `key`.
    fn take(&mut self, key: &ThreadKey) -> Option<PendingFault>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryOutcome {
    /// `NoPending → Pending` (or a stale pending record was overwritten).
    Recorded,
    /// Retry entry, ignored.
    Retry,
    /// Table full; the record was dropped and existing entries are untouched.
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// `Pending → NoPending`. Carries the page base of the stored address.
    Matched { page: u64, pending: PendingFault },
    /// Retry exit, not final; the pending entry is kept.
    Retry,
    /// No pending entry for this thread.
    Unmatched,
}

/// Handle an entry event for `key`. Last entry wins; there is no queueing.
pub fn on_entry<S: PendingStore>(
    store: &mut S,
    key: &ThreadKey,
    pending: &PendingFault,
    retry: bool,
) -> EntryOutcome {
    if retry {
        return EntryOutcome::Retry;
    }
    match store.put(key, pending) {
        Ok(()) => EntryOutcome::Recorded,
        Err(StoreFull) => EntryOutcome::Dropped,
    }
}

/// Handle an exit event for `key`.
pub fn on_exit<S: PendingStore>(store: &mut S, key: &ThreadKey, retry: bool) -> ExitOutcome {
    if retry {
        return ExitOutcome::Retry;
    }
    match store.take(key) {
        Some(pending) => ExitOutcome::Matched { page: page_base(pending.address), pending },
        None => ExitOutcome::Unmatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FixedTable;

    const T42: ThreadKey = ThreadKey { pid: 42, tid: 42 };

    fn fault(address: u64) -> PendingFault {
        PendingFault { address, captured_at_ns: 1 }
    }

    #[test]
    fn entry_then_exit_yields_page_and_clears_key() {
        let mut table = FixedTable::<64>::new();

        assert_eq!(on_entry(&mut table, &T42, &fault(0x1000), false), EntryOutcome::Recorded);
        assert_eq!(table.get(&T42).map(|p| p.address), Some(0x1000));

        match on_exit(&mut table, &T42, false) {
            ExitOutcome::Matched { page, .. } => assert_eq!(page, 0x1000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(table.get(&T42).is_none());
        assert_eq!(on_exit(&mut table, &T42, false), ExitOutcome::Unmatched);
    }

    #[test]
    fn exit_aligns_address_to_page() {
        let mut table = FixedTable::<8>::new();
        on_entry(&mut table, &T42, &fault(0x7fff_1234), false);
        match on_exit(&mut table, &T42, false) {
            ExitOutcome::Matched { page, pending } => {
                assert_eq!(page, 0x7fff_1000);
                assert_eq!(pending.address, 0x7fff_1234);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retry_entry_creates_nothing() {
        let mut table = FixedTable::<8>::new();
        assert_eq!(on_entry(&mut table, &T42, &fault(0x1000), true), EntryOutcome::Retry);
        assert!(table.is_empty());
    }

    #[test]
    fn retry_entry_keeps_existing_pending() {
        let mut table = FixedTable::<8>::new();
        on_entry(&mut table, &T42, &fault(0x1000), false);
        on_entry(&mut table, &T42, &fault(0x9000), true);
        assert_eq!(table.get(&T42).map(|p| p.address), Some(0x1000));
    }

    #[test]
    fn retry_exit_keeps_pending() {
        let mut table = FixedTable::<8>::new();
        on_entry(&mut table, &T42, &fault(0x2000), false);
        assert_eq!(on_exit(&mut table, &T42, true), ExitOutcome::Retry);
        assert_eq!(table.get(&T42).map(|p| p.address), Some(0x2000));
    }

    #[test]
    fn reentry_overwrites_instead_of_queueing() {
        let mut table = FixedTable::<8>::new();
        on_entry(&mut table, &T42, &fault(0x1000), false);
        on_entry(&mut table, &T42, &fault(0x5000), false);
        assert_eq!(table.len(), 1);

        match on_exit(&mut table, &T42, false) {
            ExitOutcome::Matched { page, .. } => assert_eq!(page, 0x5000),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(on_exit(&mut table, &T42, false), ExitOutcome::Unmatched);
    }

    #[test]
    fn overflow_drops_new_key_without_touching_others() {
        let mut table = FixedTable::<4>::new();
        for tid in 0..4 {
            let key = ThreadKey { pid: 1, tid };
            assert_eq!(
                on_entry(&mut table, &key, &fault(u64::from(tid) << 12), false),
                EntryOutcome::Recorded
            );
        }

        let late = ThreadKey { pid: 1, tid: 99 };
        assert_eq!(on_entry(&mut table, &late, &fault(0xdead_0000), false), EntryOutcome::Dropped);
        assert!(table.get(&late).is_none());
        assert_eq!(table.len(), 4);
        for tid in 0..4 {
            let key = ThreadKey { pid: 1, tid };
            assert_eq!(table.get(&key).map(|p| p.address), Some(u64::from(tid) << 12));
        }

        // Overwriting an existing key still succeeds at capacity.
        let key = ThreadKey { pid: 1, tid: 2 };
        assert_eq!(on_entry(&mut table, &key, &fault(0xabc_0000), false), EntryOutcome::Recorded);
    }

    #[test]
    fn keys_with_same_tid_in_other_process_are_distinct() {
        let mut table = FixedTable::<8>::new();
        let a = ThreadKey { pid: 1, tid: 42 };
        let b = ThreadKey { pid: 2, tid: 42 };
        on_entry(&mut table, &a, &fault(0x1000), false);
        on_entry(&mut table, &b, &fault(0x2000), false);
        assert_eq!(table.len(), 2);
        assert!(matches!(on_exit(&mut table, &a, false), ExitOutcome::Matched { page: 0x1000, .. }));
        assert!(matches!(on_exit(&mut table, &b, false), ExitOutcome::Matched { page: 0x2000, .. }));
    }
}
