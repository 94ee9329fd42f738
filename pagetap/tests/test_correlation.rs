//! Host-side correlator behaviour, exercised through the same state machine
//! the kernel handlers run.

use pagetap_common::correlate::{on_entry, on_exit, EntryOutcome, ExitOutcome};
use pagetap_common::filter::{matches, ThreadIdentity};
use pagetap_common::table::FixedTable;
use pagetap_common::{PendingFault, TargetSpec, ThreadKey, CORRELATOR_CAPACITY};

type Table = FixedTable<{ CORRELATOR_CAPACITY as usize }>;

fn key(tid: u32) -> ThreadKey {
    ThreadKey { pid: 1, tid }
}

fn fault(address: u64) -> PendingFault {
    PendingFault { address, captured_at_ns: 0 }
}

#[test]
fn test_entry_then_exit_yields_page_and_clears_slot() {
    let mut table: Box<Table> = Box::new(FixedTable::new());

    assert_eq!(on_entry(&mut *table, &key(42), &fault(0x1000), false), EntryOutcome::Recorded);
    assert_eq!(table.get(&key(42)).map(|p| p.address), Some(0x1000));

    match on_exit(&mut *table, &key(42), false) {
        ExitOutcome::Matched { page, .. } => assert_eq!(page, 0x1000),
        other => panic!("expected match, got {other:?}"),
    }
    assert!(table.get(&key(42)).is_none());
    assert_eq!(on_exit(&mut *table, &key(42), false), ExitOutcome::Unmatched);
}

#[test]
fn test_retry_entry_leaves_table_unchanged() {
    let mut table: Box<Table> = Box::new(FixedTable::new());
    assert_eq!(on_entry(&mut *table, &key(42), &fault(0x1000), true), EntryOutcome::Retry);
    assert!(table.is_empty());
}

#[test]
fn test_full_table_drops_new_threads_only() {
    let mut table: Box<Table> = Box::new(FixedTable::new());
    let capacity = CORRELATOR_CAPACITY;
    for tid in 0..capacity {
        assert_eq!(
            on_entry(&mut *table, &key(tid), &fault(u64::from(tid) << 12), false),
            EntryOutcome::Recorded
        );
    }

    assert_eq!(on_entry(&mut *table, &key(capacity), &fault(0x9000), false), EntryOutcome::Dropped);
    assert_eq!(table.len(), capacity as usize);
    // an existing thread can still overwrite its own slot
    assert_eq!(on_entry(&mut *table, &key(7), &fault(0xa000), false), EntryOutcome::Recorded);
    assert_eq!(table.get(&key(7)).map(|p| p.address), Some(0xa000));
    assert_eq!(table.get(&key(8)).map(|p| p.address), Some(8 << 12));
}

#[test]
fn test_empty_filter_matches_everything_named_filter_is_exact() {
    let comm = *b"reader\0\0\0\0\0\0\0\0\0\0";
    let identity = ThreadIdentity { pid: 9, comm: &comm, object: None };

    assert!(matches(&identity, &TargetSpec::match_all()));
    assert!(matches(&identity, &TargetSpec::match_all().with_comm(b"reader")));
    assert!(!matches(&identity, &TargetSpec::match_all().with_comm(b"read")));
    assert!(!matches(&identity, &TargetSpec::match_all().with_comm(b"reader2")));
}
