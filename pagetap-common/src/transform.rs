//! Page transform engine.
//!
//! [`interpose`] runs the full cycle mask → read → transform → write and
//! reports each step. Access to the target's memory and to the event stream
//! goes through [`PageAccess`]; the kernel handlers implement it with the
//! user-memory helpers and the `EVENTS` ring buffer.
//!
//! The cycle is **not atomic** with respect to the owning process: another
//! thread of the target may modify the page between the read and the write,
//! and that modification is then overwritten with the transformed stale copy.
//! The interposition is best-effort by nature.

use crate::{PAGE_MASK, PAGE_SIZE};

/// Byte left untouched by [`transform_page`].
pub const SENTINEL: u8 = b'\n';

/// Round `address` down to its containing page.
#[must_use]
pub const fn page_base(address: u64) -> u64 {
    address & PAGE_MASK
}

/// Deterministic byte-wise transform: every byte except [`SENTINEL`] is
/// incremented by one (wrapping).
pub fn transform_page(page: &mut [u8; PAGE_SIZE]) {
    // fixed trip count for the verifier
    let mut i = 0;
    while i < PAGE_SIZE {
        let b = page[i];
        if b != SENTINEL {
            page[i] = b.wrapping_add(1);
        }
        i += 1;
    }
}

/// Step record produced by [`interpose`], in emission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepRecord<'a> {
    /// Page read; carries the bytes as read, before the transform.
    ReadOk(&'a [u8; PAGE_SIZE]),
    /// Read failed with the helper's negative errno; nothing is written.
    ReadFailed(i64),
    Written,
    WriteFailed(i64),
}

/// How a cycle ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interposed {
    Written,
    ReadFailed(i64),
    WriteFailed(i64),
}

/// Target memory plus the event sink for one cycle.
pub trait PageAccess {
    /// Copy the page at `page` out of the target.
    ///
    /// # Errors
    /// Negative errno of the failed read.
    fn read_user(&mut self, page: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<(), i64>;

    /// Copy `buf` back over the page at `page`.
    ///
    /// # Errors
    /// Negative errno of the failed write.
    fn write_user(&mut self, page: u64, buf: &[u8; PAGE_SIZE]) -> Result<(), i64>;

    /// Report one step. Emission is best effort and cannot fail the cycle.
    fn emit(&mut self, page: u64, record: StepRecord<'_>);
}

/// Mask `address` to its page, then read, transform and write it back.
///
/// A failed read emits [`StepRecord::ReadFailed`] and stops: the buffer is
/// neither transformed nor written. Otherwise exactly one `ReadOk` and one
/// `Written`/`WriteFailed` are emitted, in that order.
pub fn interpose<A: PageAccess>(
    access: &mut A,
    address: u64,
    buf: &mut [u8; PAGE_SIZE],
) -> Interposed {
    let page = page_base(address);

    if let Err(errno) = access.read_user(page, buf) {
        access.emit(page, StepRecord::ReadFailed(errno));
        return Interposed::ReadFailed(errno);
    }
    access.emit(page, StepRecord::ReadOk(buf));

    transform_page(buf);

    match access.write_user(page, buf) {
        Ok(()) => {
            access.emit(page, StepRecord::Written);
            Interposed::Written
        }
        Err(errno) => {
            access.emit(page, StepRecord::WriteFailed(errno));
            Interposed::WriteFailed(errno)
        }
    }
}
