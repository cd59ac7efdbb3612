//! The value header: a per-value lock word at the start of every value
//! slice.
//!
//! Every value slice begins with a fixed [`HEADER_SIZE`] header whose first
//! word is an atomic lock/flag state. The chunk treats the header as an
//! opaque protocol with three outcomes ([`ValueResult`]): in-place compute
//! either succeeds, observes a logically deleted value, or must be retried
//! because the value is being relocated.
//!
//! # States
//!
//! ```text
//!   FREE <--> LOCKED --> DELETED (terminal)
//!                   \--> MOVED   (terminal, value relocated by rebalance)
//! ```
//!
//! Logical deletion through the header exists alongside value-reference
//! detach: a compactor must respect deletes that landed between its read of
//! the reference and its read of the bytes, which only the header can tell
//! it.

use std::sync::atomic::AtomicU32;

use crate::alloc::Slice;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, WRITE_ORD};

/// Bytes reserved at the start of every value slice: the lock word plus
/// padding that keeps the payload 8-byte aligned.
pub const HEADER_SIZE: usize = 8;

/// Header is unlocked.
const FREE: u32 = 0;

/// Header is locked by a writer.
const LOCKED: u32 = 1;

/// Value is logically deleted.
const DELETED: u32 = 2;

/// Value has been relocated by a rebalance; the reader must retry through
/// the new chunk.
const MOVED: u32 = 3;

/// Outcome of a header-protocol operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueResult {
    /// The operation was applied.
    Success,

    /// The value is logically deleted.
    Deleted,

    /// The value moved; retry through the current chunk index.
    Retry,
}

#[inline(always)]
fn header(slice: &Slice) -> &AtomicU32 {
    debug_assert!(slice.length() as usize >= HEADER_SIZE, "slice too short for a header");
    debug_assert_eq!(slice.as_ptr() as usize % HEADER_SIZE, 0, "unaligned value slice");

    // SAFETY: the allocator aligns slice starts to 8 bytes and the slice is
    // at least HEADER_SIZE long; the word is only ever accessed atomically.
    unsafe { &*slice.as_ptr().cast::<AtomicU32>() }
}

/// Initialize the header of a freshly allocated value slice to unlocked.
///
/// Must happen before the slice's reference is attached to any entry.
#[inline]
pub fn init_header(slice: &Slice) {
    header(slice).store(FREE, WRITE_ORD);
}

/// Whether the value is logically deleted.
#[inline]
#[must_use]
pub fn is_deleted(slice: &Slice) -> bool {
    header(slice).load(READ_ORD) == DELETED
}

/// Acquire the header lock, spinning past transient writers.
fn lock(slice: &Slice) -> ValueResult {
    let header = header(slice);

    loop {
        match header.compare_exchange(FREE, LOCKED, CAS_SUCCESS, CAS_FAILURE) {
            Ok(_) => return ValueResult::Success,

            Err(DELETED) => return ValueResult::Deleted,

            Err(MOVED) => return ValueResult::Retry,

            Err(_) => std::hint::spin_loop(),
        }
    }
}

#[inline]
fn unlock(slice: &Slice) {
    debug_assert_eq!(header(slice).load(READ_ORD), LOCKED);

    header(slice).store(FREE, WRITE_ORD);
}

/// Apply `f` to the value payload under the header lock.
///
/// `f` sees the bytes after the header. Returns [`ValueResult::Deleted`] or
/// [`ValueResult::Retry`] without calling `f` when the value is gone.
#[expect(
    clippy::indexing_slicing,
    reason = "every value slice is at least HEADER_SIZE long"
)]
pub fn compute<F>(slice: &Slice, f: F) -> ValueResult
where
    F: FnOnce(&mut [u8]),
{
    match lock(slice) {
        ValueResult::Success => {}
        other => return other,
    }

    // SAFETY: the header lock grants exclusive access to the payload.
    let bytes = unsafe { slice.bytes_mut() };
    f(&mut bytes[HEADER_SIZE..]);

    unlock(slice);
    ValueResult::Success
}

/// Logically delete the value through its header.
///
/// Returns [`ValueResult::Deleted`] if another thread already deleted it.
pub fn logical_delete(slice: &Slice) -> ValueResult {
    match lock(slice) {
        ValueResult::Success => {}
        other => return other,
    }

    header(slice).store(DELETED, WRITE_ORD);
    ValueResult::Success
}

/// Mark the value as relocated. Called by the compactor on the source copy
/// after the destination copy is reachable.
pub fn mark_moved(slice: &Slice) -> ValueResult {
    match lock(slice) {
        ValueResult::Success => {}
        other => return other,
    }

    header(slice).store(MOVED, WRITE_ORD);
    ValueResult::Success
}

/// Read the value payload (the bytes after the header).
///
/// # Safety
/// No thread may mutate the payload for the duration of the borrow: the
/// caller holds the header lock, the chunk is frozen, or the access is a
/// racy-read the caller's consistency model tolerates.
#[inline]
#[must_use]
#[expect(
    clippy::indexing_slicing,
    reason = "every value slice is at least HEADER_SIZE long"
)]
pub unsafe fn payload<'a>(slice: &Slice) -> &'a [u8] {
    // SAFETY: forwarded to the caller.
    unsafe { &slice.bytes()[HEADER_SIZE..] }
}
