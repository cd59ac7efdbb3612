//! The chunk's entry array: a fixed-capacity word array with atomic
//! single-word and double-word field access.
//!
//! # Layout
//!
//! The array is a sequence of 32-bit words. Word 0 is the head sentinel (a
//! bare `next` pointer); entries follow at a fixed stride of
//! [`FIELDS`] words starting at [`FIRST_ENTRY`]:
//!
//! | word | field |
//! |------|-------|
//! | +0   | `next` — entry index of the successor, 0 terminates |
//! | +1–2 | value reference, read/written/CAS'd as one `u64` |
//! | +3–4 | key reference, read/written as one `u64` |
//! | +5   | padding |
//!
//! With a stride of 6 and the head occupying one word, both 64-bit
//! reference fields of every entry land on even word offsets.
//!
//! # Access widths
//!
//! The backing store is `Box<[AtomicU64]>`, so every even word offset is
//! 8-byte aligned by construction. 64-bit fields map onto exactly one
//! backing word; 32-bit fields (`next`, the head sentinel, padding) are
//! accessed through an `AtomicU32` view of the same allocation. No word is
//! ever accessed at both widths, so no access can tear another.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::refs::{KeyRef, ValueRef};

/// Number of 32-bit words per entry.
pub const FIELDS: usize = 6;

/// Index of the head sentinel (a bare `next` pointer).
pub const HEAD_ENTRY: usize = 0;

/// Index of the first entry slot, directly after the head sentinel.
pub const FIRST_ENTRY: usize = 1;

/// `next` value terminating the linked list. Identical to [`HEAD_ENTRY`];
/// the sentinel is never a list successor.
pub const NONE: usize = 0;

/// Word offset of the `next` field within an entry.
const NEXT_OFFSET: usize = 0;

/// Word offset of the value reference within an entry.
const VALUE_REF_OFFSET: usize = 1;

/// Word offset of the key reference within an entry.
const KEY_REF_OFFSET: usize = 3;

/// Fixed-capacity entry storage shared by all readers and writers of a
/// chunk. All mutation goes through atomics; the array itself never grows.
pub struct EntryArray {
    /// Backing words. Each `AtomicU64` covers two consecutive 32-bit words.
    words: Box<[AtomicU64]>,

    /// Length in 32-bit words.
    len: usize,
}

impl EntryArray {
    /// Allocate a zeroed array able to hold `max_items` entries plus the
    /// head sentinel.
    ///
    /// Zero-fill matters: a fresh array must read as "every `next` is the
    /// terminator and every reference is unset".
    #[must_use]
    pub fn new(max_items: usize) -> Self {
        let len = max_items * FIELDS + FIRST_ENTRY;
        let backing = len.div_ceil(2);
        let words: Box<[AtomicU64]> = (0..backing).map(|_| AtomicU64::new(0)).collect();

        Self { words, len }
    }

    /// Length in 32-bit words.
    #[inline(always)]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 32-bit atomic view of the word at `idx`.
    ///
    /// Module invariant: a given word is only ever accessed through one
    /// width. `next`, head, and padding words go through here; reference
    /// words never do.
    #[inline(always)]
    fn word32(&self, idx: usize) -> &AtomicU32 {
        debug_assert!(idx < self.len, "word index out of bounds");

        let base: *const AtomicU32 = self.words.as_ptr().cast();
        // SAFETY: idx < len <= 2 * words.len(), so the offset stays inside
        // the backing allocation; AtomicU32 is 4-aligned within the 8-aligned
        // AtomicU64 backing; per the module invariant this word is never
        // accessed as part of a 64-bit field.
        unsafe { &*base.add(idx) }
    }

    /// 64-bit atomic word covering offsets `idx` and `idx + 1`.
    #[inline(always)]
    #[expect(
        clippy::indexing_slicing,
        reason = "offsets come from slot arithmetic, bounded by the asserts"
    )]
    fn word64(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx % 2 == 0, "64-bit field at odd word offset");
        debug_assert!(idx + 1 < self.len, "word index out of bounds");

        &self.words[idx / 2]
    }

    // ========================================================================
    //  next field
    // ========================================================================

    /// Read the `next` field of `entry` (or of the head sentinel).
    #[inline(always)]
    #[must_use]
    pub fn next(&self, entry: usize) -> usize {
        self.word32(entry + NEXT_OFFSET).load(READ_ORD) as usize
    }

    /// Plain store of the `next` field.
    ///
    /// Only legal while `entry` is unreachable (freshly allocated, or the
    /// destination of a sorted copy that has not been published).
    #[inline(always)]
    pub fn set_next(&self, entry: usize, next: usize) {
        self.word32(entry + NEXT_OFFSET).store(next as u32, RELAXED);
    }

    /// CAS the `next` field of `entry`. The splice linearization point of
    /// insertion.
    #[inline(always)]
    pub fn cas_next(&self, entry: usize, expected: usize, new: usize) -> bool {
        self.word32(entry + NEXT_OFFSET)
            .compare_exchange(expected as u32, new as u32, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    // ========================================================================
    //  value reference
    // ========================================================================

    /// Atomic read of the value reference.
    #[inline(always)]
    #[must_use]
    pub fn value_ref(&self, entry: usize) -> ValueRef {
        ValueRef::from_raw(self.word64(entry + VALUE_REF_OFFSET).load(READ_ORD))
    }

    /// Atomic store of the value reference.
    ///
    /// Used to initialize a fresh entry to [`ValueRef::DELETED`] before the
    /// key is written; after linkage all changes go through
    /// [`Self::cas_value_ref`].
    #[inline(always)]
    pub fn store_value_ref(&self, entry: usize, value_ref: ValueRef) {
        self.word64(entry + VALUE_REF_OFFSET)
            .store(value_ref.raw(), WRITE_ORD);
    }

    /// CAS the value reference. The attach/detach linearization point.
    #[inline(always)]
    pub fn cas_value_ref(&self, entry: usize, expected: ValueRef, new: ValueRef) -> bool {
        self.word64(entry + VALUE_REF_OFFSET)
            .compare_exchange(expected.raw(), new.raw(), CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    // ========================================================================
    //  key reference
    // ========================================================================

    /// Atomic read of the key reference.
    #[inline(always)]
    #[must_use]
    pub fn key_ref(&self, entry: usize) -> KeyRef {
        KeyRef::from_raw(self.word64(entry + KEY_REF_OFFSET).load(READ_ORD))
    }

    /// Atomic store of the key reference.
    ///
    /// A key reference is written exactly once, before the entry is linked,
    /// and never changes afterwards.
    #[inline(always)]
    pub fn store_key_ref(&self, entry: usize, key_ref: KeyRef) {
        debug_assert!(!self.key_ref(entry).is_valid(), "key reference rewritten");

        self.word64(entry + KEY_REF_OFFSET)
            .store(key_ref.raw(), WRITE_ORD);
    }

    // ========================================================================
    //  bulk copy (sorted compaction)
    // ========================================================================

    /// Copy the reference fields (value + key, not `next`) of one entry from
    /// `src` into `self`.
    ///
    /// Only legal while `self` is unreachable and `src` is frozen.
    #[inline]
    pub fn copy_refs_from(&self, src: &Self, src_entry: usize, dst_entry: usize) {
        let value = src.word64(src_entry + VALUE_REF_OFFSET).load(READ_ORD);
        let key = src.word64(src_entry + KEY_REF_OFFSET).load(READ_ORD);

        self.word64(dst_entry + VALUE_REF_OFFSET).store(value, RELAXED);
        self.word64(dst_entry + KEY_REF_OFFSET).store(key, RELAXED);
    }
}

impl std::fmt::Debug for EntryArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryArray")
            .field("len_words", &self.len)
            .field("capacity_entries", &((self.len - FIRST_ENTRY) / FIELDS))
            .finish()
    }
}
