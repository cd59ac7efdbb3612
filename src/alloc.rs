//! Block-pool allocation for off-heap key and value slices.
//!
//! The chunk never owns the bytes it indexes. Keys and values live in
//! fixed-size blocks managed by a [`BlockAllocator`]; entries hold packed
//! `(block, length, position)` references ([`crate::refs`]) and resolve them
//! back to memory on demand. Block id 0 is reserved as the invalid id.
//!
//! [`BlockArena`] is the reference implementation: bump allocation inside
//! heap-backed blocks, release tracking, and a [`seize::Collector`] for
//! deferring structure reclamation until no reader can hold a stale
//! pointer. Slices handed out by the arena stay valid until the arena is
//! dropped; `release` only records the bytes for accounting and later
//! block-level reuse.
//!
//! # Alignment
//!
//! Blocks are allocated as `u64` arrays and every slice start is rounded up
//! to 8 bytes, so value headers (an `AtomicU32` at slice start) and 64-bit
//! reads are always aligned.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use parking_lot::Mutex;
use seize::{Collector, LocalGuard};

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::refs::{INVALID_BLOCK_ID, MAX_VALUE_BLOCK_ID};

/// Slice starts are rounded up to this boundary.
pub const SLICE_ALIGN: usize = 8;

/// Default block size for [`BlockArena::default`].
pub const BLOCK_SIZE_DEFAULT: usize = 1 << 20;

/// A non-owning handle to a contiguous byte range inside a block.
///
/// Copyable and freely shareable; the backing memory is owned by the
/// allocator and outlives every chunk that references it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice {
    block_id: u32,
    position: u32,
    length: u32,
    ptr: NonNull<u8>,
}

// SAFETY: a Slice is an address plus coordinates. All mutation of the
// addressed bytes is synchronized externally (value-header lock, or
// exclusive access before an entry is published).
unsafe impl Send for Slice {}
unsafe impl Sync for Slice {}

impl Slice {
    /// Block id this slice lives in (never [`INVALID_BLOCK_ID`]).
    #[inline(always)]
    #[must_use]
    pub const fn block_id(&self) -> u32 {
        self.block_id
    }

    /// Byte position inside the block.
    #[inline(always)]
    #[must_use]
    pub const fn position(&self) -> u32 {
        self.position
    }

    /// Length in bytes.
    #[inline(always)]
    #[must_use]
    pub const fn length(&self) -> u32 {
        self.length
    }

    /// Raw pointer to the first byte.
    #[inline(always)]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the slice as bytes.
    ///
    /// The returned lifetime is unbounded; the caller must not let it
    /// outlive the allocator.
    ///
    /// # Safety
    /// No thread may mutate the range for the duration of the borrow. Key
    /// slices are immutable after publication; value bytes require the
    /// header lock or a frozen chunk.
    #[inline]
    #[must_use]
    pub unsafe fn bytes<'a>(&self) -> &'a [u8] {
        // SAFETY: ptr/length describe an allocation owned by the arena;
        // immutability for the borrow is the caller's obligation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.length as usize) }
    }

    /// View the slice as mutable bytes.
    ///
    /// # Safety
    /// The caller must have exclusive access to the range: either the slice
    /// was just allocated and is not yet referenced by any entry, or the
    /// caller holds the value-header lock.
    #[inline]
    #[must_use]
    pub unsafe fn bytes_mut<'a>(&self) -> &'a mut [u8] {
        // SAFETY: exclusivity is the caller's obligation; ptr/length are
        // valid for the arena's lifetime.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.length as usize) }
    }
}

/// Contract the chunk consumes from the enclosing store's memory manager.
pub trait BlockAllocator {
    /// Allocate `len` bytes, returning a slice whose start is
    /// [`SLICE_ALIGN`]-aligned.
    fn allocate(&self, len: usize) -> Result<Slice, AllocError>;

    /// Return a slice to the allocator. Bytes become reusable only at
    /// block-level reclamation, never while a reader may still resolve
    /// them.
    fn release(&self, slice: Slice);

    /// Resolve reference coordinates back to memory.
    ///
    /// # Panics
    /// Panics if the coordinates do not name an allocated range; a
    /// dangling reference is a bug, not a recoverable condition.
    fn resolve(&self, block_id: u32, position: u32, length: u32) -> Slice;
}

/// Allocation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The request can never fit a block.
    RequestTooLarge {
        /// Requested length in bytes.
        requested: usize,
        /// Fixed block capacity.
        block_size: usize,
    },

    /// The pool is at its block limit.
    BlocksExhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestTooLarge { requested, block_size } => {
                write!(f, "slice of {requested} bytes exceeds block size {block_size}")
            }

            Self::BlocksExhausted => write!(f, "block pool exhausted"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Allocation cursor: index of the current block and the bump offset
/// inside it. Only the mutex-holding allocator touches it.
struct BumpCursor {
    /// Blocks published so far.
    count: usize,

    /// Bytes bumped in the newest block.
    used: usize,
}

/// Reference block-pool implementation.
///
/// The block table is append-only: allocation bumps a cursor under a mutex
/// and publishes new block bases with a release store, while `resolve` (the
/// read path under every key access) only does an acquire load — readers
/// never take the lock. Holds the [`Collector`] used to defer chunk
/// reclamation until concurrent readers have moved on.
pub struct BlockArena {
    block_size: usize,

    /// Base pointer per block id, filled append-only. Null = not yet
    /// allocated. Each base comes from `Box::<[u64]>::into_raw`, freed on
    /// drop.
    table: Box<[AtomicPtr<u8>]>,

    cursor: Mutex<BumpCursor>,
    released_bytes: AtomicUsize,
    collector: Collector,
}

// SAFETY: the raw block pointers are owned by the arena; the table is
// append-only with release/acquire publication and slice contents are
// synchronized by the callers (see Slice).
unsafe impl Send for BlockArena {}
unsafe impl Sync for BlockArena {}

impl BlockArena {
    /// Create an arena of up to `max_blocks` blocks of `block_size` bytes.
    #[must_use]
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        assert!(block_size >= SLICE_ALIGN, "block size below slice alignment");
        assert!(
            block_size % SLICE_ALIGN == 0,
            "block size must be a multiple of the slice alignment"
        );

        Self {
            block_size,
            table: (0..max_blocks)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            cursor: Mutex::new(BumpCursor { count: 0, used: 0 }),
            released_bytes: AtomicUsize::new(0),
            collector: Collector::new(),
        }
    }

    /// Base pointer of a published block.
    ///
    /// # Panics
    /// Panics when `block_id` does not name an allocated block.
    fn block_base(&self, block_id: u32) -> NonNull<u8> {
        assert!(block_id != INVALID_BLOCK_ID, "resolving the invalid block id");

        let slot = self
            .table
            .get(block_id as usize - 1)
            .unwrap_or_else(|| panic!("block id {block_id} out of range"));

        NonNull::new(slot.load(READ_ORD))
            .unwrap_or_else(|| panic!("block id {block_id} not allocated"))
    }

    /// Pin the current thread, protecting loads of retired structures.
    #[must_use]
    pub fn pin(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// The collector backing deferred reclamation.
    #[must_use]
    pub const fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Bytes handed back via `release` so far.
    #[must_use]
    pub fn released_bytes(&self) -> usize {
        self.released_bytes.load(RELAXED)
    }
}

impl Default for BlockArena {
    /// An arena sized so every block id fits a value reference.
    fn default() -> Self {
        Self::new(BLOCK_SIZE_DEFAULT, MAX_VALUE_BLOCK_ID as usize)
    }
}

impl BlockAllocator for BlockArena {
    #[expect(
        clippy::indexing_slicing,
        reason = "cursor.count < table.len() is checked before the store"
    )]
    fn allocate(&self, len: usize) -> Result<Slice, AllocError> {
        let reserve = len.div_ceil(SLICE_ALIGN) * SLICE_ALIGN;
        if reserve > self.block_size {
            return Err(AllocError::RequestTooLarge {
                requested: len,
                block_size: self.block_size,
            });
        }
        let mut cursor = self.cursor.lock();

        if cursor.count == 0 || cursor.used + reserve > self.block_size {
            if cursor.count == self.table.len() {
                return Err(AllocError::BlocksExhausted);
            }

            let boxed: Box<[u64]> = vec![0u64; self.block_size / 8].into_boxed_slice();
            let base = Box::into_raw(boxed).cast::<u8>();
            self.table[cursor.count].store(base, WRITE_ORD);
            cursor.count += 1;
            cursor.used = 0;
        }

        let block_id = cursor.count as u32;
        debug_assert!(block_id != INVALID_BLOCK_ID);

        let position = cursor.used;
        cursor.used += reserve;

        let base = self.block_base(block_id);
        // SAFETY: position + reserve <= block_size, within the allocation.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(position)) };

        Ok(Slice {
            block_id,
            position: position as u32,
            length: len as u32,
            ptr,
        })
    }

    fn release(&self, slice: Slice) {
        let reserved = (slice.length as usize).div_ceil(SLICE_ALIGN) * SLICE_ALIGN;
        self.released_bytes.fetch_add(reserved, RELAXED);
    }

    fn resolve(&self, block_id: u32, position: u32, length: u32) -> Slice {
        assert!(
            position as usize + length as usize <= self.block_size,
            "reference past the capacity of block {block_id}"
        );

        let base = self.block_base(block_id);
        // SAFETY: position + length <= block_size, within the allocation.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(position as usize)) };

        Slice {
            block_id,
            position,
            length,
            ptr,
        }
    }
}

impl Drop for BlockArena {
    fn drop(&mut self) {
        for slot in &self.table {
            let base = slot.load(READ_ORD);
            if base.is_null() {
                continue;
            }
            let slice_ptr =
                std::ptr::slice_from_raw_parts_mut(base.cast::<u64>(), self.block_size / 8);
            // SAFETY: base came from Box::<[u64]>::into_raw in allocate and
            // is freed exactly once, here.
            drop(unsafe { Box::from_raw(slice_ptr) });
        }
    }
}

impl fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockArena")
            .field("block_size", &self.block_size)
            .field("blocks", &self.cursor.lock().count)
            .field("released_bytes", &self.released_bytes())
            .finish()
    }
}
