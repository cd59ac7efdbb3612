//! The chunk: one shard of a concurrent off-heap ordered map.
//!
//! A chunk keeps its keys in sorted order through a lock-free linked list
//! threaded over a flat entry array ([`crate::entries`]). Keys and values
//! live in allocator-owned blocks; entries hold packed 64-bit references to
//! them. Lookup is accelerated by binary search over the *sorted prefix* —
//! the first `sorted_count` slots, which a sorted copy lays out in both key
//! order and physical order. Entries inserted afterwards form an unsorted
//! tail spliced into the list.
//!
//! # Lifecycle
//!
//! ```text
//!   INFANT --normalize--> NORMAL --freeze--> FROZEN --release--> RELEASED
//! ```
//!
//! A chunk created by a rebalance starts `Infant`: reachable only through
//! its creator until the index swap completes. Writers enter through
//! [`Chunk::publish`], which bumps `pending_ops`; [`Chunk::freeze`] flips
//! the state and spins until pending writers drain, after which the entry
//! array is immutable and a rebalancer may copy it.
//!
//! # Concurrency
//!
//! - Insertion linearizes at the CAS of the predecessor's `next` field.
//! - Value attach/detach/replace linearizes at a 64-bit CAS on the value
//!   reference.
//! - Lookup linearizes at the atomic read of the matching entry's value
//!   reference.
//! - `sorted_count` extension is advisory; a lookup that misses an
//!   unextended prefix falls through to the list walk.

pub mod iter;
pub mod link;
pub mod rebalance;

mod find;

#[cfg(all(loom, test))]
mod loom_tests;

pub use find::LookUp;
pub use link::{OpData, Operation};
pub use rebalance::Rebalancer;

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicIsize, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, fence,
};

use crate::alloc::{BlockAllocator, BlockArena, Slice};
use crate::codec::{KeyCodec, ValueCodec};
use crate::entries::{EntryArray, FIELDS, FIRST_ENTRY, HEAD_ENTRY, NONE};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, HANDSHAKE_ORD, READ_ORD, RELAXED, WRITE_ORD};
use crate::refs::{KeyRef, ValueRef};
use crate::stats::Statistics;
use crate::value;

/// Default chunk capacity in entries.
pub const MAX_ITEMS_DEFAULT: usize = 4096;

/// Lifecycle state of a chunk.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Created by a rebalance; externally the index still points at the
    /// parent.
    Infant = 0,

    /// Externally visible, accepting mutations.
    Normal = 1,

    /// Rebalance started; no mutation may begin and in-flight mutations
    /// have drained (or are draining).
    Frozen = 2,

    /// Drained and replaced; awaiting reclamation.
    Released = 3,
}

impl ChunkState {
    #[inline]
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Infant,
            1 => Self::Normal,
            2 => Self::Frozen,
            3 => Self::Released,
            _ => unreachable!("invalid chunk state {raw}"),
        }
    }

    /// Whether writers may still publish into the chunk.
    #[inline]
    #[must_use]
    pub const fn accepts_writers(self) -> bool {
        matches!(self, Self::Infant | Self::Normal)
    }
}

/// One shard of the ordered map. See the module docs for the protocol.
///
/// # Type Parameters
/// * `K` - key type, serialized and compared through [`KeyCodec`]
/// * `V` - value type, serialized through [`ValueCodec`]
/// * `A` - the block allocator (defaults to the in-process [`BlockArena`])
pub struct Chunk<K, V, A = BlockArena>
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    /// The entry array. Word 0 is the head sentinel.
    entries: EntryArray,

    /// Next free word index; bumped by [`FIELDS`] per allocation. May run
    /// past the array end, which readers treat as "full".
    entry_index: AtomicUsize,

    /// Number of physically leading entries known to be in sorted order and
    /// linked consecutively. Monotone outside the sorted-copy fill.
    sorted_count: AtomicUsize,

    /// Serialized lower bound for keys in this chunk, owned by the chunk.
    min_key: Box<[u8]>,

    /// Lifecycle state ([`ChunkState`] as its `u8` repr).
    state: AtomicU8,

    /// Writers currently inside the publish window.
    pending_ops: AtomicU32,

    /// Identity of the engaged rebalancer; null when not engaged. Never
    /// dereferenced by the chunk.
    rebalancer: AtomicPtr<Rebalancer>,

    /// The chunk that created this one during a rebalance; cleared by
    /// [`Chunk::normalize`]. Never dereferenced by the chunk.
    creator: AtomicPtr<Self>,

    /// Successor chunk with the deletion mark in the low bit.
    next: AtomicPtr<Self>,

    statistics: Statistics,

    /// Item count shared with the enclosing map.
    external_size: Arc<AtomicIsize>,

    /// Capacity in entries.
    max_items: usize,

    arena: Arc<A>,

    _marker: PhantomData<(K, V)>,
}

// SAFETY: the raw pointers (`rebalancer`, `creator`, `next`) are identity
// tokens and linkage managed by the enclosing map's reclamation protocol;
// every other field is atomics or immutable data.
unsafe impl<K: KeyCodec, V: ValueCodec, A: BlockAllocator + Send + Sync> Send for Chunk<K, V, A> {}
unsafe impl<K: KeyCodec, V: ValueCodec, A: BlockAllocator + Send + Sync> Sync for Chunk<K, V, A> {}

impl<K, V, A> Chunk<K, V, A>
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    // ========================================================================
    //  Construction
    // ========================================================================

    /// Create a chunk accepting keys at or above `min_key`.
    ///
    /// A null `creator` produces a `Normal` chunk (the map's very first);
    /// otherwise the chunk starts `Infant` and must be normalized once the
    /// index points at it.
    #[must_use]
    pub fn new(
        min_key: Box<[u8]>,
        creator: *mut Self,
        arena: Arc<A>,
        max_items: usize,
        external_size: Arc<AtomicIsize>,
    ) -> Box<Self> {
        let state = if creator.is_null() {
            ChunkState::Normal
        } else {
            ChunkState::Infant
        };

        Box::new(Self {
            entries: EntryArray::new(max_items),
            entry_index: AtomicUsize::new(FIRST_ENTRY),
            sorted_count: AtomicUsize::new(0),
            min_key,
            state: AtomicU8::new(state as u8),
            pending_ops: AtomicU32::new(0),
            rebalancer: AtomicPtr::new(ptr::null_mut()),
            creator: AtomicPtr::new(creator),
            next: AtomicPtr::new(ptr::null_mut()),
            statistics: Statistics::new(),
            external_size,
            max_items,
            arena,
            _marker: PhantomData,
        })
    }

    // ========================================================================
    //  Lifecycle & publish protocol
    // ========================================================================

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ChunkState {
        ChunkState::from_raw(self.state.load(READ_ORD))
    }

    /// The creator back-reference; null once normalized.
    #[inline]
    #[must_use]
    pub fn creator(&self) -> *mut Self {
        self.creator.load(READ_ORD)
    }

    /// Promote an infant chunk to `Normal` and drop the creator link.
    ///
    /// Idempotent: from `Normal` this is a no-op (the CAS loses quietly).
    pub fn normalize(&self) {
        let _ = self.state.compare_exchange(
            ChunkState::Infant as u8,
            ChunkState::Normal as u8,
            CAS_SUCCESS,
            CAS_FAILURE,
        );
        self.creator.store(ptr::null_mut(), WRITE_ORD);
        // make the cleared creator visible before any subsequent writer's
        // stores into this chunk
        fence(WRITE_ORD);

        #[cfg(feature = "tracing")]
        tracing::debug!(max_items = self.max_items, "chunk normalized");
    }

    /// Enter the publish window. Returns false if the chunk is frozen or
    /// released, in which case the writer must retry on a successor chunk
    /// and must not touch this one.
    #[must_use]
    pub fn publish(&self) -> bool {
        self.pending_ops.fetch_add(1, HANDSHAKE_ORD);

        let state = ChunkState::from_raw(self.state.load(HANDSHAKE_ORD));
        if !state.accepts_writers() {
            self.pending_ops.fetch_sub(1, CAS_SUCCESS);
            return false;
        }
        true
    }

    /// Leave the publish window.
    pub fn unpublish(&self) {
        let previous = self.pending_ops.fetch_sub(1, CAS_SUCCESS);
        debug_assert!(previous > 0, "unpublish without a matching publish");
    }

    /// Freeze the chunk: no new mutation can begin, and by return all
    /// in-flight mutations have completed. Idempotent.
    pub fn freeze(&self) {
        self.state.store(ChunkState::Frozen as u8, HANDSHAKE_ORD);

        while self.pending_ops.load(HANDSHAKE_ORD) != 0 {
            std::hint::spin_loop();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            entries = self.entry_index.load(RELAXED) / FIELDS,
            "chunk frozen"
        );
    }

    /// Mark a drained chunk released. Only legal after every consumer has
    /// moved to the replacement chunks.
    pub fn release(&self) {
        let _ = self.state.compare_exchange(
            ChunkState::Frozen as u8,
            ChunkState::Released as u8,
            CAS_SUCCESS,
            CAS_FAILURE,
        );
    }

    /// Writers currently inside the publish window.
    #[must_use]
    pub fn pending_ops(&self) -> u32 {
        self.pending_ops.load(READ_ORD)
    }

    // ========================================================================
    //  Entry access
    // ========================================================================

    /// First entry in list order, or [`NONE`] for an empty chunk.
    #[inline]
    #[must_use]
    pub fn first_entry(&self) -> usize {
        self.entries.next(HEAD_ENTRY)
    }

    /// Successor of `entry` in list order.
    #[inline]
    #[must_use]
    pub fn next_entry(&self, entry: usize) -> usize {
        self.entries.next(entry)
    }

    /// The allocation cursor (in words). `entry_index / FIELDS` bounds the
    /// number of allocated entries.
    #[inline]
    #[must_use]
    pub fn entry_index(&self) -> usize {
        self.entry_index.load(READ_ORD)
    }

    /// Length of the sorted prefix, in entries.
    #[inline]
    #[must_use]
    pub fn sorted_count(&self) -> usize {
        self.sorted_count.load(READ_ORD)
    }

    /// Atomic read of an entry's packed key reference.
    #[inline]
    #[must_use]
    pub fn key_reference(&self, entry: usize) -> KeyRef {
        self.entries.key_ref(entry)
    }

    /// Atomic read of an entry's packed value reference.
    #[inline]
    #[must_use]
    pub fn value_reference(&self, entry: usize) -> ValueRef {
        self.entries.value_ref(entry)
    }

    /// The serialized key of `entry`.
    ///
    /// # Panics
    /// Panics in debug mode if the entry's key was never written.
    #[must_use]
    pub fn read_key(&self, entry: usize) -> &[u8] {
        debug_assert!(entry != NONE, "reading the head sentinel's key");

        let key_ref = self.entries.key_ref(entry);
        debug_assert!(key_ref.is_valid(), "reading an unwritten key");

        let slice = self
            .arena
            .resolve(key_ref.block(), key_ref.position(), key_ref.length());
        // SAFETY: key slices are written before the key reference is
        // published and never mutated afterwards; the arena outlives `self`.
        unsafe { slice.bytes() }
    }

    /// Build a slice from a value reference; `None` when detached.
    #[must_use]
    pub fn slice_for(&self, value_ref: ValueRef) -> Option<Slice> {
        if !value_ref.is_valid() {
            return None;
        }
        Some(
            self.arena
                .resolve(value_ref.block(), value_ref.position(), value_ref.length()),
        )
    }

    /// The value slice currently attached to `entry`; `None` when detached.
    #[must_use]
    pub fn value_slice(&self, entry: usize) -> Option<Slice> {
        self.slice_for(self.entries.value_ref(entry))
    }

    /// Deserialize the value attached to `entry`, reading under the value
    /// header lock. `None` when detached or logically deleted.
    #[must_use]
    pub fn read_value(&self, entry: usize) -> Option<V> {
        let slice = self.value_slice(entry)?;

        let mut out = None;
        match value::compute(&slice, |payload| out = Some(V::deserialize(payload))) {
            value::ValueResult::Success => out,
            _ => None,
        }
    }

    /// Return a detached value's slice to the allocator.
    pub fn release_value(&self, value_ref: ValueRef) {
        if let Some(slice) = self.slice_for(value_ref) {
            self.arena.release(slice);
        }
    }

    /// Return an entry's key slice to the allocator.
    ///
    /// Only sound for keys that never linked (e.g. the loser of an insert
    /// race): linked key slices may be shared with other chunks after a
    /// rebalance and are reclaimed at block level.
    pub fn release_key(&self, entry: usize) {
        let key_ref = self.entries.key_ref(entry);
        debug_assert!(key_ref.is_valid(), "releasing an unwritten key");

        let slice = self
            .arena
            .resolve(key_ref.block(), key_ref.position(), key_ref.length());
        self.arena.release(slice);
    }

    // ========================================================================
    //  Boundary keys
    // ========================================================================

    /// The chunk's lower-bound key, fixed at construction.
    #[must_use]
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Serialized key of the first entry in list order, or `None` when
    /// empty.
    #[must_use]
    pub fn read_min_key(&self) -> Option<&[u8]> {
        let first = self.first_entry();
        if first == NONE {
            return None;
        }
        Some(self.read_key(first))
    }

    /// Serialized key of the last entry in list order, or `None` when
    /// empty.
    #[must_use]
    pub fn read_max_key(&self) -> Option<&[u8]> {
        let last = self.last_entry();
        if last == HEAD_ENTRY {
            return None;
        }
        Some(self.read_key(last))
    }

    /// Last entry in list order, starting the walk at the end of the sorted
    /// prefix. Returns [`HEAD_ENTRY`] for an empty chunk.
    fn last_entry(&self) -> usize {
        let sorted = self.sorted_count.load(READ_ORD);
        let mut entry = if sorted == 0 {
            HEAD_ENTRY
        } else {
            (sorted - 1) * FIELDS + FIRST_ENTRY
        };

        let mut next = self.entries.next(entry);
        while next != NONE {
            entry = next;
            next = self.entries.next(entry);
        }
        entry
    }

    // ========================================================================
    //  Introspection
    // ========================================================================

    /// Capacity in entries.
    #[inline]
    #[must_use]
    pub const fn max_items(&self) -> usize {
        self.max_items
    }

    /// Utilization counters.
    #[inline]
    #[must_use]
    pub const fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// The block allocator backing this chunk.
    #[inline]
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.arena
    }
}

impl<K, V, A> std::fmt::Debug for Chunk<K, V, A>
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("state", &self.state())
            .field("max_items", &self.max_items)
            .field("entries", &(self.entry_index.load(RELAXED) / FIELDS))
            .field("sorted_count", &self.sorted_count.load(RELAXED))
            .field("pending_ops", &self.pending_ops.load(RELAXED))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! Shared helpers for the chunk unit tests: a `u64 -> u64` chunk plus
    //! the full publish/allocate/link/attach put flow the enclosing map
    //! would drive.

    use super::*;

    pub(crate) fn test_chunk(max_items: usize) -> Box<Chunk<u64, u64>> {
        Chunk::new(
            Box::new([]),
            ptr::null_mut(),
            Arc::new(BlockArena::new(1 << 16, 512)),
            max_items,
            Arc::new(AtomicIsize::new(0)),
        )
    }

    /// Full put flow. Returns false when the chunk rejects the writer or is
    /// out of capacity.
    pub(crate) fn try_put(chunk: &Chunk<u64, u64>, key: u64, value: u64) -> bool {
        if !chunk.publish() {
            return false;
        }

        let Some(allocated) = chunk.allocate_entry_and_key(&key) else {
            chunk.unpublish();
            return false;
        };
        let entry = chunk.link_entry(allocated, &key);

        let value_ref = chunk.write_value(&value).expect("value allocation");
        let mut expected = chunk.value_reference(entry);
        loop {
            let mut op = OpData::new(Operation::Put, entry, value_ref, expected, None);
            if chunk.point_to_value(&mut op) {
                break;
            }
            // put restarts with whatever is attached now
            expected = chunk.value_reference(entry);
        }

        chunk.unpublish();
        true
    }

    pub(crate) fn put(chunk: &Chunk<u64, u64>, key: u64, value: u64) {
        assert!(try_put(chunk, key, value), "put failed");
    }

    /// Detach `key`'s value. Returns false when the key has no live value.
    pub(crate) fn remove(chunk: &Chunk<u64, u64>, key: &u64) -> bool {
        if !chunk.publish() {
            return false;
        }

        let removed = match chunk.lookup(key) {
            Some(found) if found.value_slice.is_some() => {
                let mut op = OpData::new(
                    Operation::Remove,
                    found.entry_index,
                    crate::refs::ValueRef::DELETED,
                    found.value_ref,
                    None,
                );
                chunk.point_to_value(&mut op)
            }
            _ => false,
        };

        chunk.unpublish();
        removed
    }

    pub(crate) fn ascending_keys(chunk: &Chunk<u64, u64>) -> Vec<u64> {
        chunk
            .ascending_iter()
            .map(|entry| <u64 as KeyCodec>::deserialize(chunk.read_key(entry)))
            .collect()
    }

    pub(crate) fn descending_keys(chunk: &Chunk<u64, u64>) -> Vec<u64> {
        chunk
            .descending_iter()
            .map(|entry| <u64 as KeyCodec>::deserialize(chunk.read_key(entry)))
            .collect()
    }
}
