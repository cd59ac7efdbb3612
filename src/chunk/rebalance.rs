//! Rebalance cooperation: engagement, the marked next-chunk reference,
//! sorted-copy compaction, the trigger heuristic, and deferred chunk
//! reclamation.

use rand::Rng;
use seize::{Collector, Guard, LocalGuard};

use crate::alloc::BlockAllocator;
use crate::codec::{KeyCodec, ValueCodec};
use crate::entries::{FIELDS, FIRST_ENTRY, HEAD_ENTRY, NONE};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::value;

use super::Chunk;

/// Percentage of calls that run the actual [`Chunk::should_rebalance`]
/// check.
const REBALANCE_PROB_PERC: u32 = 30;

/// Rebalance when the sorted prefix covers less than `1/ratio` of the
/// entries.
const SORTED_REBALANCE_RATIO: usize = 2;

/// Rebalance a prefix-less chunk when entries exceed `max_items / factor`.
const MAX_ENTRIES_FACTOR: usize = 2;

/// Rebalance when live items fall under `1/factor` of the occupied entries.
const MAX_IDLE_ENTRIES_FACTOR: usize = 5;

/// Low bit of the `next` pointer: set once the chunk is slated for
/// replacement, after which `next` never changes again.
const NEXT_MARK: usize = 1;

/// Identity token a rebalance run uses to claim chunks.
///
/// The chunk stores only the token's address and never dereferences it; the
/// rebalance driver owns the actual machinery and must keep the token alive
/// until every engaged chunk is released.
#[derive(Debug, Default)]
pub struct Rebalancer {
    _private: (),
}

impl Rebalancer {
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl<K, V, A> Chunk<K, V, A>
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    // ========================================================================
    //  Engagement
    // ========================================================================

    /// Try to claim this chunk for rebalancer `r`. Concurrent engagement
    /// attempts converge deterministically on one winner; check with
    /// [`Chunk::is_engaged`].
    pub fn engage(&self, r: &Rebalancer) {
        let token = std::ptr::from_ref(r).cast_mut();
        let _ = self
            .rebalancer
            .compare_exchange(std::ptr::null_mut(), token, CAS_SUCCESS, CAS_FAILURE);

        #[cfg(feature = "tracing")]
        if self.is_engaged(Some(r)) {
            tracing::debug!(?token, "chunk engaged");
        }
    }

    /// Whether the chunk is engaged with `r`; `None` asks whether it is not
    /// engaged at all.
    #[must_use]
    pub fn is_engaged(&self, r: Option<&Rebalancer>) -> bool {
        let expected = r.map_or(std::ptr::null_mut(), |r| std::ptr::from_ref(r).cast_mut());
        self.rebalancer.load(READ_ORD) == expected
    }

    /// The engaged rebalancer's token, or null.
    #[must_use]
    pub fn engaged_rebalancer(&self) -> *mut Rebalancer {
        self.rebalancer.load(READ_ORD)
    }

    // ========================================================================
    //  Marked next-chunk reference
    // ========================================================================

    #[inline]
    fn pack_next(ptr: *mut Self, marked: bool) -> *mut Self {
        ((ptr as usize) | usize::from(marked)) as *mut Self
    }

    #[inline]
    fn unpack_next(raw: *mut Self) -> (*mut Self, bool) {
        (
            ((raw as usize) & !NEXT_MARK) as *mut Self,
            (raw as usize) & NEXT_MARK != 0,
        )
    }

    /// The successor chunk and whether this chunk is marked deleted.
    #[must_use]
    pub fn next_chunk(&self) -> (*mut Self, bool) {
        Self::unpack_next(self.next.load(READ_ORD))
    }

    /// Swap the successor pointer, failing once the deletion mark is set.
    pub fn cas_next_chunk(&self, expected: *mut Self, new: *mut Self) -> bool {
        debug_assert_eq!(expected as usize & NEXT_MARK, 0);
        debug_assert_eq!(new as usize & NEXT_MARK, 0);

        self.next
            .compare_exchange(expected, new, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Set the deletion mark on the `next` reference and return the
    /// successor it is now pinned to.
    ///
    /// After this returns, `next` can never change again: replacement
    /// chunks splice in relative to a stable successor.
    pub fn mark_and_get_next(&self) -> *mut Self {
        loop {
            let raw = self.next.load(READ_ORD);
            let (ptr, marked) = Self::unpack_next(raw);

            if marked {
                return ptr;
            }
            if self
                .next
                .compare_exchange(raw, Self::pack_next(ptr, true), CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                return ptr;
            }
        }
    }

    // ========================================================================
    //  Trigger heuristic
    // ========================================================================

    /// Probabilistically decide whether this chunk wants a rebalance.
    ///
    /// Samples 30% of callers (per-thread RNG, no shared state), skips
    /// chunks that are already engaged, then fires on any of: a fresh chunk
    /// accumulating too many unsorted entries, a sorted prefix covering
    /// less than half the entries, or too many tombstones among the
    /// occupied slots.
    #[must_use]
    pub fn should_rebalance(&self) -> bool {
        if rand::thread_rng().gen_range(0..100) > REBALANCE_PROB_PERC {
            return false;
        }
        if !self.is_engaged(None) {
            return false;
        }

        let entries = self.entry_index.load(READ_ORD) / FIELDS;
        let sorted_count = self.sorted_count.load(READ_ORD);
        let items = self.statistics.compacted_count().max(0) as usize;

        (sorted_count == 0 && entries * MAX_ENTRIES_FACTOR > self.max_items)
            || (sorted_count > 0 && sorted_count * SORTED_REBALANCE_RATIO < entries)
            || (entries * MAX_IDLE_ENTRIES_FACTOR > self.max_items
                && items * MAX_IDLE_ENTRIES_FACTOR < entries)
    }

    // ========================================================================
    //  Sorted copy
    // ========================================================================

    /// Compact entries from a frozen `src` into this (unpublished) chunk,
    /// sharing key slices rather than copying key bytes.
    ///
    /// Walks `src`'s list from `src_entry`, skipping entries whose value is
    /// detached or header-deleted, and bulk-copies runs of physically
    /// contiguous live entries. Stops when this chunk holds `max_capacity`
    /// entries or the source is exhausted.
    ///
    /// Returns the next unconsumed source entry, or [`NONE`] when the
    /// source was fully consumed. On return this chunk's entries are fully
    /// sorted: `entry_index` and `sorted_count` cover everything copied and
    /// the statistics record the fill size.
    pub fn copy_part_no_keys(&self, src: &Self, src_entry: usize, max_capacity: usize) -> usize {
        if src_entry == HEAD_ENTRY {
            return NONE;
        }

        debug_assert!(src_entry <= src.entries.len() - FIELDS, "source entry out of bounds");

        // single writer on an unpublished chunk: work on plain locals and
        // publish the counters once at the end
        let mut dst = self.entry_index.load(RELAXED);

        let max_idx = max_capacity * FIELDS + FIRST_ENTRY;
        if dst >= max_idx {
            return src_entry;
        }

        // splice the region about to be filled onto the copied prefix
        if dst == FIRST_ENTRY {
            self.entries.set_next(HEAD_ENTRY, FIRST_ENTRY);
        } else {
            self.entries.set_next(dst - FIELDS, dst);
        }

        let mut src_entry = src_entry;
        let mut run_start = src_entry;
        let mut run_len = 0usize;
        let mut src_prev = NONE;
        let mut first_in_run = true;

        loop {
            let value_ref = src.entries.value_ref(src_entry);
            let is_deleted = match src.slice_for(value_ref) {
                None => true,
                Some(slice) => value::is_deleted(&slice),
            };

            // grow the run while the entry is live, capacity remains, and
            // the physical source index stays contiguous
            if !is_deleted
                && dst + run_len * FIELDS < max_idx
                && (first_in_run || src_prev + FIELDS == src_entry)
            {
                run_len += 1;
                first_in_run = false;
                src_prev = src_entry;
                src_entry = src.entries.next(src_entry);
                if src_entry != NONE {
                    continue;
                }
            }

            // flush the run: references move in bulk, next fields are
            // rewritten to consecutive physical order
            for i in 0..run_len {
                let offset = i * FIELDS;
                self.entries.set_next(dst + offset, dst + offset + FIELDS);
                self.entries
                    .copy_refs_from(&src.entries, run_start + offset, dst + offset);
            }
            dst += run_len * FIELDS;

            if is_deleted {
                src_prev = src_entry;
                src_entry = src.entries.next(src_entry);
            }

            if src_entry == NONE || dst >= max_idx {
                break;
            }

            run_start = src_entry;
            run_len = 0;
            first_in_run = true;
        }

        // terminate the list and publish the fill
        let tail = if dst > FIRST_ENTRY { dst - FIELDS } else { HEAD_ENTRY };
        self.entries.set_next(tail, NONE);

        self.entry_index.store(dst, WRITE_ORD);
        let sorted_count = dst / FIELDS;
        self.sorted_count.store(sorted_count, WRITE_ORD);
        self.statistics.update_initial_sorted_count(sorted_count);

        #[cfg(feature = "tracing")]
        tracing::debug!(copied = sorted_count, next_src = src_entry, "sorted copy");

        src_entry
    }
}

/// Seize reclamation callback for a chunk allocated via `Box::into_raw`.
///
/// # Safety
/// `ptr` must come from `Box::into_raw` and be reclaimed exactly once, only
/// after seize determines no reader can still hold it.
unsafe fn reclaim_chunk_boxed<K, V, A>(ptr: *mut Chunk<K, V, A>, _collector: &Collector)
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    // SAFETY: forwarded from the caller.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Defer reclamation of a released chunk until concurrent readers are done.
///
/// # Safety
/// - `chunk` must have been produced by `Box::into_raw`.
/// - The chunk must be `Released` and unreachable by new traversals; only
///   readers pinned before the unlink may still hold it.
/// - `guard` must belong to the collector shared by all of the map's
///   readers.
pub unsafe fn retire_chunk<K, V, A>(chunk: *mut Chunk<K, V, A>, guard: &LocalGuard<'_>)
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    debug_assert!(!chunk.is_null());

    // SAFETY: preconditions forwarded from the caller.
    unsafe { guard.defer_retire(chunk, reclaim_chunk_boxed::<K, V, A>) };
}

#[cfg(test)]
mod tests {
    use super::super::ChunkState;
    use super::super::tests_support::{ascending_keys, put, remove, test_chunk};
    use super::*;
    use std::ptr;

    #[test]
    fn engagement_converges_on_one_winner() {
        let c = test_chunk(8);
        let first = Rebalancer::new();
        let second = Rebalancer::new();

        assert!(c.is_engaged(None));

        c.engage(&first);
        c.engage(&second);

        assert!(c.is_engaged(Some(&first)));
        assert!(!c.is_engaged(Some(&second)));
        assert!(!c.is_engaged(None));
        assert_eq!(
            c.engaged_rebalancer(),
            std::ptr::from_ref(&first).cast_mut()
        );
    }

    #[test]
    fn mark_pins_the_next_pointer() {
        let c = test_chunk(8);
        let successor = Box::into_raw(test_chunk(8));

        assert!(c.cas_next_chunk(ptr::null_mut(), successor));
        assert_eq!(c.next_chunk(), (successor, false));

        assert_eq!(c.mark_and_get_next(), successor);
        assert_eq!(c.next_chunk(), (successor, true));

        // marked: the pointer is pinned
        assert!(!c.cas_next_chunk(successor, ptr::null_mut()));
        assert_eq!(c.mark_and_get_next(), successor);

        // SAFETY: successor came from Box::into_raw above
        drop(unsafe { Box::from_raw(successor) });
    }

    #[test]
    fn copy_skips_deleted_entries_and_sorts() {
        let src = test_chunk(8);
        for k in [1u64, 2, 3, 4, 5] {
            put(&src, k, k * 10);
        }
        remove(&src, &3u64);
        src.freeze();
        assert_eq!(src.state(), ChunkState::Frozen);

        let dst = test_chunk(10);
        let next_src = dst.copy_part_no_keys(&src, src.first_entry(), 10);

        assert_eq!(next_src, NONE);
        assert_eq!(dst.sorted_count(), 4);
        assert_eq!(dst.entry_index(), 4 * FIELDS + FIRST_ENTRY);
        assert_eq!(ascending_keys(&dst), [1, 2, 4, 5]);

        // key slices are shared, not copied
        let src_first = src.first_entry();
        let dst_first = dst.first_entry();
        assert_eq!(src.key_reference(src_first), dst.key_reference(dst_first));
    }

    #[test]
    fn copy_truncates_at_capacity_and_reports_resume_point() {
        let src = test_chunk(8);
        for k in [1u64, 2, 3, 4, 5, 6] {
            put(&src, k, k);
        }
        src.freeze();

        let dst = test_chunk(8);
        let next_src = dst.copy_part_no_keys(&src, src.first_entry(), 4);

        assert_ne!(next_src, NONE);
        assert_eq!(dst.sorted_count(), 4);
        assert_eq!(ascending_keys(&dst), [1, 2, 3, 4]);

        // resume from the reported entry into a second destination
        let rest = test_chunk(8);
        assert_eq!(rest.copy_part_no_keys(&src, next_src, 4), NONE);
        assert_eq!(ascending_keys(&rest), [5, 6]);
        assert_eq!(rest.statistics().initial_sorted_count(), 2);
    }

    #[test]
    fn copy_compacts_non_contiguous_runs() {
        // interleave inserts so list order differs from physical order
        let src = test_chunk(8);
        for k in [40u64, 10, 30, 20] {
            put(&src, k, k);
        }
        src.freeze();

        let dst = test_chunk(8);
        assert_eq!(dst.copy_part_no_keys(&src, src.first_entry(), 8), NONE);
        assert_eq!(ascending_keys(&dst), [10, 20, 30, 40]);
        assert_eq!(dst.sorted_count(), 4);
    }

    #[test]
    fn heuristic_skips_engaged_chunks() {
        let c = test_chunk(4);
        for k in [1u64, 2, 3, 4] {
            put(&c, k, k);
        }
        for k in [1u64, 2, 3] {
            remove(&c, &k);
        }

        // tombstone-heavy and prefix-less: fires whenever the sample hits
        let fires = (0..1000).any(|_| c.should_rebalance());
        assert!(fires);

        let r = Rebalancer::new();
        c.engage(&r);
        assert!((0..1000).all(|_| !c.should_rebalance()));
    }

    #[test]
    fn empty_source_copy_is_a_no_op() {
        let dst = test_chunk(4);

        assert_eq!(dst.copy_part_no_keys(&dst, HEAD_ENTRY, 4), NONE);
        assert_eq!(dst.first_entry(), NONE);
    }
}
