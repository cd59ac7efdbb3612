//! Insertion and value attachment: allocate an entry, write the key out of
//! band, splice into the sorted linked list, then attach/replace/detach the
//! value by CAS on the packed value reference.

use std::cmp::Ordering;

use crate::alloc::BlockAllocator;
use crate::codec::{KeyCodec, ValueCodec};
use crate::entries::{FIELDS, FIRST_ENTRY, NONE};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED};
use crate::refs::{INVALID_BLOCK_ID, KeyRef, ValueRef};
use crate::value::{self, HEADER_SIZE, ValueResult};

use super::Chunk;

/// The mutation kinds [`Chunk::point_to_value`] dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// No semantic operation; used by helpers that only need the CAS.
    NoOp,

    /// Unconditional put. On interference the caller restarts.
    Put,

    /// Put only if no value is attached.
    PutIfAbsent,

    /// In-place compute on the existing value, or attach if absent.
    Compute,

    /// Detach the value.
    Remove,
}

/// Everything [`Chunk::point_to_value`] needs to attach, replace, or detach
/// one entry's value.
pub struct OpData<'a> {
    /// What the caller is trying to do.
    pub op: Operation,

    /// The target entry.
    pub entry_index: usize,

    /// The reference to install. [`ValueRef::DELETED`] for removals.
    pub new_value_ref: ValueRef,

    /// The reference the caller expects to replace. Updated internally when
    /// helping resolves an interleaved detach.
    pub old_value_ref: ValueRef,

    /// In-place computation for [`Operation::Compute`], applied to the
    /// value payload under the header lock.
    pub computer: Option<&'a dyn Fn(&mut [u8])>,
}

impl<'a> OpData<'a> {
    #[must_use]
    pub fn new(
        op: Operation,
        entry_index: usize,
        new_value_ref: ValueRef,
        old_value_ref: ValueRef,
        computer: Option<&'a dyn Fn(&mut [u8])>,
    ) -> Self {
        debug_assert!(
            op != Operation::Compute || computer.is_some(),
            "compute operation without a computer"
        );

        Self {
            op,
            entry_index,
            new_value_ref,
            old_value_ref,
            computer,
        }
    }
}

impl std::fmt::Debug for OpData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpData")
            .field("op", &self.op)
            .field("entry_index", &self.entry_index)
            .field("new_value_ref", &self.new_value_ref)
            .field("old_value_ref", &self.old_value_ref)
            .field("has_computer", &self.computer.is_some())
            .finish()
    }
}

impl<K, V, A> Chunk<K, V, A>
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    // ========================================================================
    //  Entry allocation
    // ========================================================================

    /// Reserve an entry slot and write `key` into a fresh allocator slice.
    ///
    /// The entry is not yet reachable; [`Chunk::link_entry`] splices it in.
    /// Returns `None` when the chunk is full (or the key cannot be
    /// allocated), signalling the caller to rebalance and retry on a
    /// successor.
    #[must_use]
    pub fn allocate_entry_and_key(&self, key: &K) -> Option<usize> {
        let entry = self.entry_index.fetch_add(FIELDS, CAS_SUCCESS);
        if entry + FIELDS > self.entries.len() {
            return None;
        }

        // both references must be in place before the entry can be linked:
        // a reader reaching the entry mid-put must see "key present, no
        // value" rather than garbage
        self.entries.store_value_ref(entry, ValueRef::DELETED);
        self.write_key(key, entry)?;

        Some(entry)
    }

    /// Serialize `key` into a fresh slice and set the entry's key
    /// reference.
    fn write_key(&self, key: &K, entry: usize) -> Option<()> {
        let size = key.serialized_size();
        let slice = match self.arena.allocate(size) {
            Ok(slice) => slice,
            Err(_error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%_error, "key allocation failed");
                return None;
            }
        };

        debug_assert!(slice.block_id() != INVALID_BLOCK_ID);

        // SAFETY: the slice was just allocated and is referenced by nothing
        let buf = unsafe { slice.bytes_mut() };
        key.serialize_into(buf);

        self.entries.store_key_ref(
            entry,
            KeyRef::new(slice.block_id(), size as u32, slice.position()),
        );
        Some(())
    }

    /// Serialize `value` into a fresh header-initialized slice.
    ///
    /// The returned reference is not yet attached to any entry; the length
    /// it carries includes the header.
    #[expect(
        clippy::indexing_slicing,
        reason = "the slice was allocated HEADER_SIZE bytes longer than the payload"
    )]
    pub fn write_value(&self, value: &V) -> Option<ValueRef> {
        let length = value.serialized_size() + HEADER_SIZE;
        let slice = match self.arena.allocate(length) {
            Ok(slice) => slice,
            Err(_error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%_error, "value allocation failed");
                return None;
            }
        };

        value::init_header(&slice);

        // SAFETY: the slice was just allocated and is referenced by nothing
        let buf = unsafe { slice.bytes_mut() };
        value.serialize_into(&mut buf[HEADER_SIZE..]);

        Some(ValueRef::new(
            slice.block_id(),
            length as u32,
            slice.position(),
        ))
    }

    // ========================================================================
    //  Linking
    // ========================================================================

    /// Splice the allocated entry into the sorted linked list.
    ///
    /// Returns the index that now holds `key`: `entry` itself on success,
    /// or an existing entry if a racing insert of the same key won. In the
    /// losing case `entry`'s slot and key slice become garbage until the
    /// next compaction; the caller continues on the returned index.
    pub fn link_entry(&self, entry: usize, key: &K) -> usize {
        let anchor = self.binary_find(key);

        loop {
            let mut prev;
            let mut curr = anchor;

            // walk to the insertion point
            loop {
                prev = curr;
                curr = self.entries.next(prev);

                if curr == NONE {
                    break;
                }
                match key.compare_serialized(self.read_key(curr)) {
                    Ordering::Less => break,

                    // a racing thread already linked this key
                    Ordering::Equal => return curr,

                    Ordering::Greater => {}
                }
            }

            // entry is unreachable, a plain store suffices
            self.entries.set_next(entry, curr);
            if self.entries.cas_next(prev, curr, entry) {
                // only the thread that won the splice extends the prefix:
                // nobody else can have inserted this key
                self.try_extend_sorted_prefix(entry, key);
                return entry;
            }
            // lost the splice race, re-walk from the anchor
        }
    }

    /// Extend the sorted prefix when the freshly linked entry is physically
    /// adjacent to it and keeps the order.
    ///
    /// Advisory: a lost CAS just leaves the prefix short until the next
    /// compaction recomputes it.
    fn try_extend_sorted_prefix(&self, entry: usize, key: &K) {
        let sorted_count = self.sorted_count.load(READ_ORD);
        if sorted_count == 0 || entry != sorted_count * FIELDS + FIRST_ENTRY {
            return;
        }

        let last_sorted = (sorted_count - 1) * FIELDS + FIRST_ENTRY;
        if key.compare_serialized(self.read_key(last_sorted)) != Ordering::Less {
            let _ = self.sorted_count.compare_exchange(
                sorted_count,
                sorted_count + 1,
                CAS_SUCCESS,
                CAS_FAILURE,
            );
        }
    }

    // ========================================================================
    //  Value attach / detach
    // ========================================================================

    /// Point a linked entry at a new value reference, or detach it.
    ///
    /// For a fresh key this is the insert linearization point. Returns true
    /// on success; false tells the caller to restart the operation (the
    /// observed state made it lose: put-if-absent found a value, a put was
    /// overtaken, a compute landed in place).
    pub fn point_to_value(&self, op_data: &mut OpData<'_>) -> bool {
        loop {
            if self.point_to_value_cas(op_data) {
                return true;
            }

            // the value reference we expected is gone; find out what
            // happened and either help, adapt, or report back
            if op_data.op == Operation::Remove {
                // whatever is there now, the value we were removing is no
                // longer attached
                return true;
            }

            let found = self.entries.value_ref(op_data.entry_index);

            if found == op_data.new_value_ref {
                // another thread helped this exact operation through
                return true;
            }

            if !found.is_valid() {
                // interleaved detach completed; retry attaching over the
                // sentinel
                op_data.old_value_ref = ValueRef::DELETED;
                continue;
            }

            match op_data.op {
                Operation::PutIfAbsent => return false,

                Operation::Compute => {
                    let Some(slice) = self.slice_for(found) else {
                        op_data.old_value_ref = ValueRef::DELETED;
                        continue;
                    };
                    let computer = op_data
                        .computer
                        .unwrap_or_else(|| unreachable!("compute without computer"));

                    if value::compute(&slice, computer) == ValueResult::Success {
                        // computed in place on the existing value
                        return false;
                    }
                    // the value went away mid-compute, attach over it
                    op_data.old_value_ref = found;
                }

                Operation::Put | Operation::NoOp => return false,

                Operation::Remove => unreachable!("Operation::Remove handled above"),
            }
        }
    }

    /// The double-word CAS plus the statistics the winner owes.
    fn point_to_value_cas(&self, op_data: &OpData<'_>) -> bool {
        if !self.entries.cas_value_ref(
            op_data.entry_index,
            op_data.old_value_ref,
            op_data.new_value_ref,
        ) {
            return false;
        }

        let was_valid = op_data.old_value_ref.is_valid();
        let now_valid = op_data.new_value_ref.is_valid();

        if !was_valid && now_valid {
            self.statistics.increment_added_count();
            self.external_size.fetch_add(1, RELAXED);
        } else if was_valid && !now_valid {
            self.statistics.decrement_added_count();
            self.external_size.fetch_sub(1, RELAXED);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::{put, remove, test_chunk};
    use super::*;

    #[test]
    fn allocate_fails_past_capacity() {
        let c = test_chunk(2);

        assert!(c.allocate_entry_and_key(&1u64).is_some());
        assert!(c.allocate_entry_and_key(&2u64).is_some());
        assert!(c.allocate_entry_and_key(&3u64).is_none());
    }

    #[test]
    fn linked_entries_stay_sorted() {
        let c = test_chunk(8);

        for k in [50u64, 10, 30, 20, 40] {
            let entry = c.allocate_entry_and_key(&k).expect("capacity");
            assert_eq!(c.link_entry(entry, &k), entry);
        }

        let mut walked = Vec::new();
        let mut curr = c.first_entry();
        while curr != NONE {
            walked.push(<u64 as crate::codec::KeyCodec>::deserialize(
                c.read_key(curr),
            ));
            curr = c.next_entry(curr);
        }
        assert_eq!(walked, [10, 20, 30, 40, 50]);
    }

    #[test]
    fn relinking_the_same_key_returns_the_existing_entry() {
        let c = test_chunk(8);

        let first = c.allocate_entry_and_key(&7u64).expect("capacity");
        assert_eq!(c.link_entry(first, &7u64), first);

        let second = c.allocate_entry_and_key(&7u64).expect("capacity");
        assert_ne!(second, first);
        // the loser is told where the key actually lives
        assert_eq!(c.link_entry(second, &7u64), first);
    }

    #[test]
    fn put_attaches_and_updates_statistics() {
        let c = test_chunk(8);

        put(&c, 1u64, 100);
        put(&c, 2u64, 200);
        assert_eq!(c.statistics().added_count(), 2);

        // overwrite does not change the count
        put(&c, 1u64, 101);
        assert_eq!(c.statistics().added_count(), 2);
        assert_eq!(c.read_value(c.lookup(&1).expect("found").entry_index), Some(101));

        remove(&c, &1u64);
        assert_eq!(c.statistics().added_count(), 1);
        assert!(c.lookup(&1).expect("still linked").value_slice.is_none());
    }

    #[test]
    fn put_if_absent_loses_to_an_attached_value() {
        let c = test_chunk(8);
        put(&c, 1u64, 100);

        let entry = c.lookup(&1).expect("found").entry_index;
        let value_ref = c.write_value(&999u64).expect("alloc");
        let mut op = OpData::new(
            Operation::PutIfAbsent,
            entry,
            value_ref,
            ValueRef::DELETED,
            None,
        );

        assert!(!c.point_to_value(&mut op));
        assert_eq!(c.read_value(entry), Some(100));
    }

    #[test]
    fn put_if_absent_wins_after_remove() {
        let c = test_chunk(8);
        put(&c, 1u64, 100);
        remove(&c, &1u64);

        let entry = c.lookup(&1).expect("linked").entry_index;
        let value_ref = c.write_value(&999u64).expect("alloc");
        let mut op = OpData::new(
            Operation::PutIfAbsent,
            entry,
            value_ref,
            ValueRef::DELETED,
            None,
        );

        assert!(c.point_to_value(&mut op));
        assert_eq!(c.read_value(entry), Some(999));
    }

    #[test]
    fn compute_applies_in_place_and_reports_restart() {
        let c = test_chunk(8);
        put(&c, 1u64, 5);

        let entry = c.lookup(&1).expect("found").entry_index;
        let fallback = c.write_value(&0u64).expect("alloc");
        let bump = |payload: &mut [u8]| {
            let current = <u64 as ValueCodec>::deserialize(payload);
            ValueCodec::serialize_into(&(current + 1), payload);
        };

        // expected-old deliberately stale so the CAS fails and the compute
        // path runs against the attached value
        let mut op = OpData::new(
            Operation::Compute,
            entry,
            fallback,
            ValueRef::DELETED,
            Some(&bump),
        );

        assert!(!c.point_to_value(&mut op));
        assert_eq!(c.read_value(entry), Some(6));
    }

    #[test]
    fn remove_of_an_already_detached_value_succeeds() {
        let c = test_chunk(8);
        put(&c, 1u64, 5);

        let found = c.lookup(&1).expect("found");
        remove(&c, &1u64);

        // stale expected reference: the CAS fails, but remove semantics are
        // already satisfied
        let mut op = OpData::new(
            Operation::Remove,
            found.entry_index,
            ValueRef::DELETED,
            found.value_ref,
            None,
        );
        assert!(c.point_to_value(&mut op));
    }
}
