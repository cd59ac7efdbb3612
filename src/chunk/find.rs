//! Lookup: binary search over the sorted prefix, then a linear walk down
//! the linked list from the predecessor.

use crate::alloc::{BlockAllocator, Slice};
use crate::codec::{KeyCodec, ValueCodec};
use crate::entries::{FIELDS, FIRST_ENTRY, HEAD_ENTRY, NONE};
use crate::ordering::READ_ORD;
use crate::refs::ValueRef;
use crate::value;

use super::Chunk;

use std::cmp::Ordering;

/// Result of a successful [`Chunk::lookup`].
#[derive(Debug)]
pub struct LookUp {
    /// The live value slice; `None` when the entry exists but its value is
    /// detached or logically deleted.
    pub value_slice: Option<Slice>,

    /// The raw value reference read at the linearization point. Callers
    /// feed it back as the expected value of a subsequent CAS.
    pub value_ref: ValueRef,

    /// The matching entry.
    pub entry_index: usize,
}

impl<K, V, A> Chunk<K, V, A>
where
    K: KeyCodec,
    V: ValueCodec,
    A: BlockAllocator,
{
    /// Find the entry holding `key`, if any.
    ///
    /// Returns `Some` with `value_slice: None` for an entry whose value is
    /// detached or header-deleted: the key exists in the list but the
    /// mapping is logically absent.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<LookUp> {
        let mut curr = self.entries.next(self.binary_find(key));

        while curr != NONE {
            match key.compare_serialized(self.read_key(curr)) {
                // past the key's position, it is not in the chunk
                Ordering::Less => return None,

                Ordering::Equal => {
                    let value_ref = self.entries.value_ref(curr);
                    let Some(slice) = self.slice_for(value_ref) else {
                        debug_assert_eq!(value_ref, ValueRef::DELETED);
                        return Some(LookUp {
                            value_slice: None,
                            value_ref,
                            entry_index: curr,
                        });
                    };

                    if value::is_deleted(&slice) {
                        return Some(LookUp {
                            value_slice: None,
                            value_ref,
                            entry_index: curr,
                        });
                    }

                    return Some(LookUp {
                        value_slice: Some(slice),
                        value_ref,
                        entry_index: curr,
                    });
                }

                Ordering::Greater => curr = self.entries.next(curr),
            }
        }

        None
    }

    /// Binary search the sorted prefix for the last entry whose key is
    /// strictly below `key`.
    ///
    /// Returns the index to start a linear walk from: the head sentinel if
    /// the prefix is empty or `key` is at or below the first sorted key,
    /// otherwise a sorted-prefix entry. If `key` is in the chunk, the
    /// returned entry *precedes* it.
    pub(super) fn binary_find(&self, key: &K) -> usize {
        let sorted_count = self.sorted_count.load(READ_ORD);

        if sorted_count == 0
            || key.compare_serialized(self.read_key(FIRST_ENTRY)) != Ordering::Greater
        {
            return HEAD_ENTRY;
        }

        // compare with the last sorted key to skip the bisection entirely
        let last_sorted = (sorted_count - 1) * FIELDS + FIRST_ENTRY;
        if key.compare_serialized(self.read_key(last_sorted)) == Ordering::Greater {
            return last_sorted;
        }

        let mut start = 0;
        let mut end = sorted_count;

        while end - start > 1 {
            let mid = start + (end - start) / 2;
            let entry = mid * FIELDS + FIRST_ENTRY;

            if key.compare_serialized(self.read_key(entry)) != Ordering::Greater {
                end = mid;
            } else {
                start = mid;
            }
        }

        start * FIELDS + FIRST_ENTRY
    }
}
