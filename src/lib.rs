//! # chunkmap
//!
//! The per-shard chunk of a concurrent, off-heap, ordered key-value store.
//!
//! A chunk keeps keys sorted through a lock-free linked list threaded over
//! a flat entry array, with binary search over a sorted prefix for fast
//! lookup. Key and value bytes live in allocator-owned blocks; entries
//! hold packed 64-bit `(block, length, position)` references that attach,
//! replace, and detach atomically.
//!
//! ## Design
//!
//! - **Entries**: fixed-width slots in one flat array; `next` splices by
//!   32-bit CAS, references move by 64-bit CAS ([`entries`], [`refs`]).
//! - **Lifecycle**: `Infant → Normal → Frozen → Released`, with a
//!   publish/unpublish handshake that lets `freeze` drain in-flight
//!   writers before a rebalance reads the array ([`chunk`]).
//! - **Rebalance cooperation**: engagement by CAS, a marked next-chunk
//!   reference, and run-length sorted compaction that shares key slices
//!   between the old and new chunks ([`chunk::rebalance`]).
//! - **Iteration**: ascending along the list; descending through a
//!   bounded explicit stack anchored on sorted positions
//!   ([`chunk::iter`]).
//!
//! ## Collaborators
//!
//! The enclosing map supplies the chunk index and rebalance driver; this
//! crate ships their contracts plus [`alloc::BlockArena`], a reference
//! block allocator backed by [`seize`] for deferred reclamation.
//!
//! ## Example
//!
//! ```
//! use chunkmap::{BlockArena, Chunk, OpData, Operation};
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicIsize;
//!
//! let chunk: Box<Chunk<u64, u64>> = Chunk::new(
//!     Box::new([]),
//!     std::ptr::null_mut(),
//!     Arc::new(BlockArena::default()),
//!     16,
//!     Arc::new(AtomicIsize::new(0)),
//! );
//!
//! assert!(chunk.publish());
//! let entry = chunk.allocate_entry_and_key(&7u64).expect("capacity");
//! let entry = chunk.link_entry(entry, &7u64);
//! let value_ref = chunk.write_value(&42u64).expect("capacity");
//! let mut op = OpData::new(
//!     Operation::Put,
//!     entry,
//!     value_ref,
//!     chunk.value_reference(entry),
//!     None,
//! );
//! assert!(chunk.point_to_value(&mut op));
//! chunk.unpublish();
//!
//! let found = chunk.lookup(&7u64).expect("present");
//! assert_eq!(chunk.read_value(found.entry_index), Some(42));
//! ```

pub mod alloc;
pub mod chunk;
pub mod codec;
pub mod entries;
pub mod ordering;
pub mod refs;
pub mod stats;
pub mod value;

pub use alloc::{AllocError, BlockAllocator, BlockArena, Slice};
pub use chunk::rebalance::retire_chunk;
pub use chunk::{Chunk, ChunkState, LookUp, MAX_ITEMS_DEFAULT, OpData, Operation, Rebalancer};
pub use chunk::iter::{AscendingIter, DescendingIter};
pub use codec::{KeyCodec, ValueCodec};
pub use refs::{KeyRef, ValueRef};
pub use stats::Statistics;
pub use value::{HEADER_SIZE, ValueResult};
