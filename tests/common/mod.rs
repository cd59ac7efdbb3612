//! Common test utilities: tracing setup and the put/get/remove flows the
//! enclosing map would drive against a chunk.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let chunk = common::test_chunk(16);
//!     common::put(&chunk, 1, 10);
//! }
//! ```
//!
//! Set `RUST_LOG` (e.g. `chunkmap=debug`) to see chunk lifecycle events
//! when the `tracing` feature is enabled.

#![allow(dead_code)] // not every test binary uses every helper

use std::ptr;
use std::sync::atomic::AtomicIsize;
use std::sync::{Arc, Once};

use chunkmap::{BlockArena, Chunk, KeyCodec, OpData, Operation, ValueRef};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber once across all tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;

        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A root `u64 -> u64` chunk over its own arena.
pub fn test_chunk(max_items: usize) -> Box<Chunk<u64, u64>> {
    test_chunk_sharing(max_items, &Arc::new(AtomicIsize::new(0)))
}

/// A root chunk sharing an external size counter with the caller.
pub fn test_chunk_sharing(
    max_items: usize,
    external_size: &Arc<AtomicIsize>,
) -> Box<Chunk<u64, u64>> {
    Chunk::new(
        Box::new([]),
        ptr::null_mut(),
        Arc::new(BlockArena::new(1 << 20, 512)),
        max_items,
        Arc::clone(external_size),
    )
}

/// Full put flow: publish, allocate + link, write the value off-heap,
/// attach by CAS. Returns false when the chunk rejects the writer or is out
/// of capacity.
pub fn try_put(chunk: &Chunk<u64, u64>, key: u64, value: u64) -> bool {
    if !chunk.publish() {
        return false;
    }

    let Some(allocated) = chunk.allocate_entry_and_key(&key) else {
        chunk.unpublish();
        return false;
    };
    let entry = chunk.link_entry(allocated, &key);

    let Some(value_ref) = chunk.write_value(&value) else {
        chunk.unpublish();
        return false;
    };

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

pub fn put(chunk: &Chunk<u64, u64>, key: u64, value: u64) {
    assert!(try_put(chunk, key, value), "put({key}) failed");
}

/// Detach `key`'s value. Returns false when the key has no live value.
pub fn remove(chunk: &Chunk<u64, u64>, key: u64) -> bool {
    if !chunk.publish() {
        return false;
    }

    let removed = match chunk.lookup(&key) {
        Some(found) if found.value_slice.is_some() => {
            let mut op = OpData::new(
                Operation::Remove,
                found.entry_index,
                ValueRef::DELETED,
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

pub fn get(chunk: &Chunk<u64, u64>, key: u64) -> Option<u64> {
    let found = chunk.lookup(&key)?;
    found.value_slice.as_ref()?;
    chunk.read_value(found.entry_index)
}

/// Live keys in ascending iteration order.
pub fn ascending_keys(chunk: &Chunk<u64, u64>) -> Vec<u64> {
    chunk
        .ascending_iter()
        .map(|entry| <u64 as KeyCodec>::deserialize(chunk.read_key(entry)))
        .collect()
}

/// Live keys in descending iteration order.
pub fn descending_keys(chunk: &Chunk<u64, u64>) -> Vec<u64> {
    chunk
        .descending_iter()
        .map(|entry| <u64 as KeyCodec>::deserialize(chunk.read_key(entry)))
        .collect()
}
