//! Loom tests for the chunk's two hand-rolled protocols: the
//! publish/freeze handshake and value-reference CAS linearization.
//!
//! Loom explores all interleavings of a small model built from loom
//! atomics. The real chunk uses `std` atomics with the same orderings; the
//! models here mirror the exact access patterns of `publish`/`freeze` and
//! `point_to_value`.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib chunk::loom_tests`

use loom::sync::Arc;
use loom::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use loom::thread;

const NORMAL: u8 = 1;
const FROZEN: u8 = 2;

/// The publish/freeze handshake on loom atomics, orderings as in the chunk.
struct Handshake {
    state: AtomicU8,
    pending_ops: AtomicU32,
    mutations: AtomicU32,
}

impl Handshake {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(NORMAL),
            pending_ops: AtomicU32::new(0),
            mutations: AtomicU32::new(0),
        }
    }

    fn publish(&self) -> bool {
        self.pending_ops.fetch_add(1, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) != NORMAL {
            self.pending_ops.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn unpublish(&self) {
        self.pending_ops.fetch_sub(1, Ordering::AcqRel);
    }

    fn freeze(&self) {
        self.state.store(FROZEN, Ordering::SeqCst);
        while self.pending_ops.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }
}

/// No mutation may start after freeze returns, and every published
/// mutation is complete by then.
#[test]
fn freeze_waits_for_published_writers() {
    loom::model(|| {
        let chunk = Arc::new(Handshake::new());

        let writer = {
            let chunk = Arc::clone(&chunk);
            thread::spawn(move || {
                if chunk.publish() {
                    chunk.mutations.fetch_add(1, Ordering::AcqRel);
                    chunk.unpublish();
                    true
                } else {
                    false
                }
            })
        };

        chunk.freeze();
        // freeze returned: the entry array is immutable from here on
        let mutations_at_freeze = chunk.mutations.load(Ordering::SeqCst);

        let wrote = writer.join().expect("writer panicked");
        let mutations_final = chunk.mutations.load(Ordering::SeqCst);

        // a writer that published completed before freeze returned; one
        // that failed to publish never mutated at all
        assert_eq!(mutations_final, u32::from(wrote));
        assert_eq!(mutations_at_freeze, mutations_final);
        assert_eq!(chunk.pending_ops.load(Ordering::SeqCst), 0);
    });
}

/// Racing attach CASes on one value reference: exactly one wins, and the
/// loser observes the winner's reference.
#[test]
fn value_reference_cas_linearizes() {
    const DELETED: u64 = 0;

    loom::model(|| {
        let value_ref = Arc::new(AtomicU64::new(DELETED));

        let contenders: Vec<_> = [1u64, 2]
            .into_iter()
            .map(|new_ref| {
                let value_ref = Arc::clone(&value_ref);
                thread::spawn(move || {
                    value_ref
                        .compare_exchange(DELETED, new_ref, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                })
            })
            .collect();

        let wins: Vec<bool> = contenders
            .into_iter()
            .map(|t| t.join().expect("contender panicked"))
            .collect();

        assert_eq!(wins.iter().filter(|&&w| w).count(), 1);

        let settled = value_ref.load(Ordering::SeqCst);
        let winner = if wins[0] { 1 } else { 2 };
        assert_eq!(settled, winner);
    });
}
