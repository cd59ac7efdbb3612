//! Standard memory orderings for concurrent entry access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading entry fields and chunk metadata.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writing entry fields and chunk metadata.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (compare-and-swap).
/// Used for `next` splices, value-reference attach/detach, state transitions.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for relaxed accesses (statistics, pre-publication writes).
/// Safe because the containing entry is not yet reachable, or the counter
/// is advisory.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the publish/freeze handshake.
///
/// The writer increments `pending_ops` and then reads `state`; the freezer
/// stores `state` and then reads `pending_ops`. Both sides must observe at
/// least one of the other's accesses, which requires a total order over the
/// four accesses.
pub const HANDSHAKE_ORD: Ordering = Ordering::SeqCst;
