// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free containers optimized for insertion under heavy contention.
//!
//! This crate provides two thread-safe data-structures for workloads where
//! many threads insert concurrently and the insert path is the one worth
//! optimizing:
//!
//! - [`GrowList`], a grow-only indexed sequence. It supports concurrent
//!   append, indexed reads, indexed overwrites (unconditional or by
//!   compare-and-swap), membership queries, and snapshot iteration. Elements
//!   are never removed.
//! - [`BufferedQueue`], a multi-producer/multi-consumer FIFO queue. When the
//!   main tail is contended, enqueuers accumulate on a transient side chain
//!   that a single thread later splices into the main chain, converting one
//!   hot compare-and-swap into a distributed chain build-up.
//!
//! # Example
//!
//! ```rust
//! use plenum::GrowList;
//! use crossbeam_epoch as epoch;
//!
//! let list = GrowList::new();
//! let guard = epoch::pin();
//! let ix = list.append(7usize, &guard).unwrap();
//! assert_eq!(list.get(ix, &guard), Ok(&7));
//! ```
//!
//! Core operations take an explicit [`crossbeam_epoch::Guard`]; this keeps
//! repeated operations on the hot path from re-pinning the epoch. Each
//! structure also provides `push`/`pop` convenience methods that pin
//! internally.
//!
//! # Guarantees
//!
//! Both structures are non-blocking: no operation takes a lock, and a stalled
//! thread cannot prevent others from completing their own operations, with
//! one exception each. A `GrowList` capacity growth waits for in-flight
//! populations of already-claimed slots before it publishes the grown
//! storage, and a `BufferedQueue` enqueue that joined a side chain may wait
//! for the chain's root to finish splicing. In both cases the wait is on
//! another thread that is past its own contention point, so every operation
//! completes under a finite population of threads.
//!
//! Iteration is a snapshot: bounds are sampled once at creation and later
//! concurrent mutations may not be observed. Superseded storage and bypassed
//! queue nodes are reclaimed through the epoch collector once all pinned
//! guards drain.

use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;
use thiserror::Error;

pub mod list;
pub mod queue;

pub use crate::list::GrowList;
pub use crate::queue::BufferedQueue;

/// Ways an operation on a [`GrowList`] can fail.
///
/// Every variant is a synchronous report to the caller; none is transient and
/// none is retried internally. Contention is not an error: the structures
/// mask it with bounded back-off until they make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The list already holds the maximum number of slots it can address.
    #[error("the list is at its maximum capacity")]
    CapacityExhausted,
    /// The index is not covered by the fully-populated prefix.
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },
    /// The requested range is inverted or does not fit the destination.
    #[error("invalid range {from}..{to}")]
    InvalidRange { from: usize, to: usize },
    /// The operation would shrink or reorder a grow-only sequence.
    #[error("`{0}` is not supported by a grow-only sequence")]
    Unsupported(&'static str),
}

/// Sleep bound once a spin loop has exhausted its backoff budget.
const SATURATED_PAUSE: Duration = Duration::from_millis(1);

/// One step of a bounded wait: snooze while the backoff has budget, then
/// fall back to short sleeps so a descheduled peer gets cycles to finish.
pub(crate) fn pause(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(SATURATED_PAUSE);
    } else {
        backoff.snooze();
    }
}
