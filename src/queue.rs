// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An MPMC queue that buffers contended enqueues on a side chain.
//!
//! The main structure is a sentinel-headed linked chain in the style of
//! Michael and Scott's [non-blocking queue][1]: enqueuers install a node at
//! `tail.next` with a compare-and-swap and dequeuers advance `head`. Under
//! contention that single compare-and-swap degrades quickly, so a failed
//! enqueuer does not retry it directly. Instead it bids to root a *side
//! chain* hanging off the `side_tail` pointer. All but one of the contending
//! enqueuers link onto the side chain by racing on its end's `next` pointer,
//! building the chain up cooperatively; the one thread that rooted it keeps
//! retrying the main-chain splice with back-off, and once the splice lands it
//! clears `side_tail` and publishes the furthest side node as the new `tail`.
//! One hot compare-and-swap becomes a distributed chain build-up.
//!
//! FIFO order is by the moment of linkage into the main chain, not by the
//! moment `enqueue` was called; nodes that reach the side chain before the
//! splice preserve their pairwise order.
//!
//! Every `tail` update is a forward compare-and-swap and enqueuers help a
//! stale `tail` over an already-linked successor. That keeps `tail` from
//! ever trailing `head`, which is what makes it sound to retire bypassed
//! nodes to the epoch collector: a node is retired only once `head` has
//! passed it and neither `tail` nor `side_tail` still references it.
//!
//! [1]: https://www.cs.rochester.edu/~scott/papers/1996_PODC_queues.pdf

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};
use log::trace;

use crate::pause;

struct Node<T> {
    /// The payload, null for the sentinel and for any node whose payload has
    /// been taken. The swap to null picks the unique taker.
    item: Atomic<T>,
    /// Installed by compare-and-swap at most once, then never changed.
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Node {
            item: Atomic::null(),
            next: Atomic::null(),
        }
    }

    fn new(item: T) -> Self {
        Node {
            item: Atomic::new(item),
            next: Atomic::null(),
        }
    }
}

/// A multi-producer/multi-consumer FIFO queue optimized for high-contention
/// enqueue.
///
/// `enqueue` never blocks indefinitely under a finite population of
/// producers and `try_dequeue` never blocks at all. Iteration is a snapshot
/// of the nodes whose payloads were still present when it visited them.
pub struct BufferedQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    /// Root of the side chain absorbing enqueue contention; usually null.
    side_tail: CachePadded<Atomic<Node<T>>>,
}

impl<T> BufferedQueue<T> {
    pub fn new() -> Self {
        // Nothing else can see the queue yet, so a dummy guard suffices.
        let guard = unsafe { epoch::unprotected() };
        let queue = BufferedQueue {
            head: CachePadded::new(Atomic::new(Node::sentinel())),
            tail: CachePadded::new(Atomic::null()),
            side_tail: CachePadded::new(Atomic::null()),
        };
        queue
            .tail
            .store(queue.head.load(Ordering::Relaxed, guard), Ordering::Relaxed);
        queue
    }

    /// Adds `item` to the back of the queue.
    pub fn enqueue(&self, item: T, guard: &Guard) {
        let node = Owned::new(Node::new(item)).into_shared(guard);

        // Fast path: extend the main chain directly.
        let tail = self.tail.load(Ordering::Acquire, guard);
        if unsafe { tail.deref() }
            .next
            .compare_exchange(
                Shared::null(),
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
        {
            // Best effort: failure means someone already helped `tail` at
            // least this far along the chain.
            let _ = self
                .tail
                .compare_exchange(tail, node, Ordering::AcqRel, Ordering::Acquire, guard);
            return;
        }

        self.enqueue_buffered(node, guard);
    }

    /// Adds `item` to the back of the queue, pinning the epoch internally.
    pub fn push(&self, item: T) {
        self.enqueue(item, &epoch::pin())
    }

    /// The contended path: join (or root) the side chain.
    fn enqueue_buffered(&self, node: Shared<Node<T>>, guard: &Guard) {
        let backoff = Backoff::new();
        loop {
            let side = self.side_tail.load(Ordering::Acquire, guard);
            if side.is_null() {
                if self
                    .side_tail
                    .compare_exchange(
                        Shared::null(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                {
                    // We rooted the side chain and owe the splice.
                    trace!("rooted side chain at {:?}", node);
                    self.splice(node, guard);
                    return;
                }
                // Someone else rooted it first; join their chain.
                continue;
            }

            if unsafe { side.deref() }
                .next
                .compare_exchange(
                    Shared::null(),
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                // Linked behind the side end; hand the end marker on.
                if self
                    .side_tail
                    .compare_exchange(side, node, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    return;
                }
                // The root has spliced and cleared the marker, so the old
                // side end is (or is about to become) the main tail.
                let backoff = Backoff::new();
                loop {
                    if self
                        .tail
                        .compare_exchange(side, node, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_ok()
                    {
                        return;
                    }
                    if self.tail.load(Ordering::Acquire, guard) != side {
                        // `tail` already moved to or past our node.
                        return;
                    }
                    pause(&backoff);
                }
            }
            pause(&backoff);
        }
    }

    /// Splices the side chain rooted at `root` into the main chain, then
    /// publishes the furthest known side node as `tail`. Only the thread
    /// that rooted the chain calls this.
    fn splice(&self, root: Shared<Node<T>>, guard: &Guard) {
        let backoff = Backoff::new();
        let spliced_at = loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            let tail_ref = unsafe { tail.deref() };
            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    root,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                trace!("spliced side chain into main chain at {:?}", tail);
                break tail;
            }
            // The main chain grew under us; help `tail` forward and retry.
            let next = tail_ref.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire, guard);
            }
            pause(&backoff);
        };

        // Take the furthest known side node and publish it as the main tail.
        // Stragglers still holding the old side end recover through `tail`
        // itself, so the swap can safely race them.
        let end = self.side_tail.swap(Shared::null(), Ordering::AcqRel, guard);
        debug_assert!(!end.is_null());
        let _ = self
            .tail
            .compare_exchange(spliced_at, end, Ordering::AcqRel, Ordering::Acquire, guard);
    }

    /// Takes the value at the front of the queue, if any. Never blocks.
    ///
    /// The payload is returned by clone and the original is retired through
    /// the epoch collector, so a concurrent snapshot iterator that already
    /// observed the payload keeps a valid reference until its guard drops.
    pub fn try_dequeue(&self, guard: &Guard) -> Option<T>
    where
        T: Clone,
    {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let head_ref = unsafe { head.deref() };
            // A single swap picks the unique taker of this payload.
            let taken = head_ref.item.swap(Shared::null(), Ordering::AcqRel, guard);
            let next = head_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                self.advance_head(head, next, guard);
            }

            if !taken.is_null() {
                let value = unsafe { taken.deref() }.clone();
                unsafe { guard.defer_destroy(taken) };
                return Some(value);
            }
            if next.is_null() {
                return None;
            }
            backoff.spin();
        }
    }

    /// Takes the value at the front of the queue, pinning the epoch
    /// internally.
    pub fn pop(&self) -> Option<T>
    where
        T: Clone,
    {
        self.try_dequeue(&epoch::pin())
    }

    /// Moves `head` from `node` to `next`, retiring `node` once no root can
    /// reach it.
    fn advance_head(&self, node: Shared<Node<T>>, next: Shared<Node<T>>, guard: &Guard) {
        // `head` must never pass `tail`: move `tail` off the node first.
        // Once `tail` is ahead of the node it cannot come back, because
        // every `tail` update is a compare-and-swap to a node further along
        // the chain.
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            if tail != node {
                break;
            }
            if self
                .tail
                .compare_exchange(node, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                break;
            }
        }
        if self
            .head
            .compare_exchange(node, next, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            // A splice in flight may still hold the node as its side end;
            // wait it out. The root is past its contention point, so this is
            // a bounded wait on that thread's next few instructions.
            let backoff = Backoff::new();
            while self.side_tail.load(Ordering::Acquire, guard) == node {
                pause(&backoff);
            }
            unsafe { guard.defer_destroy(node) };
        }
    }

    /// Snapshot iterator over payloads still present when visited.
    ///
    /// With no dequeuers running, the snapshot yields every enqueued item
    /// exactly once. A payload taken by a concurrent dequeuer before the
    /// iterator reaches its node is skipped.
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, T> {
        Iter {
            node: self.head.load(Ordering::Acquire, guard),
            guard,
        }
    }

    /// True when a snapshot of the queue holds no payloads.
    pub fn is_empty(&self, guard: &Guard) -> bool {
        self.iter(guard).next().is_none()
    }
}

impl<T> Default for BufferedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for BufferedQueue<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let guard = epoch::pin();
        write!(f, "BufferedQueue {{ live: {} }}", self.iter(&guard).count())
    }
}

impl<T> Drop for BufferedQueue<T> {
    fn drop(&mut self) {
        // Exclusive access (&mut): every splice has completed, so the whole
        // chain hangs off `head` and the side pointer is clear.
        let guard = unsafe { epoch::unprotected() };
        let mut node = self.head.load(Ordering::Relaxed, guard);
        while !node.is_null() {
            let node_ref = unsafe { node.deref() };
            let item = node_ref.item.load(Ordering::Relaxed, guard);
            if !item.is_null() {
                drop(unsafe { item.into_owned() });
            }
            let next = node_ref.next.load(Ordering::Relaxed, guard);
            drop(unsafe { node.into_owned() });
            node = next;
        }
    }
}

/// Snapshot iterator over a [`BufferedQueue`]. Yields references valid for
/// the lifetime of the guard it was created with.
pub struct Iter<'g, T> {
    node: Shared<'g, Node<T>>,
    guard: &'g Guard,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        while !self.node.is_null() {
            let node_ref = unsafe { self.node.deref() };
            let item = node_ref.item.load(Ordering::Acquire, self.guard);
            self.node = node_ref.next.load(Ordering::Acquire, self.guard);
            if !item.is_null() {
                return Some(unsafe { item.deref() });
            }
        }
        None
    }
}
