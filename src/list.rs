// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A grow-only concurrent indexed sequence.
//!
//! A [`GrowList`] hands out dense indices to concurrent appenders with a
//! single fetch-add, then publishes each element through a per-slot occupancy
//! flag. The published length is the *committed prefix*: the longest run of
//! indices starting at zero whose populations are all visible. Any appender
//! that finds its just-populated slot at the frontier advances the prefix as
//! far as consecutively-populated slots permit, so a slow appender's
//! contribution is counted either by itself or by whoever lands behind it.
//!
//! Storage grows by doubling. The thread that wins the growth races allocates
//! a fresh slot array and occupancy map, waits per slot for in-flight
//! populations of the old range to land, carries the elements over, and
//! publishes the occupancy map strictly before the slot array. A reader that
//! observes the new slots therefore never pairs them with a stale map.
//! Superseded generations are retired to the epoch collector; each generation
//! owns its elements, so retirement is wholesale.
//!
//! There is no removal. `remove`, `insert`, and `clear` exist only to report
//! [`Error::Unsupported`]: append, indexed overwrite, and compare-and-swap
//! are the entire mutation set.

use std::cmp;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::{Backoff, CachePadded};
use log::trace;

use crate::{pause, Error};

/// Largest number of slots a list will ever address.
pub const MAX_CAPACITY: usize = i32::MAX as usize;

const DEFAULT_CAPACITY: usize = 16;

/// One generation of element slots. A null slot has not been populated in
/// this generation.
struct Storage<T> {
    slots: Box<[Atomic<T>]>,
}

impl<T> Storage<T> {
    fn empty(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Atomic::null);
        Storage {
            slots: slots.into_boxed_slice(),
        }
    }
}

impl<T> Drop for Storage<T> {
    fn drop(&mut self) {
        // Each generation owns its elements: growth carries clones over, and
        // an overwrite retires the element it displaced. Whatever is still in
        // the slots is ours to free.
        let guard = unsafe { epoch::unprotected() };
        for slot in self.slots.iter() {
            let elem = slot.load(Ordering::Relaxed, guard);
            if !elem.is_null() {
                drop(unsafe { elem.into_owned() });
            }
        }
    }
}

/// One generation of occupancy flags, always published before the slot
/// generation it describes.
struct OccupancyMap {
    flags: Box<[AtomicBool]>,
}

impl OccupancyMap {
    fn empty(capacity: usize) -> Self {
        let mut flags = Vec::with_capacity(capacity);
        flags.resize_with(capacity, || AtomicBool::new(false));
        OccupancyMap {
            flags: flags.into_boxed_slice(),
        }
    }
}

/// A grow-only indexed sequence supporting concurrent append, indexed
/// overwrite, and snapshot iteration.
///
/// Appends are wait-free apart from capacity growth; reads are wait-free.
/// The published length only counts the contiguous prefix of visible
/// elements, so `get(i)` succeeds for every `i` below [`GrowList::len`]
/// regardless of how many appends are still in flight behind it.
pub struct GrowList<T> {
    /// Published slot generation; its length is the actual capacity.
    values: Atomic<Storage<T>>,
    /// Published occupancy generation, same length.
    occupied: Atomic<OccupancyMap>,
    /// Capacity after all in-flight growths complete. Monotonic.
    target_capacity: CachePadded<AtomicUsize>,
    /// Next unclaimed append index. Monotonic, bumped before population.
    next_index: CachePadded<AtomicUsize>,
    /// Length of the fully-populated, fully-visible prefix. Monotonic.
    committed: CachePadded<AtomicUsize>,
}

impl<T> GrowList<T> {
    /// Creates a list with the default initial capacity (16 slots).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a list with at least one initial slot and at most
    /// [`MAX_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = cmp::max(1, cmp::min(capacity, MAX_CAPACITY));
        GrowList {
            values: Atomic::new(Storage::empty(capacity)),
            occupied: Atomic::new(OccupancyMap::empty(capacity)),
            target_capacity: CachePadded::new(AtomicUsize::new(capacity)),
            next_index: CachePadded::new(AtomicUsize::new(0)),
            committed: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Number of elements in the committed prefix.
    pub fn len(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the currently published slot array.
    pub fn capacity(&self, guard: &Guard) -> usize {
        let storage = self.values.load(Ordering::Acquire, guard);
        unsafe { storage.deref() }.slots.len()
    }

    /// Appends `item`, returning the index it was assigned.
    ///
    /// Indices are dense across all threads: `n` successful appends are
    /// assigned exactly the indices `0..n`. Fails with
    /// [`Error::CapacityExhausted`] only once the list cannot grow past
    /// [`MAX_CAPACITY`].
    pub fn append(&self, item: T, guard: &Guard) -> Result<usize, Error>
    where
        T: Clone,
    {
        let ix = self.next_index.fetch_add(1, Ordering::AcqRel);
        self.ensure_capacity(ix, guard)?;

        // Element first, flag second, both with release semantics. Both land
        // in the same generation: a growth covering `ix` cannot publish until
        // it has observed this flag.
        let storage = self.values.load(Ordering::Acquire, guard);
        unsafe { storage.deref() }.slots[ix].store(Owned::new(item), Ordering::Release);
        let occupied = self.occupied.load(Ordering::Acquire, guard);
        unsafe { occupied.deref() }.flags[ix].store(true, Ordering::Release);

        self.advance_committed(ix, guard);
        Ok(ix)
    }

    /// Appends `item`, discarding the assigned index. Pins the epoch
    /// internally.
    pub fn push(&self, item: T) -> Result<(), Error>
    where
        T: Clone,
    {
        self.append(item, &epoch::pin()).map(|_| ())
    }

    /// Appends every item in `items` in iteration order. Indices of other
    /// threads may interleave.
    pub fn append_all<I: IntoIterator<Item = T>>(&self, items: I) -> Result<(), Error>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        for item in items {
            self.append(item, &guard)?;
        }
        Ok(())
    }

    /// Makes sure the published slot array covers `ix`, growing it if this
    /// thread drew that duty.
    fn ensure_capacity(&self, ix: usize, guard: &Guard) -> Result<(), Error>
    where
        T: Clone,
    {
        loop {
            let target = self.target_capacity.load(Ordering::Acquire);
            if ix < target {
                // Another grower is (or was) responsible for covering `ix`;
                // wait for the published array to catch up.
                let backoff = Backoff::new();
                while self.capacity(guard) <= ix {
                    pause(&backoff);
                }
                return Ok(());
            }
            if target == MAX_CAPACITY {
                return Err(Error::CapacityExhausted);
            }
            // Let the growth that raised `target` publish before bidding to
            // raise it further.
            let backoff = Backoff::new();
            while self.capacity(guard) < target {
                pause(&backoff);
            }
            let next = cmp::min(target.saturating_mul(2), MAX_CAPACITY);
            if self
                .target_capacity
                .compare_exchange(target, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.grow(target, next, guard);
                if ix < next {
                    return Ok(());
                }
            }
        }
    }

    /// Replaces the published generation with one of `new_capacity` slots.
    /// Only the thread that won the `target_capacity` race calls this.
    fn grow(&self, old_capacity: usize, new_capacity: usize, guard: &Guard)
    where
        T: Clone,
    {
        trace!("growing storage {} -> {}", old_capacity, new_capacity);
        let old_values = self.values.load(Ordering::Acquire, guard);
        let old_occupied = self.occupied.load(Ordering::Acquire, guard);
        let old_slots = &unsafe { old_values.deref() }.slots;
        let old_flags = &unsafe { old_occupied.deref() }.flags;
        debug_assert_eq!(old_slots.len(), old_capacity);

        let storage = Storage::empty(new_capacity);
        let occupied = OccupancyMap::empty(new_capacity);
        for ix in 0..old_capacity {
            // Every index below the old capacity was claimed before this
            // growth began; wait out its in-flight population.
            let backoff = Backoff::new();
            while !old_flags[ix].load(Ordering::Acquire) {
                pause(&backoff);
            }
            let elem = unsafe { old_slots[ix].load(Ordering::Acquire, guard).deref() };
            storage.slots[ix].store(Owned::new(elem.clone()), Ordering::Relaxed);
            occupied.flags[ix].store(true, Ordering::Relaxed);
        }

        // Occupancy must become visible before the slots it describes.
        let stale_occupied = self
            .occupied
            .swap(Owned::new(occupied), Ordering::AcqRel, guard);
        let stale_values = self
            .values
            .swap(Owned::new(storage), Ordering::AcqRel, guard);
        unsafe {
            guard.defer_destroy(stale_occupied);
            guard.defer_destroy(stale_values);
        }
    }

    /// Advances the committed prefix past `ix` and then as far as
    /// consecutively-populated slots permit.
    fn advance_committed(&self, ix: usize, guard: &Guard) {
        let mut at = ix;
        while self
            .committed
            .compare_exchange(at, at + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            at += 1;
            // Never pass an unclaimed slot or one whose population has not
            // landed in the published generation.
            if at >= self.next_index.load(Ordering::Acquire) {
                break;
            }
            let occupied = self.occupied.load(Ordering::Acquire, guard);
            let flags = &unsafe { occupied.deref() }.flags;
            if at >= flags.len() || !flags[at].load(Ordering::Acquire) {
                break;
            }
        }
    }

    /// Reads the element at `index`.
    pub fn get<'g>(&self, index: usize, guard: &'g Guard) -> Result<&'g T, Error> {
        let len = self.len();
        if index >= len {
            return Err(Error::OutOfBounds { index, len });
        }
        let storage = self.values.load(Ordering::Acquire, guard);
        let elem = unsafe { storage.deref() }.slots[index].load(Ordering::Acquire, guard);
        // Committed slots are always populated.
        Ok(unsafe { elem.deref() })
    }

    /// Overwrites the element at `index`. Only committed slots may be
    /// overwritten.
    pub fn set(&self, index: usize, item: T, guard: &Guard) -> Result<(), Error> {
        let len = self.len();
        if index >= len {
            return Err(Error::OutOfBounds { index, len });
        }
        let storage = self.values.load(Ordering::Acquire, guard);
        let displaced =
            unsafe { storage.deref() }.slots[index].swap(Owned::new(item), Ordering::AcqRel, guard);
        debug_assert!(!displaced.is_null());
        unsafe { guard.defer_destroy(displaced) };
        Ok(())
    }

    /// Stores `new` at `index` if the element there equals `expected`,
    /// returning the previous element either way.
    ///
    /// The swap linearizes at an internal pointer compare-and-swap; the loop
    /// below re-runs only when an element equal to `expected` was itself
    /// concurrently replaced.
    pub fn compare_and_swap<'g>(
        &self,
        index: usize,
        new: T,
        expected: &T,
        guard: &'g Guard,
    ) -> Result<&'g T, Error>
    where
        T: PartialEq,
    {
        let len = self.len();
        if index >= len {
            return Err(Error::OutOfBounds { index, len });
        }
        let storage = self.values.load(Ordering::Acquire, guard);
        let slot = &unsafe { storage.deref() }.slots[index];
        let mut new = Owned::new(new);
        loop {
            let current = slot.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.deref() };
            if current_ref != expected {
                return Ok(current_ref);
            }
            match slot.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return Ok(current_ref);
                }
                Err(raced) => new = raced.new,
            }
        }
    }

    /// Index of the first committed element equal to `item`.
    pub fn index_of(&self, item: &T, guard: &Guard) -> Option<usize>
    where
        T: PartialEq,
    {
        let len = self.len();
        let storage = self.values.load(Ordering::Acquire, guard);
        let slots = &unsafe { storage.deref() }.slots;
        for ix in 0..len {
            let elem = slots[ix].load(Ordering::Acquire, guard);
            if unsafe { elem.deref() } == item {
                return Some(ix);
            }
        }
        None
    }

    pub fn contains(&self, item: &T, guard: &Guard) -> bool
    where
        T: PartialEq,
    {
        self.index_of(item, guard).is_some()
    }

    /// Clones the committed prefix into `dst` starting at `offset`. Returns
    /// the number of elements copied.
    pub fn copy_to(&self, dst: &mut [T], offset: usize, guard: &Guard) -> Result<usize, Error>
    where
        T: Clone,
    {
        let len = self.len();
        if offset > dst.len() || dst.len() - offset < len {
            return Err(Error::InvalidRange {
                from: offset,
                to: offset + len,
            });
        }
        let storage = self.values.load(Ordering::Acquire, guard);
        let slots = &unsafe { storage.deref() }.slots;
        for ix in 0..len {
            let elem = slots[ix].load(Ordering::Acquire, guard);
            dst[offset + ix] = unsafe { elem.deref() }.clone();
        }
        Ok(len)
    }

    /// Snapshot iterator over the committed prefix.
    pub fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, T> {
        self.bounded(0, usize::MAX, guard)
    }

    /// Snapshot iterator over indices `from..=to`, clipped to the committed
    /// prefix. Fails when the range is inverted.
    pub fn range<'g>(&self, from: usize, to: usize, guard: &'g Guard) -> Result<Iter<'g, T>, Error> {
        if from > to {
            return Err(Error::InvalidRange { from, to });
        }
        Ok(self.bounded(from, to, guard))
    }

    fn bounded<'g>(&self, from: usize, to: usize, guard: &'g Guard) -> Iter<'g, T> {
        // Bounds and generation are sampled once; later growth is invisible
        // to the iterator.
        let len = self.len();
        let storage = self.values.load(Ordering::Acquire, guard);
        let slots = &unsafe { storage.deref() }.slots[..];
        let end = cmp::min(to.saturating_add(1), len);
        Iter {
            slots,
            index: cmp::min(from, end),
            end,
            guard,
        }
    }

    /// Removal is not part of the mutation set.
    pub fn remove(&self, _index: usize) -> Result<T, Error> {
        Err(Error::Unsupported("remove"))
    }

    /// Positional insertion is not part of the mutation set.
    pub fn insert(&self, _index: usize, _item: T) -> Result<(), Error> {
        Err(Error::Unsupported("insert"))
    }

    /// Clearing is not part of the mutation set.
    pub fn clear(&self) -> Result<(), Error> {
        Err(Error::Unsupported("clear"))
    }
}

impl<T> Default for GrowList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for GrowList<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let guard = epoch::pin();
        write!(
            f,
            "GrowList {{ len: {}, capacity: {} }}",
            self.len(),
            self.capacity(&guard)
        )
    }
}

impl<T> Drop for GrowList<T> {
    fn drop(&mut self) {
        // Exclusive access (&mut), so a dummy guard suffices.
        let guard = unsafe { epoch::unprotected() };
        let storage = self.values.load(Ordering::Relaxed, guard);
        let occupied = self.occupied.load(Ordering::Relaxed, guard);
        unsafe {
            drop(storage.into_owned());
            drop(occupied.into_owned());
        }
    }
}

/// Snapshot iterator over a [`GrowList`]. Yields references valid for the
/// lifetime of the guard it was created with.
pub struct Iter<'g, T> {
    slots: &'g [Atomic<T>],
    index: usize,
    end: usize,
    guard: &'g Guard,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        if self.index >= self.end {
            return None;
        }
        let elem = self.slots[self.index].load(Ordering::Acquire, self.guard);
        self.index += 1;
        // Committed slots are always populated.
        Some(unsafe { elem.deref() })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.index;
        (remaining, Some(remaining))
    }
}

impl<'g, T> ExactSizeIterator for Iter<'g, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn single_threaded_fill_from_capacity_one() {
        let list = GrowList::with_capacity(1);
        let guard = epoch::pin();
        for i in 0..1000usize {
            assert_eq!(list.append(i, &guard).unwrap(), i);
        }
        assert_eq!(list.len(), 1000);
        for i in 0..1000usize {
            assert_eq!(list.get(i, &guard), Ok(&i));
        }
    }

    #[test]
    fn indices_are_dense_and_unique() {
        let nthreads = 8;
        let per_thread = 1000;
        let list = Arc::new(GrowList::new());
        let barrier = Arc::new(Barrier::new(nthreads + 1));
        let (sender, receiver) = channel();
        let mut threads = Vec::new();
        for t in 0..nthreads {
            let (list, barrier, sender) = (list.clone(), barrier.clone(), sender.clone());
            threads.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let ix = list.append(t * per_thread + i, &epoch::pin()).unwrap();
                    sender.send(ix).expect("channel send should succeed");
                }
            }));
        }
        barrier.wait();
        for t in threads {
            t.join().expect("appender should exit cleanly");
        }
        drop(sender);

        let mut indices: Vec<usize> = receiver.iter().collect();
        indices.sort();
        let expected: Vec<usize> = (0..nthreads * per_thread).collect();
        assert_eq!(indices, expected);
        assert_eq!(list.len(), nthreads * per_thread);
    }

    #[test]
    fn many_threads_no_lost_appends() {
        let _ = env_logger::builder().is_test(true).try_init();
        let nthreads = 16;
        let per_thread = 10_000;
        let list = Arc::new(GrowList::with_capacity(16));
        let barrier = Arc::new(Barrier::new(nthreads + 1));
        let mut threads = Vec::new();
        for t in 0..nthreads {
            let (list, barrier) = (list.clone(), barrier.clone());
            threads.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    list.append(t, &epoch::pin()).unwrap();
                }
            }));
        }
        barrier.wait();
        for t in threads {
            t.join().expect("appender should exit cleanly");
        }

        assert_eq!(list.len(), nthreads * per_thread);
        let guard = epoch::pin();
        let mut counts = vec![0usize; nthreads];
        for v in list.iter(&guard) {
            counts[*v] += 1;
        }
        for (v, n) in counts.iter().enumerate() {
            assert_eq!(*n, per_thread, "value {} appeared {} times", v, n);
        }
    }

    #[test]
    fn growth_doubles_capacity() {
        let _ = env_logger::builder().is_test(true).try_init();
        let nthreads = 2;
        let per_thread = 500;
        let list = Arc::new(GrowList::with_capacity(4));
        let barrier = Arc::new(Barrier::new(nthreads + 1));
        let mut threads = Vec::new();
        for t in 0..nthreads {
            let (list, barrier) = (list.clone(), barrier.clone());
            threads.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    list.append(t * per_thread + i, &epoch::pin()).unwrap();
                }
            }));
        }
        barrier.wait();
        for t in threads {
            t.join().expect("appender should exit cleanly");
        }

        let guard = epoch::pin();
        let capacity = list.capacity(&guard);
        assert!(capacity >= nthreads * per_thread);
        assert!(capacity.is_power_of_two());
    }

    #[test]
    fn growth_preserves_values() {
        let list = GrowList::with_capacity(4);
        for i in 0..4usize {
            list.push(i).unwrap();
        }
        // force several doublings past the values already in place
        for i in 4..64usize {
            list.push(i).unwrap();
        }
        let guard = epoch::pin();
        for i in 0..64usize {
            assert_eq!(list.get(i, &guard), Ok(&i));
        }
    }

    #[test]
    fn set_and_compare_and_swap() {
        let list = GrowList::new();
        let guard = epoch::pin();
        for i in 0..10usize {
            list.append(i, &guard).unwrap();
        }

        list.set(3, 33, &guard).unwrap();
        assert_eq!(list.get(3, &guard), Ok(&33));

        // a successful swap reports the element it displaced
        assert_eq!(list.compare_and_swap(3, 44, &33, &guard), Ok(&33));
        assert_eq!(list.get(3, &guard), Ok(&44));

        // a failed swap leaves the slot alone and reports what was there
        assert_eq!(list.compare_and_swap(3, 55, &99, &guard), Ok(&44));
        assert_eq!(list.get(3, &guard), Ok(&44));

        let oob = Error::OutOfBounds { index: 10, len: 10 };
        assert_eq!(list.set(10, 1, &guard), Err(oob));
        assert_eq!(list.get(10, &guard), Err(oob));
        assert_eq!(list.compare_and_swap(10, 1, &0, &guard), Err(oob));
    }

    #[test]
    fn membership_queries() {
        let list = GrowList::new();
        let guard = epoch::pin();
        for i in 0..5usize {
            list.append(i * 2, &guard).unwrap();
        }
        assert!(list.contains(&6, &guard));
        assert_eq!(list.index_of(&6, &guard), Some(3));
        assert_eq!(list.index_of(&7, &guard), None);
        assert!(!list.contains(&7, &guard));
    }

    #[test]
    fn snapshot_iteration_bounds() {
        let list = GrowList::new();
        let guard = epoch::pin();
        for i in 0..10usize {
            list.append(i, &guard).unwrap();
        }

        let all: Vec<usize> = list.iter(&guard).cloned().collect();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(list.iter(&guard).len(), 10);

        let mid: Vec<usize> = list.range(2, 5, &guard).unwrap().cloned().collect();
        assert_eq!(mid, vec![2, 3, 4, 5]);

        // an upper bound past the committed prefix is clipped
        let tail: Vec<usize> = list
            .range(8, usize::MAX, &guard)
            .unwrap()
            .cloned()
            .collect();
        assert_eq!(tail, vec![8, 9]);

        assert_eq!(
            list.range(5, 2, &guard).err(),
            Some(Error::InvalidRange { from: 5, to: 2 })
        );
        assert_eq!(list.range(10, 20, &guard).unwrap().count(), 0);
    }

    #[test]
    fn copy_to_buffer() {
        let list = GrowList::new();
        let guard = epoch::pin();
        for i in 0..4usize {
            list.append(i + 1, &guard).unwrap();
        }
        let mut buf = vec![0usize; 6];
        assert_eq!(list.copy_to(&mut buf, 2, &guard), Ok(4));
        assert_eq!(buf, vec![0, 0, 1, 2, 3, 4]);

        let mut small = vec![0usize; 3];
        assert!(list.copy_to(&mut small, 0, &guard).is_err());
    }

    #[test]
    fn mutations_other_than_append_set_cas_fail() {
        let list: GrowList<usize> = GrowList::new();
        assert_eq!(list.remove(0), Err(Error::Unsupported("remove")));
        assert_eq!(list.insert(0, 1), Err(Error::Unsupported("insert")));
        assert_eq!(list.clear(), Err(Error::Unsupported("clear")));
    }

    #[test]
    fn append_all_bulk() {
        let list = GrowList::with_capacity(2);
        list.append_all(0..100usize).unwrap();
        assert_eq!(list.len(), 100);
        let guard = epoch::pin();
        assert_eq!(list.iter(&guard).cloned().sum::<usize>(), 4950);
    }
}
