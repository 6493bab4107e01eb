// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Throughput microbenchmarks for the two containers, sweeping thread counts
//! up to the number of cores.

use std::sync::{Arc, Barrier};
use std::time;

use crossbeam_epoch as epoch;
use plenum::{BufferedQueue, GrowList};

struct WorkloadStats {
    nthreads: usize,
    total_ops: usize,
    time_nsecs: u64,
    description: String,
}

impl WorkloadStats {
    fn print(&self) {
        println!(
            "{}: {} threads, {:.1} Mops/s",
            self.description,
            self.nthreads,
            (self.total_ops as f64 * 1000.0) / (self.time_nsecs as f64)
        );
    }
}

fn since_then(i: time::Instant) -> u64 {
    let dur = i.elapsed();
    (dur.as_secs() * 1_000_000_000) + u64::from(dur.subsec_nanos())
}

/// All threads append; throughput includes growth.
fn append_throughput(nthreads: usize, per_thread: usize) -> WorkloadStats {
    let list = Arc::new(GrowList::with_capacity(1024));
    let barrier = Arc::new(Barrier::new(nthreads + 1));
    let mut threads = Vec::new();
    for t in 0..nthreads {
        let (list, barrier) = (list.clone(), barrier.clone());
        threads.push(std::thread::spawn(move || {
            barrier.wait();
            let start = time::Instant::now();
            for i in 0..per_thread {
                list.append(t * per_thread + i, &epoch::pin()).unwrap();
            }
            since_then(start)
        }));
    }
    barrier.wait();
    let mut total_nsecs = 0;
    for t in threads {
        total_nsecs += t.join().unwrap();
    }
    WorkloadStats {
        nthreads,
        total_ops: nthreads * per_thread,
        time_nsecs: total_nsecs / nthreads as u64,
        description: "grow_list::append".to_string(),
    }
}

/// Paired enqueue/dequeue per thread with a warm-up period, in the style of
/// the classic enqueuers-dequeuers microbenchmark.
fn enqueue_dequeue_pairs(npairs: usize, per_thread: usize) -> WorkloadStats {
    let queue = Arc::new(BufferedQueue::new());
    let barrier = Arc::new(Barrier::new(npairs * 2 + 1));
    let mut threads = Vec::new();
    for t in 0..(npairs * 2) {
        let (queue, barrier) = (queue.clone(), barrier.clone());
        threads.push(std::thread::spawn(move || {
            barrier.wait();
            for i in 0..(per_thread / 2) {
                queue.enqueue(t * per_thread + i, &epoch::pin());
                let _ = queue.pop();
            }
            let start = time::Instant::now();
            for i in 0..per_thread {
                queue.enqueue(t * per_thread + i, &epoch::pin());
                let _ = queue.pop();
            }
            since_then(start)
        }));
    }
    barrier.wait();
    let mut total_nsecs = 0;
    for t in threads {
        total_nsecs += t.join().unwrap();
    }
    WorkloadStats {
        nthreads: npairs * 2,
        total_ops: npairs * 2 * per_thread * 2,
        time_nsecs: total_nsecs / (npairs * 2) as u64,
        description: "buffered_queue::enqueue_dequeue_pairs".to_string(),
    }
}

fn main() {
    let max_threads = num_cpus::get();
    let mut nthreads = 1;
    while nthreads <= max_threads {
        append_throughput(nthreads, 1 << 20).print();
        nthreads *= 2;
    }
    let mut npairs = 1;
    while npairs * 2 <= max_threads {
        enqueue_dequeue_pairs(npairs, 1 << 18).print();
        npairs *= 2;
    }
}
