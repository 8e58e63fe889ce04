// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job queue shared between producers and worker threads.

use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An unbounded FIFO of jobs, paired with a [`Condvar`] to wake up consumers
/// and a stop flag to release them at shutdown.
///
/// The stop flag is only ever set while holding the queue's [`Mutex`], and
/// consumers check it together with the queue length under that same
/// [`Mutex`]. Therefore a job pushed or a stop requested before a consumer
/// starts waiting is never missed.
pub struct JobQueue<J> {
    /// Whether the consumers have been asked to exit. Monotonic.
    stop: CachePadded<AtomicBool>,
    /// Pending jobs, in submission order.
    jobs: Mutex<VecDeque<J>>,
    /// Signaled when a job is pushed or when the stop flag is set.
    condvar: Condvar,
}

impl<J> Default for JobQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J> JobQueue<J> {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self {
            stop: CachePadded::new(AtomicBool::new(false)),
            jobs: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
        }
    }

    /// No user code ever runs while the lock is held, so a poisoned lock still
    /// guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, VecDeque<J>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a job at the tail of the queue and wakes up one waiting
    /// consumer, if any.
    pub fn submit(&self, job: J) {
        let mut jobs = self.lock();
        jobs.push_back(job);
        self.condvar.notify_one();
    }

    /// Waits until the queue is non-empty or the stop flag is set.
    ///
    /// Returns the head of the queue if there is one, even if the stop flag is
    /// set. Returns [`None`] only if the queue is empty and the stop flag is
    /// set.
    pub fn take(&self) -> Option<J> {
        let mut jobs = self
            .condvar
            .wait_while(self.lock(), |jobs| {
                jobs.is_empty() && !self.stop.load(Ordering::SeqCst)
            })
            .unwrap_or_else(PoisonError::into_inner);
        jobs.pop_front()
    }

    /// Sets the stop flag and wakes up all the waiting consumers.
    pub fn stop(&self) {
        {
            let _jobs = self.lock();
            self.stop.store(true, Ordering::SeqCst);
        }
        self.condvar.notify_all();
    }

    /// Returns whether [`stop()`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Returns the number of jobs waiting to be taken.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drops all the pending jobs and returns how many there were.
    pub fn discard(&self) -> usize {
        let jobs = std::mem::take(&mut *self.lock());
        // The jobs are dropped here, outside of the lock.
        jobs.len()
    }
}
