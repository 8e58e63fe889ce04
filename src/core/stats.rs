// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Counters of the work processed by a compiler pool.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the counters of a [`PipelineCompiler`](crate::PipelineCompiler).
///
/// Counters are read one after the other, so a snapshot taken while jobs are
/// in flight may miss jobs submitted or completed during the read. A job is
/// never counted as completed without also being counted as submitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompilerStats {
    /// Number of jobs submitted so far.
    pub submitted: u64,
    /// Number of jobs whose compilation returned normally.
    pub compiled: u64,
    /// Number of jobs whose compilation panicked.
    pub panicked: u64,
}

impl CompilerStats {
    /// Number of jobs that were submitted but haven't finished executing,
    /// whether they are still queued or running.
    pub fn outstanding(&self) -> u64 {
        self.submitted - self.compiled - self.panicked
    }
}

/// Lock-free counters, each on its own cache line since producers and workers
/// update them from different threads.
#[derive(Default)]
pub struct StatsCounters {
    submitted: CachePadded<AtomicU64>,
    compiled: CachePadded<AtomicU64>,
    panicked: CachePadded<AtomicU64>,
}

impl StatsCounters {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_compiled(&self) {
        self.compiled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::SeqCst);
    }

    /// Reads the counters. Completion counters are read before the submission
    /// counter, so that [`CompilerStats::outstanding()`] never underflows.
    pub fn snapshot(&self) -> CompilerStats {
        let compiled = self.compiled.load(Ordering::SeqCst);
        let panicked = self.panicked.load(Ordering::SeqCst);
        let submitted = self.submitted.load(Ordering::SeqCst);
        CompilerStats {
            submitted,
            compiled,
            panicked,
        }
    }
}
