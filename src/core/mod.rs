// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: job queue, worker pool and work statistics.

mod compiler;
mod job;
mod queue;
mod stats;

pub use compiler::{
    workers_for_hardware_threads, CompilerBuilder, CpuPinningPolicy, PipelineCompiler,
    WorkerCount,
};
pub use job::{CompilationJob, Compile};
pub use stats::CompilerStats;
