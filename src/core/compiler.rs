// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of worker threads compiling pipelines in the background.

use super::job::{CompilationJob, Compile};
use super::queue::JobQueue;
use super::stats::{CompilerStats, StatsCounters};
use crate::macros::{log_debug, log_error, log_info, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::convert::TryFrom;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

/// Number of hardware threads left free for the caller's own threads (e.g. the
/// render thread and the driver's submission thread) when sizing the pool
/// after the hardware.
const RESERVED_HARDWARE_THREADS: usize = 2;

/// Number of worker threads to spawn in a compiler pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCount {
    /// Spawn one worker per hardware thread returned by
    /// [`std::thread::available_parallelism()`], minus two threads reserved
    /// for the rest of the application, and at least one worker.
    ///
    /// See [`workers_for_hardware_threads()`].
    HardwareHeadroom,
    /// Spawn the given number of workers.
    Count(NonZeroUsize),
}

impl WorkerCount {
    /// Resolves the number of workers to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            WorkerCount::HardwareHeadroom => workers_for_hardware_threads(hardware_threads()),
            WorkerCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for WorkerCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(worker_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(worker_count)?;
        Ok(WorkerCount::Count(count))
    }
}

/// Returns the number of workers to spawn on a host with the given number of
/// hardware threads: `max(1, hardware_threads - 2)`.
///
/// ```
/// # use pipecompiler::workers_for_hardware_threads;
/// # use std::num::NonZeroUsize;
/// let workers = |n| workers_for_hardware_threads(NonZeroUsize::new(n).unwrap()).get();
/// assert_eq!(workers(2), 1);
/// assert_eq!(workers(8), 6);
/// ```
pub fn workers_for_hardware_threads(hardware_threads: NonZeroUsize) -> NonZeroUsize {
    NonZeroUsize::new(hardware_threads.get().saturating_sub(RESERVED_HARDWARE_THREADS))
        .unwrap_or(NonZeroUsize::MIN)
}

/// Queries the number of hardware threads, assuming a single one if the
/// platform can't tell.
fn hardware_threads() -> NonZeroUsize {
    match std::thread::available_parallelism() {
        Ok(count) => count,
        Err(_e) => {
            log_warn!("Failed to query the available parallelism, assuming 1 hardware thread: {_e}");
            NonZeroUsize::MIN
        }
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a compiler pool will panic. If
    /// a worker fails to pin itself, building the pool returns an error.
    Always,
}

/// A builder for [`PipelineCompiler`].
#[derive(Clone, Debug)]
pub struct CompilerBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_workers: WorkerCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Prefix of the worker thread names. Worker `i` is named
    /// `"{thread_name}-{i}"`.
    pub thread_name: String,
}

impl Default for CompilerBuilder {
    fn default() -> Self {
        Self {
            num_workers: WorkerCount::HardwareHeadroom,
            cpu_pinning: CpuPinningPolicy::No,
            thread_name: "pcompiler".to_owned(),
        }
    }
}

impl CompilerBuilder {
    /// Spawns a compiler pool.
    ///
    /// Fails if a worker thread couldn't be spawned, or couldn't be pinned to
    /// its CPU under [`CpuPinningPolicy::Always`]. In that case the workers
    /// spawned so far are stopped and joined before returning.
    ///
    /// ```
    /// # use pipecompiler::{Compile, CompilerBuilder, CpuPinningPolicy, WorkerCount};
    /// # use std::sync::Arc;
    /// # use std::sync::atomic::{AtomicU32, Ordering};
    /// struct Pipeline(AtomicU32);
    ///
    /// impl Compile for Pipeline {
    ///     type Instance = u32;
    ///     type Context = ();
    ///
    ///     fn compile_instance(&self, instance: &u32, _format: ()) {
    ///         self.0.fetch_add(*instance, Ordering::Relaxed);
    ///     }
    /// }
    ///
    /// let compiler = CompilerBuilder {
    ///     num_workers: WorkerCount::HardwareHeadroom,
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     thread_name: "pcompiler".to_owned(),
    /// }
    /// .build::<Pipeline>()
    /// .unwrap();
    ///
    /// let pipeline = Arc::new(Pipeline(AtomicU32::new(0)));
    /// compiler.submit(pipeline.clone(), Arc::new(1), ());
    /// compiler.submit(pipeline.clone(), Arc::new(2), ());
    /// ```
    pub fn build<T: Compile>(&self) -> io::Result<PipelineCompiler<T>> {
        PipelineCompiler::new(self)
    }
}

/// An asynchronous compiler of [`Compile`] objects, backed by a fixed pool of
/// worker threads.
///
/// Jobs are dequeued in submission order and compiled outside of any lock, so
/// that up to [`num_workers()`](Self::num_workers) compilations run in
/// parallel. With more than one worker, jobs may complete out of order.
///
/// Dropping the compiler stops and joins all the workers. Jobs being compiled
/// at that point run to completion, while jobs still in the queue are
/// discarded without being compiled.
pub struct PipelineCompiler<T: Compile> {
    /// Number of worker threads requested for this pool.
    num_workers: NonZeroUsize,
    /// Handles to all the worker threads in the pool.
    workers: Vec<WorkerThreadHandle>,
    /// Context shared between the producers and the worker threads.
    shared: Arc<SharedContext<T>>,
}

/// Handle to a worker thread in a compiler pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// Context shared between the producers and the worker threads.
struct SharedContext<T: Compile> {
    /// Pending jobs.
    queue: JobQueue<CompilationJob<T>>,
    /// Work statistics.
    stats: StatsCounters,
}

impl<T: Compile> PipelineCompiler<T> {
    /// Creates a new compiler pool using the given parameters.
    fn new(builder: &CompilerBuilder) -> io::Result<Self> {
        let num_workers = builder.num_workers.count();
        log_info!("PipelineCompiler: Using {num_workers} workers");

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match builder.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        // Constructed before spawning, so that an early return drops it, which
        // stops and joins the workers spawned so far.
        let mut compiler = Self {
            num_workers,
            workers: Vec::with_capacity(num_workers.get()),
            shared: Arc::new(SharedContext {
                queue: JobQueue::default(),
                stats: StatsCounters::default(),
            }),
        };

        // Each worker reports whether it could be pinned before waiting for
        // jobs, so that the pool never runs with fewer workers than requested.
        let (pinned_tx, pinned_rx) = mpsc::channel();
        for id in 0..num_workers.get() {
            let context = WorkerContext {
                id,
                shared: compiler.shared.clone(),
            };
            let cpu_pinning = builder.cpu_pinning;
            let pinned_tx = pinned_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{id}", builder.thread_name))
                .spawn(move || {
                    let pinned = pin_current_thread(id, cpu_pinning);
                    let is_pinned = pinned.is_ok();
                    // The receiver is gone if spawning a later worker failed.
                    let _ = pinned_tx.send((id, pinned));
                    drop(pinned_tx);
                    if is_pinned {
                        context.run()
                    }
                });
            match handle {
                Ok(handle) => compiler.workers.push(WorkerThreadHandle { handle }),
                Err(e) => {
                    log_error!("[main thread] Failed to spawn compiler worker #{id}: {e}");
                    return Err(e);
                }
            }
        }
        drop(pinned_tx);
        log_debug!("[main thread] Spawned compiler workers");

        for _ in 0..num_workers.get() {
            match pinned_rx.recv() {
                Ok((_, Ok(()))) => (),
                Ok((id, Err(e))) => {
                    log_error!("[main thread] Failed to pin compiler worker #{id}: {e}");
                    return Err(io::Error::new(
                        e.kind(),
                        format!("Failed to set CPU affinity for worker #{id}: {e}"),
                    ));
                }
                Err(_) => {
                    log_error!("[main thread] A compiler worker exited before starting");
                    return Err(io::Error::other("a compiler worker exited before starting"));
                }
            }
        }

        Ok(compiler)
    }

    /// Returns the number of worker threads that have been spawned in this
    /// pool.
    pub fn num_workers(&self) -> NonZeroUsize {
        self.num_workers
    }

    /// Queues the compilation of `instance` of `target`, with the given
    /// `context`.
    ///
    /// This returns immediately and wakes up one idle worker, if any. There is
    /// no way to wait for the compilation: the target is responsible for
    /// publishing the result.
    pub fn submit(&self, target: Arc<T>, instance: Arc<T::Instance>, context: T::Context) {
        self.submit_job(CompilationJob::new(target, instance, context));
    }

    /// Queues an already assembled job. See [`submit()`](Self::submit).
    pub fn submit_job(&self, job: CompilationJob<T>) {
        self.shared.stats.record_submitted();
        self.shared.queue.submit(job);
    }

    /// Returns the number of jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns a snapshot of the work statistics of this pool.
    pub fn stats(&self) -> CompilerStats {
        self.shared.stats.snapshot()
    }

    /// Returns a function telling whether the workers have been asked to
    /// stop, which keeps working while this pool is being dropped.
    #[cfg(test)]
    pub(crate) fn stop_observer(&self) -> impl Fn() -> bool + Send + 'static {
        let shared = self.shared.clone();
        move || shared.queue.is_stopped()
    }
}

impl<T: Compile> Drop for PipelineCompiler<T> {
    /// Stops and joins all the workers, then discards the pending jobs.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying compiler workers to stop...");
        self.shared.queue.stop();

        log_debug!("[main thread] Joining compiler workers...");
        for (_i, t) in self.workers.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Worker {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Worker {_i} joined with result: {result:?}"),
            }
        }

        let _discarded = self.shared.queue.discard();
        log_debug!("[main thread] Joined compiler workers, discarded {_discarded} pending jobs.");

        #[cfg(feature = "log_statistics")]
        {
            let stats = self.shared.stats.snapshot();
            log_info!(
                "PipelineCompiler: {} jobs submitted, {} compiled, {} panicked, {} discarded",
                stats.submitted,
                stats.compiled,
                stats.panicked,
                _discarded
            );
        }
    }
}

/// Context object owned by a worker thread.
struct WorkerContext<T: Compile> {
    /// Worker index.
    id: usize,
    /// Context shared with the producers and the other workers.
    shared: Arc<SharedContext<T>>,
}

impl<T: Compile> WorkerContext<T> {
    /// Main function run by this thread.
    fn run(&self) {
        log_debug!("[worker {}] Waiting for jobs", self.id);
        while !self.shared.queue.is_stopped() {
            // `None` means that the stop flag was set while the queue was empty.
            if let Some(job) = self.shared.queue.take() {
                self.execute(job);
            }
        }
        log_debug!("[worker {}] Received stop signal", self.id);
    }

    /// Compiles the given job, without holding any lock.
    fn execute(&self, job: CompilationJob<T>) {
        match catch_unwind(AssertUnwindSafe(|| job.execute())) {
            Ok(()) => self.shared.stats.record_compiled(),
            Err(_) => {
                self.shared.stats.record_panicked();
                log_error!("[worker {}] Compilation panicked, dropping the job", self.id);
            }
        }
    }
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) -> io::Result<()> {
    let pin = || -> nix::Result<()> {
        let mut cpu_set = CpuSet::new();
        cpu_set.set(id)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    };
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => match pin() {
            Ok(()) => log_debug!("Pinned worker #{id} to CPU #{id}"),
            Err(_e) => log_warn!("Failed to set CPU affinity for worker #{id}: {_e}"),
        },
        CpuPinningPolicy::Always => {
            pin()?;
            log_debug!("Pinned worker #{id} to CPU #{id}");
        }
    }
    Ok(())
}

// Unsupported policies are reported when building the pool.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) -> io::Result<()> {
    Ok(())
}
