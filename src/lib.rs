// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod macros;

pub use crate::core::{
    workers_for_hardware_threads, CompilationJob, Compile, CompilerBuilder, CompilerStats,
    CpuPinningPolicy, PipelineCompiler, WorkerCount,
};

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::{Arc, Barrier, Condvar, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Upper bound on how long a test waits for jobs to complete.
    const TIMEOUT: Duration = Duration::from_secs(30);

    /// Records which pipelines were compiled, in completion order, and how
    /// many compilations ran concurrently.
    #[derive(Default)]
    struct Tracker {
        completed: Mutex<Vec<usize>>,
        completed_cond: Condvar,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Tracker {
        fn enter(&self) {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
        }

        fn leave(&self, id: usize) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.lock().unwrap().push(id);
            self.completed_cond.notify_all();
        }

        /// Waits until `count` compilations have completed and returns their
        /// ids in completion order.
        fn wait_for(&self, count: usize) -> Vec<usize> {
            let (completed, result) = self
                .completed_cond
                .wait_timeout_while(self.completed.lock().unwrap(), TIMEOUT, |completed| {
                    completed.len() < count
                })
                .unwrap();
            assert!(
                !result.timed_out(),
                "only {} out of {count} jobs completed",
                completed.len()
            );
            completed.clone()
        }

        fn completed(&self) -> Vec<usize> {
            self.completed.lock().unwrap().clone()
        }
    }

    /// Pipeline whose compilation takes the duration given as instance.
    struct TrackedPipeline {
        id: usize,
        tracker: Arc<Tracker>,
    }

    impl TrackedPipeline {
        fn new(id: usize, tracker: &Arc<Tracker>) -> Arc<Self> {
            Arc::new(Self {
                id,
                tracker: tracker.clone(),
            })
        }
    }

    impl Compile for TrackedPipeline {
        type Instance = Duration;
        type Context = ();

        fn compile_instance(&self, duration: &Duration, _context: ()) {
            self.tracker.enter();
            if !duration.is_zero() {
                thread::sleep(*duration);
            }
            self.tracker.leave(self.id);
        }
    }

    /// Pipeline whose compilations all wait for each other.
    struct RendezvousPipeline {
        barrier: Barrier,
        tracker: Arc<Tracker>,
    }

    impl Compile for RendezvousPipeline {
        type Instance = usize;
        type Context = ();

        fn compile_instance(&self, id: &usize, _context: ()) {
            self.tracker.enter();
            self.barrier.wait();
            self.tracker.leave(*id);
        }
    }

    /// Pipeline reporting each compilation it starts. Gated compilations then
    /// block until released by the test.
    struct GatedPipeline {
        started: Mutex<Sender<usize>>,
        release: Mutex<Receiver<()>>,
    }

    impl Compile for GatedPipeline {
        /// Id of the job and whether it is gated.
        type Instance = (usize, bool);
        type Context = ();

        fn compile_instance(&self, &(id, gated): &(usize, bool), _context: ()) {
            self.started.lock().unwrap().send(id).unwrap();
            if gated {
                self.release.lock().unwrap().recv().unwrap();
            }
        }
    }

    /// Pipeline whose compilation panics on odd instances below 100. Instances
    /// from 100 on wait for each other.
    struct FlakyPipeline {
        barrier: Barrier,
        tracker: Arc<Tracker>,
    }

    impl Compile for FlakyPipeline {
        type Instance = usize;
        type Context = ();

        fn compile_instance(&self, &id: &usize, _context: ()) {
            if id < 100 && id % 2 == 1 {
                panic!("driver rejected pipeline {id}");
            }
            self.tracker.enter();
            if id >= 100 {
                self.barrier.wait();
            }
            self.tracker.leave(id);
        }
    }

    fn build<T: Compile>(num_workers: usize) -> PipelineCompiler<T> {
        CompilerBuilder {
            num_workers: WorkerCount::try_from(num_workers).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
            thread_name: "test-pcompiler".to_owned(),
        }
        .build()
        .unwrap()
    }

    /// Polls the given condition until it holds, or panics after [`TIMEOUT`].
    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            thread::sleep(Duration::from_millis(1));
        }
    }

    macro_rules! expand_tests {
        ( $num_workers:expr, ) => {};
        ( $num_workers:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($num_workers);
            }

            expand_tests!($num_workers, $($others)*);
        };
    }

    macro_rules! worker_count_tests {
        ( $mod:ident, $num_workers:expr ) => {
            mod $mod {
                expand_tests!(
                    $num_workers,
                    test_compiles_all_jobs,
                    test_no_lost_wakeups,
                    test_no_lost_wakeups_with_bursts,
                    test_parallelism_bound,
                    test_drop_idle_is_prompt,
                    test_drop_with_pending_jobs,
                    test_multiple_producers,
                    test_panic_keeps_workers_alive,
                );
            }
        };
    }

    worker_count_tests!(one_worker, 1);
    worker_count_tests!(two_workers, 2);
    worker_count_tests!(four_workers, 4);
    worker_count_tests!(eight_workers, 8);

    #[test]
    fn test_single_worker_preserves_order() {
        let tracker = Arc::new(Tracker::default());
        let compiler = build(1);

        for id in 0..1000 {
            compiler.submit(TrackedPipeline::new(id, &tracker), Arc::new(Duration::ZERO), ());
        }

        assert_eq!(tracker.wait_for(1000), (0..1000).collect::<Vec<_>>());
        assert_eq!(tracker.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_worker_preserves_order_of_each_producer() {
        const PRODUCERS: usize = 4;
        const JOBS_PER_PRODUCER: usize = 250;

        let tracker = Arc::new(Tracker::default());
        let compiler = build(1);

        thread::scope(|scope| {
            for producer in 0..PRODUCERS {
                let compiler = &compiler;
                let tracker = &tracker;
                scope.spawn(move || {
                    for i in 0..JOBS_PER_PRODUCER {
                        let id = producer * JOBS_PER_PRODUCER + i;
                        compiler.submit(
                            TrackedPipeline::new(id, tracker),
                            Arc::new(Duration::ZERO),
                            (),
                        );
                    }
                });
            }
        });

        let completed = tracker.wait_for(PRODUCERS * JOBS_PER_PRODUCER);
        for producer in 0..PRODUCERS {
            let ids = completed
                .iter()
                .copied()
                .filter(|id| id / JOBS_PER_PRODUCER == producer)
                .collect::<Vec<_>>();
            let expected = (producer * JOBS_PER_PRODUCER..(producer + 1) * JOBS_PER_PRODUCER)
                .collect::<Vec<_>>();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_shared_handles_released_after_shutdown() {
        let tracker = Arc::new(Tracker::default());
        let pipeline = TrackedPipeline::new(0, &tracker);
        let instance = Arc::new(Duration::ZERO);

        let compiler = build(4);
        for _ in 0..100 {
            compiler.submit(pipeline.clone(), instance.clone(), ());
        }
        tracker.wait_for(100);
        drop(compiler);

        assert_eq!(Arc::strong_count(&pipeline), 1);
        assert_eq!(Arc::strong_count(&instance), 1);
    }

    #[test]
    fn test_submit_job() {
        let tracker = Arc::new(Tracker::default());
        let compiler = build(2);

        compiler.submit_job(CompilationJob::new(
            TrackedPipeline::new(7, &tracker),
            Arc::new(Duration::ZERO),
            (),
        ));

        assert_eq!(tracker.wait_for(1), vec![7]);
        assert_eq!(compiler.stats().submitted, 1);
    }

    fn test_compiles_all_jobs(num_workers: usize) {
        let tracker = Arc::new(Tracker::default());
        let compiler = build(num_workers);

        for id in 0..500 {
            compiler.submit(TrackedPipeline::new(id, &tracker), Arc::new(Duration::ZERO), ());
        }

        let mut completed = tracker.wait_for(500);
        completed.sort_unstable();
        assert_eq!(completed, (0..500).collect::<Vec<_>>());

        wait_until(|| compiler.stats().compiled == 500);
        let stats = compiler.stats();
        assert_eq!(stats.submitted, 500);
        assert_eq!(stats.panicked, 0);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(compiler.pending(), 0);
    }

    fn test_no_lost_wakeups(num_workers: usize) {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        let tracker = Arc::new(Tracker::default());
        let compiler = build(num_workers);

        // Random delays make the submissions land before, during and after the
        // workers go back to waiting for a job.
        for id in 0..300 {
            let delay = Duration::from_micros(rng.random_range(0..200));
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let compile_time = Duration::from_micros(rng.random_range(0..50));
            compiler.submit(TrackedPipeline::new(id, &tracker), Arc::new(compile_time), ());
            tracker.wait_for(id + 1);
        }
    }

    fn test_no_lost_wakeups_with_bursts(num_workers: usize) {
        const PRODUCERS: usize = 4;
        const BURSTS_PER_PRODUCER: usize = 50;

        let tracker = Arc::new(Tracker::default());
        let compiler = build(num_workers);
        let next_id = AtomicUsize::new(0);

        // Each burst holds up to one job per worker, all taking the same time,
        // so the workers go back to waiting together while other bursts land.
        thread::scope(|scope| {
            for producer in 0..PRODUCERS {
                let compiler = &compiler;
                let tracker = &tracker;
                let next_id = &next_id;
                scope.spawn(move || {
                    let mut rng = ChaCha12Rng::seed_from_u64(producer as u64);
                    for _ in 0..BURSTS_PER_PRODUCER {
                        let burst = rng.random_range(1..=num_workers);
                        let compile_time = Arc::new(Duration::from_micros(20));
                        for _ in 0..burst {
                            let id = next_id.fetch_add(1, Ordering::SeqCst);
                            compiler.submit(
                                TrackedPipeline::new(id, tracker),
                                compile_time.clone(),
                                (),
                            );
                        }
                        let delay = Duration::from_micros(rng.random_range(0..100));
                        if !delay.is_zero() {
                            thread::sleep(delay);
                        }
                    }
                });
            }
        });

        let total = next_id.load(Ordering::SeqCst);
        let mut completed = tracker.wait_for(total);
        completed.sort_unstable();
        assert_eq!(completed, (0..total).collect::<Vec<_>>());
        assert!(tracker.max_active.load(Ordering::SeqCst) <= num_workers);
    }

    fn test_parallelism_bound(num_workers: usize) {
        // Each of these compilations waits for all the others, so they can only
        // complete if they all run at the same time.
        let tracker = Arc::new(Tracker::default());
        let rendezvous = Arc::new(RendezvousPipeline {
            barrier: Barrier::new(num_workers),
            tracker: tracker.clone(),
        });
        let compiler = build(num_workers);

        for id in 0..num_workers {
            compiler.submit(rendezvous.clone(), Arc::new(id), ());
        }
        tracker.wait_for(num_workers);
        assert_eq!(tracker.max_active.load(Ordering::SeqCst), num_workers);
        drop(compiler);

        // Flooding the queue never runs more than one compilation per worker.
        let tracker = Arc::new(Tracker::default());
        let compiler = build(num_workers);
        for id in 0..8 * num_workers {
            compiler.submit(
                TrackedPipeline::new(id, &tracker),
                Arc::new(Duration::from_millis(2)),
                (),
            );
        }
        tracker.wait_for(8 * num_workers);
        assert!(tracker.max_active.load(Ordering::SeqCst) <= num_workers);
    }

    fn test_drop_idle_is_prompt(num_workers: usize) {
        let start = Instant::now();
        let compiler = build::<TrackedPipeline>(num_workers);
        assert_eq!(compiler.num_workers().get(), num_workers);
        drop(compiler);
        assert!(start.elapsed() < TIMEOUT);
    }

    fn test_drop_with_pending_jobs(num_workers: usize) {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let pipeline = Arc::new(GatedPipeline {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let compiler = build(num_workers);

        // Occupy every worker.
        for id in 0..num_workers {
            compiler.submit(pipeline.clone(), Arc::new((id, true)), ());
        }
        let mut started = (0..num_workers)
            .map(|_| started_rx.recv_timeout(TIMEOUT).unwrap())
            .collect::<Vec<_>>();
        started.sort_unstable();
        assert_eq!(started, (0..num_workers).collect::<Vec<_>>());

        // These jobs can't start until a gated compilation completes.
        for id in 0..10 {
            compiler.submit(pipeline.clone(), Arc::new((1000 + id, false)), ());
        }
        assert_eq!(compiler.pending(), 10);

        // Release the gated compilations only once the workers have been asked
        // to stop, so that none of them can take a queued job afterwards.
        let is_stopped = compiler.stop_observer();
        assert!(!is_stopped());
        let releaser = thread::spawn(move || {
            wait_until(is_stopped);
            for _ in 0..num_workers {
                release_tx.send(()).unwrap();
            }
        });
        drop(compiler);
        releaser.join().unwrap();

        // The in-flight compilations ran to completion, the queued ones were
        // discarded, and no worker holds a handle anymore.
        assert_eq!(started_rx.try_iter().count(), 0);
        assert_eq!(Arc::strong_count(&pipeline), 1);
    }

    fn test_multiple_producers(num_workers: usize) {
        const PRODUCERS: usize = 4;
        const JOBS_PER_PRODUCER: usize = 100;

        let tracker = Arc::new(Tracker::default());
        let compiler = Arc::new(build(num_workers));

        let producers = (0..PRODUCERS)
            .map(|producer| {
                let compiler = compiler.clone();
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for i in 0..JOBS_PER_PRODUCER {
                        compiler.submit(
                            TrackedPipeline::new(producer * JOBS_PER_PRODUCER + i, &tracker),
                            Arc::new(Duration::ZERO),
                            (),
                        );
                    }
                })
            })
            .collect::<Vec<_>>();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut completed = tracker.wait_for(PRODUCERS * JOBS_PER_PRODUCER);
        completed.sort_unstable();
        assert_eq!(completed, (0..PRODUCERS * JOBS_PER_PRODUCER).collect::<Vec<_>>());
        assert_eq!(
            compiler.stats().submitted,
            (PRODUCERS * JOBS_PER_PRODUCER) as u64
        );
    }

    fn test_panic_keeps_workers_alive(num_workers: usize) {
        let tracker = Arc::new(Tracker::default());
        let pipeline = Arc::new(FlakyPipeline {
            barrier: Barrier::new(num_workers),
            tracker: tracker.clone(),
        });
        let compiler = build(num_workers);

        for id in 0..20 {
            compiler.submit(pipeline.clone(), Arc::new(id), ());
        }

        let mut completed = tracker.wait_for(10);
        completed.sort_unstable();
        assert_eq!(completed, (0..20).step_by(2).collect::<Vec<_>>());

        wait_until(|| compiler.stats().outstanding() == 0);
        let stats = compiler.stats();
        assert_eq!(stats.compiled, 10);
        assert_eq!(stats.panicked, 10);

        // Every worker survived, so all of them can still compile concurrently.
        for id in 0..num_workers {
            compiler.submit(pipeline.clone(), Arc::new(100 + id), ());
        }
        tracker.wait_for(10 + num_workers);
    }
}
