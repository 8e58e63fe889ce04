// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool simulating a render loop that compiles pipeline variants in the
//! background, skipping draws whose pipeline isn't ready yet.

use clap::{Parser, ValueEnum};
use pipecompiler::{Compile, CompilerBuilder, CpuPinningPolicy, PipelineCompiler, WorkerCount};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let compiler: PipelineCompiler<ShaderPipeline> = CompilerBuilder {
        num_workers: match cli.num_workers {
            Some(num_workers) => WorkerCount::Count(num_workers),
            None => WorkerCount::HardwareHeadroom,
        },
        cpu_pinning: match cli.cpu_pinning {
            CpuPinningCli::No => CpuPinningPolicy::No,
            CpuPinningCli::IfSupported => CpuPinningPolicy::IfSupported,
            CpuPinningCli::Always => CpuPinningPolicy::Always,
        },
        thread_name: "pcompiler".to_owned(),
    }
    .build()
    .expect("Failed to start the compiler workers");
    println!("Compiling with {} workers", compiler.num_workers());

    let mut rng = ChaCha12Rng::seed_from_u64(cli.seed);
    let pipelines = (0..cli.pipelines)
        .map(|id| Arc::new(ShaderPipeline::new(id)))
        .collect::<Vec<_>>();
    let format = RenderPassFormat {
        color_format: 37,
        sample_count: 1,
    };

    let start = Instant::now();
    for frame in 0..cli.frames {
        let mut drawn = 0;
        let mut skipped = 0;
        for _ in 0..cli.draws_per_frame {
            let pipeline = &pipelines[rng.random_range(0..pipelines.len())];
            let state_hash = rng.random_range(0..cli.variants);
            if pipeline.is_compiled(state_hash) {
                drawn += 1;
                continue;
            }
            skipped += 1;
            if pipeline.mark_requested(state_hash) {
                let cost = Duration::from_micros(rng.random_range(0..=cli.max_compile_micros));
                compiler.submit(
                    pipeline.clone(),
                    Arc::new(PipelineState { state_hash, cost }),
                    format,
                );
            }
        }
        println!(
            "frame {frame}: drawn = {drawn}, skipped = {skipped}, pending = {}",
            compiler.pending()
        );
        std::thread::sleep(Duration::from_micros(cli.frame_micros));
    }

    let stats = compiler.stats();
    println!(
        "{} frames in {:?}: submitted = {}, compiled = {}, still outstanding = {}",
        cli.frames,
        start.elapsed(),
        stats.submitted,
        stats.compiled,
        stats.outstanding()
    );
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of compiler workers. Default to the available parallelism minus
    /// two.
    #[arg(long)]
    num_workers: Option<NonZeroUsize>,

    /// Policy to pin compiler workers to CPUs.
    #[arg(long, value_enum, default_value_t = CpuPinningCli::No)]
    cpu_pinning: CpuPinningCli,

    /// Number of frames to render.
    #[arg(long, default_value_t = 60)]
    frames: usize,

    /// Time spent on each frame besides issuing draws, in microseconds.
    #[arg(long, default_value_t = 16_000)]
    frame_micros: u64,

    /// Number of draws issued per frame.
    #[arg(long, default_value_t = 200)]
    draws_per_frame: usize,

    /// Number of distinct pipelines.
    #[arg(long, default_value_t = 16)]
    pipelines: usize,

    /// Number of state variants per pipeline.
    #[arg(long, default_value_t = 32)]
    variants: u64,

    /// Maximum time to compile one variant, in microseconds.
    #[arg(long, default_value_t = 20_000)]
    max_compile_micros: u64,

    /// Seed of the random draw sequence.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Policy to pin compiler workers to CPUs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CpuPinningCli {
    /// Don't pin workers.
    No,
    /// Pin workers if supported on this platform.
    IfSupported,
    /// Pin workers, failing if not supported on this platform.
    Always,
}

/// Pipeline state selecting one variant.
struct PipelineState {
    state_hash: u64,
    /// Simulated compilation time.
    cost: Duration,
}

#[derive(Clone, Copy)]
struct RenderPassFormat {
    color_format: u32,
    sample_count: u8,
}

/// A graphics pipeline caching its compiled variants.
struct ShaderPipeline {
    id: usize,
    compiled: Mutex<HashMap<u64, String>>,
    /// Variants already submitted. The compiler doesn't de-duplicate jobs.
    requested: Mutex<HashSet<u64>>,
}

impl ShaderPipeline {
    fn new(id: usize) -> Self {
        Self {
            id,
            compiled: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashSet::new()),
        }
    }

    fn is_compiled(&self, state_hash: u64) -> bool {
        self.compiled.lock().unwrap().contains_key(&state_hash)
    }

    /// Returns whether the variant wasn't requested before.
    fn mark_requested(&self, state_hash: u64) -> bool {
        self.requested.lock().unwrap().insert(state_hash)
    }
}

impl Compile for ShaderPipeline {
    type Instance = PipelineState;
    type Context = RenderPassFormat;

    fn compile_instance(&self, state: &PipelineState, format: RenderPassFormat) {
        std::thread::sleep(state.cost);
        let binary = format!(
            "pipeline {} variant {:#x} ({}x{})",
            self.id, state.state_hash, format.color_format, format.sample_count
        );
        self.compiled.lock().unwrap().insert(state.state_hash, binary);
    }
}
