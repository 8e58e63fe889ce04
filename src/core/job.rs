// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Compilation jobs and the trait implemented by objects that can be compiled
//! in the background.

use std::sync::Arc;

/// An object whose instances can be compiled on a worker thread.
///
/// This is typically a graphics pipeline: the [`Instance`](Self::Instance)
/// holds the state-specific variant to build, and the
/// [`Context`](Self::Context) describes ambient configuration such as the
/// render pass format.
///
/// Compilation is treated as infallible by the
/// [`PipelineCompiler`](crate::PipelineCompiler). Failures must be handled by
/// the implementation (e.g. by caching a fallback or recording the error).
/// A panic escaping [`compile_instance()`](Self::compile_instance) is caught
/// and counted, and doesn't stop the worker thread.
///
/// Two jobs referencing the same target may run concurrently on different
/// worker threads. Implementations that must not compile the same instance
/// twice need to serialize or de-duplicate internally.
///
/// ```
/// # use pipecompiler::Compile;
/// # use std::sync::Mutex;
/// struct Pipeline {
///     compiled: Mutex<Vec<(u32, u32)>>,
/// }
///
/// impl Compile for Pipeline {
///     type Instance = u32;
///     type Context = u32;
///
///     fn compile_instance(&self, instance: &u32, format: u32) {
///         self.compiled.lock().unwrap().push((*instance, format));
///     }
/// }
/// ```
pub trait Compile: Send + Sync + 'static {
    /// Instance-specific parameters of one compilation.
    type Instance: Send + Sync + 'static;
    /// Ambient configuration, passed by value to each compilation.
    type Context: Send + 'static;

    /// Compiles the given instance, blocking the calling worker thread until
    /// done.
    fn compile_instance(&self, instance: &Self::Instance, context: Self::Context);
}

/// A unit of deferred work: compile `instance` of `target` with `context`.
pub struct CompilationJob<T: Compile> {
    /// Object to compile, shared with the producer.
    pub target: Arc<T>,
    /// Instance parameters, shared with the producer.
    pub instance: Arc<T::Instance>,
    /// Ambient configuration for this compilation.
    pub context: T::Context,
}

impl<T: Compile> CompilationJob<T> {
    /// Creates a new job.
    pub fn new(target: Arc<T>, instance: Arc<T::Instance>, context: T::Context) -> Self {
        Self {
            target,
            instance,
            context,
        }
    }

    /// Runs the compilation on the current thread, consuming the job.
    pub fn execute(self) {
        self.target.compile_instance(&self.instance, self.context);
    }
}
