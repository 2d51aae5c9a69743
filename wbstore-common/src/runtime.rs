// Copyright 2026 wbstore Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    runtime::{Handle, Runtime as TokioRuntime},
    task::JoinHandle,
};

use crate::error::Result;

/// A wrapper around [`TokioRuntime`] that shuts down the runtime in the background when dropped.
///
/// This is necessary because directly dropping a nested runtime is not allowed in a parent runtime.
pub struct BackgroundShutdownRuntime(ManuallyDrop<TokioRuntime>);

impl Debug for BackgroundShutdownRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackgroundShutdownRuntime").finish()
    }
}

impl Drop for BackgroundShutdownRuntime {
    fn drop(&mut self) {
        // Safety: The runtime is only dropped once here.
        let runtime = unsafe { ManuallyDrop::take(&mut self.0) };
        runtime.shutdown_background();
    }
}

impl Deref for BackgroundShutdownRuntime {
    type Target = TokioRuntime;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BackgroundShutdownRuntime {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<TokioRuntime> for BackgroundShutdownRuntime {
    fn from(runtime: TokioRuntime) -> Self {
        Self(ManuallyDrop::new(runtime))
    }
}

/// A non-clonable runtime handle.
#[derive(Debug)]
pub struct SingletonHandle(Handle);

impl From<Handle> for SingletonHandle {
    fn from(handle: Handle) -> Self {
        Self(handle)
    }
}

impl SingletonHandle {
    /// Spawns a future onto the Tokio runtime.
    ///
    /// The provided future will start running in the background immediately when `spawn` is called, even if you
    /// don't await the returned `JoinHandle`.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.0.spawn(future)
    }

    /// Runs the provided function on an executor dedicated to blocking operations.
    pub fn spawn_blocking<F, R>(&self, func: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.0.spawn_blocking(func)
    }
}

/// Options for the dedicated runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Dedicated runtime worker threads.
    ///
    /// The workers only drive timers; flush bodies run on blocking threads.
    ///
    /// See [`tokio::runtime::Builder::worker_threads`].
    pub worker_threads: usize,

    /// Max threads to run blocking io.
    ///
    /// If the value is set to `0`, use the tokio default value (which is 512).
    ///
    /// See [`tokio::runtime::Builder::max_blocking_threads`].
    pub max_blocking_threads: usize,

    /// Name prefix of the runtime threads.
    pub thread_name: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            max_blocking_threads: 0,
            thread_name: "wbstore-timer".to_string(),
        }
    }
}

/// The timer facility used to run immediate or delayed background jobs.
///
/// Either owns a dedicated runtime, or borrows the runtime the caller is built on.
#[derive(Debug)]
pub struct Runtime {
    // Keeps the dedicated runtime alive. `None` if the runtime is borrowed.
    _dedicated: Option<Arc<BackgroundShutdownRuntime>>,
    handle: SingletonHandle,
}

impl Runtime {
    /// Build a dedicated multi-threaded runtime.
    pub fn dedicated(options: &RuntimeOptions) -> Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.worker_threads(options.worker_threads.max(1));
        if options.max_blocking_threads > 0 {
            builder.max_blocking_threads(options.max_blocking_threads);
        }
        builder.thread_name(options.thread_name.clone());
        let runtime = builder.enable_all().build()?;
        let runtime = Arc::new(BackgroundShutdownRuntime::from(runtime));
        let handle = SingletonHandle::from(runtime.handle().clone());
        Ok(Self {
            _dedicated: Some(runtime),
            handle,
        })
    }

    /// Use an existing runtime. The runtime must have its time driver enabled.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            _dedicated: None,
            handle: SingletonHandle::from(handle),
        }
    }

    /// The handle of the runtime.
    pub fn handle(&self) -> &SingletonHandle {
        &self.handle
    }

    /// Run `f` on a blocking thread after `delay`.
    ///
    /// A zero delay skips the timer and hands `f` to the blocking pool right away.
    pub fn spawn_blocking_after<F>(&self, delay: Duration, f: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            return self.handle.spawn_blocking(f);
        }
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(f).await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        })
    }
}
