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
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Instant,
};

use parking_lot::Mutex;

type Job = (String, Box<dyn FnOnce() + Send + 'static>);

/// Two-phase ordered shutdown.
///
/// Every early job finishes before any late job starts. Jobs within a phase run concurrently.
#[derive(Default)]
pub struct ShutdownHook {
    early: Mutex<Vec<Job>>,
    late: Mutex<Vec<Job>>,
    done: AtomicBool,
}

impl Debug for ShutdownHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHook")
            .field("early", &self.early.lock().len())
            .field("late", &self.late.lock().len())
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

impl ShutdownHook {
    /// Create an empty shutdown hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job that runs before every late job, e.g. draining caches.
    pub fn add_early_job<F>(&self, name: impl Into<String>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.early.lock().push((name.into(), Box::new(job)));
    }

    /// Add a job that runs after every early job, e.g. closing backing stores.
    pub fn add_late_job<F>(&self, name: impl Into<String>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.late.lock().push((name.into(), Box::new(job)));
    }

    /// Run all jobs, early phase first. Only the first call has any effect.
    pub fn run(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let early = std::mem::take(&mut *self.early.lock());
        Self::run_phase("early", early);
        let late = std::mem::take(&mut *self.late.lock());
        Self::run_phase("late", late);
    }

    fn run_phase(phase: &str, jobs: Vec<Job>) {
        let start = Instant::now();
        let count = jobs.len();
        thread::scope(|s| {
            for (name, job) in jobs {
                s.spawn(move || {
                    tracing::debug!("[shutdown] run {phase} job: {name}");
                    job();
                });
            }
        });
        tracing::info!(
            "[shutdown] {count} {phase} jobs finished, elapsed: {:?}",
            start.elapsed()
        );
    }
}
