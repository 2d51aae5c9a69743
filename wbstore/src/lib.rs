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

//! A write-back caching layer for fixed-record block stores.
//!
//! A [`WriteBackCache`] sits in front of one [`BlockStore`] and absorbs puts in memory. Every cache in a process is
//! accounted by one shared [`Tracker`], which enforces a hard memory ceiling and drives the asynchronous write-back of
//! cached blocks, both on a deadline and when memory pressure crosses a low threshold.

/// The write-back cache.
pub mod cache;
/// Tracker configuration.
pub mod config;
/// Cache metrics, registered to a `mixtrics` registry.
pub mod metrics;
/// Ordered shutdown.
pub mod shutdown;
/// The backing store abstraction.
pub mod store;
/// The shared memory tracker.
pub mod tracker;

/// Stores and blocks for tests and benchmarks.
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

mod prelude;
pub use prelude::*;
