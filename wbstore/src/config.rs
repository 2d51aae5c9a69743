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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wbstore_common::error::{Error, Result};

/// Default hard ceiling of the shared tracker: 64 MiB.
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;
/// Default worst-case staleness of a cached block: 5 minutes.
pub const DEFAULT_FLUSH_DEADLINE_MILLIS: u64 = 5 * 60 * 1000;
/// Default fraction of `max_bytes` above which an immediate flush is triggered.
pub const DEFAULT_LOW_THRESHOLD_FRACTION: f64 = 0.9;
/// Default count of entries drained per cache per flush pass.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Configuration of the shared memory tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Hard ceiling of bytes cached across all registered caches.
    pub max_bytes: usize,
    /// Worst-case staleness bound of a cached-but-unflushed block.
    pub flush_deadline_millis: u64,
    /// Fraction of `max_bytes` above which an admission triggers an immediate flush.
    pub low_threshold_fraction: f64,
    /// Entries drained per cache per flush pass.
    pub batch_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            flush_deadline_millis: DEFAULT_FLUSH_DEADLINE_MILLIS,
            low_threshold_fraction: DEFAULT_LOW_THRESHOLD_FRACTION,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl TrackerConfig {
    /// Check the config.
    pub fn validate(&self) -> Result<()> {
        if !(self.low_threshold_fraction > 0.0 && self.low_threshold_fraction <= 1.0) {
            return Err(Error::config(format!(
                "low threshold fraction must be in (0.0, 1.0], given: {}",
                self.low_threshold_fraction
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be greater than 0"));
        }
        Ok(())
    }

    /// The flush deadline as a [`Duration`].
    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_millis)
    }

    /// Admissions that would bring the tracker above this many bytes trigger an immediate flush.
    pub fn low_threshold(&self) -> f64 {
        self.max_bytes as f64 * self.low_threshold_fraction
    }
}
