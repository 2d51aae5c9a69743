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

use std::{fmt::Display, time::Duration};

use hdrhistogram::Histogram;

/// Latency samples of one kind of operation, in microseconds.
#[derive(Debug, Clone)]
pub struct Latency {
    histogram: Histogram<u64>,
}

impl Latency {
    pub fn new() -> anyhow::Result<Self> {
        // 1us ~ 60s with 3 significant figures.
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)?;
        Ok(Self { histogram })
    }

    pub fn record(&mut self, elapsed: Duration) {
        let us = (elapsed.as_micros() as u64).clamp(1, self.histogram.high());
        self.histogram.saturating_record(us);
    }

    pub fn merge(&mut self, other: &Latency) {
        // Both histograms share the same bounds.
        let _ = self.histogram.add(&other.histogram);
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }
}

impl Display for Latency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = &self.histogram;
        if h.is_empty() {
            return write!(f, "n/a");
        }
        write!(
            f,
            "mean: {:.1}us, p50: {}us, p90: {}us, p99: {}us, p999: {}us, max: {}us",
            h.mean(),
            h.value_at_quantile(0.5),
            h.value_at_quantile(0.9),
            h.value_at_quantile(0.99),
            h.value_at_quantile(0.999),
            h.max(),
        )
    }
}

/// Results of one bench run.
#[derive(Debug)]
pub struct Analysis {
    pub elapsed: Duration,
    pub puts: Latency,
    pub fetches: Latency,
    pub found: u64,
    pub collisions: u64,
    /// `wbstore_*` samples in the prometheus text format.
    pub metrics: String,
}

impl Analysis {
    fn ops(&self, count: u64) -> f64 {
        count as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

impl Display for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "elapsed: {:?}", self.elapsed)?;
        writeln!(f, "put: {:.0} ops/s", self.ops(self.puts.count()))?;
        writeln!(f, "    {}", self.puts)?;
        writeln!(f, "    collisions: {}", self.collisions)?;
        writeln!(f, "fetch: {:.0} ops/s", self.ops(self.fetches.count()))?;
        writeln!(f, "    {}", self.fetches)?;
        writeln!(f, "    found: {}/{}", self.found, self.fetches.count())?;
        writeln!(f, "metrics:")?;
        for line in self.metrics.lines().filter(|line| line.starts_with("wbstore_")) {
            writeln!(f, "    {line}")?;
        }
        Ok(())
    }
}
