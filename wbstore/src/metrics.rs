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

use std::borrow::Cow;

use mixtrics::metrics::{BoxedCounter, BoxedGauge, BoxedRegistry};

/// Metrics of one write-back cache, registered as `wbstore_op_total{name, op}` and `wbstore_usage_bytes{name}`.
#[derive(Debug)]
pub struct Metrics {
    /// fetches served from the cache
    pub hit: BoxedCounter,
    /// fetches delegated to the backing store
    pub miss: BoxedCounter,
    /// cached entries that failed verification and fell through to the backing store
    pub verify_failure: BoxedCounter,

    /// new entries admitted by the tracker
    pub admit: BoxedCounter,
    /// cached entries replaced in place
    pub replace: BoxedCounter,
    /// puts written straight to the backing store
    pub bypass: BoxedCounter,
    /// duplicate puts of identical content absorbed by the cache
    pub duplicate: BoxedCounter,
    /// puts rejected for colliding with different cached content
    pub collision: BoxedCounter,

    /// entries written back and removed
    pub evict: BoxedCounter,
    /// entries written back but replaced while the write was in flight
    pub supersede: BoxedCounter,
    /// write-backs failed by the backing store
    pub write_back_failure: BoxedCounter,
    /// entries given up on after repeated failed write-backs
    pub discard: BoxedCounter,

    /// budget held by cached entries
    pub usage: BoxedGauge,
}

impl Metrics {
    /// Register the metrics of the cache `name` to `registry`.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &BoxedRegistry) -> Self {
        let name = name.into();

        let wbstore_op_total = registry.register_counter_vec(
            "wbstore_op_total".into(),
            "wbstore write-back cache operations".into(),
            &["name", "op"],
        );
        let wbstore_usage_bytes = registry.register_gauge_vec(
            "wbstore_usage_bytes".into(),
            "wbstore write-back cache budget held by cached entries".into(),
            &["name"],
        );

        let op = |op: &'static str| wbstore_op_total.counter(&[name.clone(), op.into()]);

        Self {
            hit: op("hit"),
            miss: op("miss"),
            verify_failure: op("verify_failure"),
            admit: op("admit"),
            replace: op("replace"),
            bypass: op("bypass"),
            duplicate: op("duplicate"),
            collision: op("collision"),
            evict: op("evict"),
            supersede: op("supersede"),
            write_back_failure: op("write_back_failure"),
            discard: op("discard"),
            usage: wbstore_usage_bytes.gauge(&[name.clone()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use mixtrics::registry::{noop::NoopMetricsRegistry, prometheus::PrometheusMetricsRegistry};
    use prometheus::{Encoder, Registry, TextEncoder};

    use super::*;

    #[test]
    fn test_metrics_noop() {
        let metrics = Metrics::new("test", &(Box::new(NoopMetricsRegistry) as BoxedRegistry));
        metrics.hit.increase(1);
        metrics.usage.absolute(42);
    }

    #[test]
    fn test_metrics_prometheus() {
        let registry = Registry::new();
        let metrics = Metrics::new(
            "test",
            &(Box::new(PrometheusMetricsRegistry::new(registry.clone())) as BoxedRegistry),
        );
        metrics.hit.increase(2);
        metrics.usage.increase(4096);

        let mut buf = vec![];
        TextEncoder::new().encode(&registry.gather(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#"wbstore_op_total{name="test",op="hit"} 2"#), "{text}");
        assert!(text.contains(r#"wbstore_op_total{name="test",op="miss"} 0"#), "{text}");
        assert!(text.contains(r#"wbstore_usage_bytes{name="test"} 4096"#), "{text}");
    }
}
