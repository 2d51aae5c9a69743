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

mod analyze;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use analyze::{Analysis, Latency};
use bytes::Bytes;
use bytesize::ByteSize;
use clap::Parser;
use itertools::Itertools;
use mixtrics::registry::prometheus::PrometheusMetricsRegistry;
use prometheus::{Encoder, Registry, TextEncoder};
use rand::Rng;
use wbstore::{
    test_utils::{MemoryStore, TestBlock},
    BlockStore, ReadFlags, ShutdownHook, StorableBlock, Tracker, TrackerBuilder, WriteBackCache,
    WriteBackCacheBuilder,
};
use wbstore_common::runtime::RuntimeOptions;

type Cache = WriteBackCache<Arc<MemoryStore>>;

/// Keys successfully put, per store.
struct Written {
    key_range: u64,
    bits: Vec<AtomicBool>,
}

impl Written {
    fn new(stores: usize, key_range: u64) -> Self {
        let bits = (0..stores as u64 * key_range).map(|_| AtomicBool::new(false)).collect_vec();
        Self { key_range, bits }
    }

    fn mark(&self, store: usize, key: u64) {
        self.bits[(store as u64 * self.key_range + key) as usize].store(true, Ordering::Relaxed);
    }

    fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.bits.iter().enumerate().filter_map(|(i, bit)| {
            bit.load(Ordering::Relaxed)
                .then(|| ((i as u64 / self.key_range) as usize, i as u64 % self.key_range))
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Count of backing stores, each behind its own write-back cache.
    #[arg(long, default_value_t = 3)]
    stores: usize,

    /// Writer count.
    #[arg(long, default_value_t = 4)]
    writers: usize,

    /// Reader count.
    #[arg(long, default_value_t = 4)]
    readers: usize,

    /// Bench duration.
    #[arg(short, long, default_value = "10s")]
    time: humantime::Duration,

    /// Memory ceiling shared by all caches.
    #[arg(long, default_value = "64MiB")]
    max_bytes: ByteSize,

    /// Worst-case staleness of a cached block.
    #[arg(long, default_value = "5s")]
    flush_deadline: humantime::Duration,

    /// Fraction of the ceiling above which an admission triggers an immediate flush.
    #[arg(long, default_value_t = 0.9)]
    low_threshold: f64,

    /// Entries drained per cache per flush pass.
    #[arg(long, default_value_t = 20)]
    batch_size: usize,

    /// On-disk record size of every store.
    #[arg(long, default_value = "32KiB")]
    record_size: ByteSize,

    /// Simulated write latency of every store.
    #[arg(long, default_value = "50us")]
    write_latency: humantime::Duration,

    /// Key range of writers and readers.
    #[arg(long, default_value_t = 100_000)]
    key_range: u64,

    /// Make the stores collision-possible, so racing writers may collide.
    #[arg(long, default_value_t = false)]
    collisions: bool,
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    anyhow::ensure!(args.stores > 0, "\"--stores\" value must be greater than 0");
    anyhow::ensure!(args.key_range > 0, "\"--key-range\" value must be greater than 0");

    let tracker = TrackerBuilder::new(args.max_bytes.as_u64() as usize)
        .with_flush_deadline(args.flush_deadline.into())
        .with_low_threshold_fraction(args.low_threshold)
        .with_batch_size(args.batch_size)
        .with_runtime_options(RuntimeOptions {
            thread_name: "wbstore-bench-flusher".to_string(),
            ..Default::default()
        })
        .build()?;

    let registry = Registry::new();
    let hook = ShutdownHook::new();
    let caches = (0..args.stores)
        .map(|i| -> anyhow::Result<Cache> {
            let store = Arc::new(
                MemoryStore::new(args.collisions)
                    .with_record_size(args.record_size.as_u64() as usize)
                    .with_write_latency(args.write_latency.into()),
            );
            let name = format!("store-{i}");
            hook.add_late_job(format!("close {name}"), {
                let store = store.clone();
                move || {
                    if let Err(e) = store.close() {
                        tracing::error!("[bench] close store failed: {e}");
                    }
                }
            });
            let cache = WriteBackCacheBuilder::new(name, store, tracker.clone())
                .with_metrics_registry(Box::new(PrometheusMetricsRegistry::new(registry.clone())))
                .build()
                .with_shutdown_hook(&hook);
            cache.start()?;
            Ok(cache)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let caches = Arc::new(caches);

    let written = Arc::new(Written::new(args.stores, args.key_range));
    let analysis = bench(&args, &caches, &written, &registry)?;

    let size = tracker.size();
    hook.run();
    verify(&tracker, &caches, &written)?;

    println!("\nTotal:\n{analysis}");
    println!("tracker size before shutdown: {}", ByteSize::b(size as u64));
    Ok(())
}

fn bench(
    args: &Args,
    caches: &Arc<Vec<Cache>>,
    written: &Arc<Written>,
    registry: &Registry,
) -> anyhow::Result<Analysis> {
    let stop = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let writers = (0..args.writers)
        .map(|id| {
            let caches = caches.clone();
            let written = written.clone();
            let stop = stop.clone();
            let key_range = args.key_range;
            thread::spawn(move || write(id, &caches, &written, key_range, &stop))
        })
        .collect_vec();
    let readers = (0..args.readers)
        .map(|_| {
            let caches = caches.clone();
            let stop = stop.clone();
            let key_range = args.key_range;
            thread::spawn(move || read(&caches, key_range, &stop))
        })
        .collect_vec();

    thread::sleep(args.time.into());
    stop.store(true, Ordering::Release);

    let mut puts = Latency::new()?;
    let mut collisions = 0;
    for handle in writers {
        let (latency, c) = join(handle)??;
        puts.merge(&latency);
        collisions += c;
    }
    let mut fetches = Latency::new()?;
    let mut found = 0;
    for handle in readers {
        let (latency, f) = join(handle)??;
        fetches.merge(&latency);
        found += f;
    }

    let elapsed = start.elapsed();
    let mut metrics = vec![];
    TextEncoder::new().encode(&registry.gather(), &mut metrics)?;

    Ok(Analysis {
        elapsed,
        puts,
        fetches,
        found,
        collisions,
        metrics: String::from_utf8(metrics)?,
    })
}

fn join<T>(handle: thread::JoinHandle<T>) -> anyhow::Result<T> {
    handle.join().map_err(|_| anyhow::anyhow!("bench thread panicked"))
}

fn key_name(key: u64) -> String {
    format!("key-{key}")
}

fn write(
    id: usize,
    caches: &[Cache],
    written: &Written,
    key_range: u64,
    stop: &AtomicBool,
) -> anyhow::Result<(Latency, u64)> {
    let mut rng = rand::rng();
    let mut latency = Latency::new()?;
    let mut collisions = 0;
    let mut version = 0u64;

    while !stop.load(Ordering::Acquire) {
        let index = rng.random_range(0..caches.len());
        let cache = &caches[index];
        let key = rng.random_range(0..key_range);
        version += 1;
        let block = TestBlock::named(key_name(key), Bytes::from(format!("{id}-{version}")));

        let now = Instant::now();
        let res = cache.put(block.clone(), block.data(), block.header(), false, false);
        latency.record(now.elapsed());

        match res {
            Ok(()) => written.mark(index, key),
            // The key already holds other content, which must be persisted as well.
            Err(e) if e.is_collision() => {
                written.mark(index, key);
                collisions += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((latency, collisions))
}

fn read(caches: &[Cache], key_range: u64, stop: &AtomicBool) -> anyhow::Result<(Latency, u64)> {
    let mut rng = rand::rng();
    let mut latency = Latency::new()?;
    let mut found = 0;

    while !stop.load(Ordering::Acquire) {
        let cache = &caches[rng.random_range(0..caches.len())];
        let probe = TestBlock::named(key_name(rng.random_range(0..key_range)), Bytes::new());

        let now = Instant::now();
        let block = cache.fetch(&probe.routing_key(), probe.full_key(), ReadFlags::empty(), None)?;
        latency.record(now.elapsed());

        if block.is_some() {
            found += 1;
        }
    }
    Ok((latency, found))
}

/// Every cached block must be persisted and accounted for once shutdown completes.
fn verify(tracker: &Tracker, caches: &[Cache], written: &Written) -> anyhow::Result<()> {
    for cache in caches {
        anyhow::ensure!(cache.is_empty(), "{} holds {} entries after shutdown", cache.name(), cache.len());
        anyhow::ensure!(cache.backing_store().is_closed(), "{} store is not closed", cache.name());
    }
    let mut keys = 0;
    for (index, key) in written.iter() {
        let routing_key = TestBlock::named(key_name(key), Bytes::new()).routing_key();
        anyhow::ensure!(
            caches[index].backing_store().contains(&routing_key),
            "{} lost {}",
            caches[index].name(),
            key_name(key)
        );
        keys += 1;
    }
    tracing::info!("[bench] verified {keys} written keys");
    // A background write-back that completed during the drain gives its bytes back right after.
    let deadline = Instant::now() + Duration::from_secs(5);
    while tracker.size() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    anyhow::ensure!(tracker.size() == 0, "tracker holds {} bytes after shutdown", tracker.size());
    anyhow::ensure!(tracker.registered() == 0, "{} caches still registered", tracker.registered());
    Ok(())
}
