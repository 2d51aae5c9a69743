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

//! Fuzzy test of concurrent puts and fetches against background write-back.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use rand::Rng;
use wbstore::{
    test_utils::{MemoryStore, TestBlock},
    ReadFlags, StorableBlock, TrackerBuilder, WriteBackCache,
};

const WRITERS: usize = 4;
const READERS: usize = 2;
const KEYS: usize = 32;
const OPS: usize = 2000;

fn key(writer: usize, k: usize) -> String {
    format!("w{writer}-k{k}")
}

fn version(block: &TestBlock) -> u64 {
    std::str::from_utf8(block.payload()).unwrap().parse().unwrap()
}

#[test_log::test]
fn test_concurrent_put_fetch() {
    let tracker = TrackerBuilder::new(16 * MemoryStore::RECORD_SIZE)
        .with_flush_deadline(Duration::from_millis(20))
        .with_batch_size(4)
        .build()
        .unwrap();
    let cache = WriteBackCache::new("fuzzy", MemoryStore::new(false), tracker.clone());
    cache.start().unwrap();

    // Latest version written per key, 0 if never written.
    let latest = Arc::new((0..WRITERS * KEYS).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
    let stop = Arc::new(AtomicBool::new(false));

    let writers = (0..WRITERS)
        .map(|w| {
            let cache = cache.clone();
            let latest = latest.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..OPS {
                    let k = rng.random_range(0..KEYS);
                    let slot = &latest[w * KEYS + k];
                    let v = slot.load(Ordering::Acquire) + 1;
                    let block = TestBlock::named(key(w, k), v.to_string());
                    cache
                        .put(block.clone(), block.data(), block.header(), false, false)
                        .unwrap();
                    slot.store(v, Ordering::Release);
                }
            })
        })
        .collect::<Vec<_>>();

    let readers = (0..READERS)
        .map(|_| {
            let cache = cache.clone();
            let latest = latest.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                while !stop.load(Ordering::Acquire) {
                    let w = rng.random_range(0..WRITERS);
                    let k = rng.random_range(0..KEYS);
                    let expected = latest[w * KEYS + k].load(Ordering::Acquire);
                    let probe = TestBlock::named(key(w, k), "");
                    let fetched = cache
                        .fetch(&probe.routing_key(), probe.full_key(), ReadFlags::empty(), None)
                        .unwrap();
                    match fetched {
                        Some(block) => assert!(version(&block) >= expected),
                        None => assert_eq!(expected, 0),
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert!(tracker.size() <= tracker.max_bytes());
    cache.close().unwrap();
    assert!(cache.is_empty());

    let store = cache.backing_store();
    for w in 0..WRITERS {
        for k in 0..KEYS {
            let expected = latest[w * KEYS + k].load(Ordering::Acquire);
            let stored = store.get(&TestBlock::named(key(w, k), "").routing_key());
            match stored {
                Some(block) => assert_eq!(version(&block), expected),
                None => assert_eq!(expected, 0),
            }
        }
    }
}
