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
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use twox_hash::XxHash64;
use wbstore_common::{
    code::{BlockMetadata, ReadFlags, RoutingKey, StorableBlock},
    error::{Error, Result},
};

use crate::store::BlockStore;

const SEED: u64 = 0x5eed;

fn digest(bytes: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&XxHash64::oneshot(SEED, bytes).to_be_bytes())
}

/// A block whose routing key is derived from its full key.
///
/// Raw data is the payload, the raw header is a digest of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBlock {
    full_key: Bytes,
    payload: Bytes,
}

impl TestBlock {
    /// A content-hash block: the full key is derived from the payload, so keys never collide.
    pub fn content(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let full_key = digest(&payload);
        Self { full_key, payload }
    }

    /// A named block: any payload can be stored under a name, so different contents may collide.
    pub fn named(name: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            full_key: name.into(),
            payload: payload.into(),
        }
    }

    /// Payload of the block.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Raw data to persist.
    pub fn data(&self) -> Bytes {
        self.payload.clone()
    }

    /// Raw header to persist.
    pub fn header(&self) -> Bytes {
        digest(&self.payload)
    }

    fn routing_key_of(full_key: &[u8]) -> RoutingKey {
        RoutingKey::new(digest(full_key))
    }
}

impl StorableBlock for TestBlock {
    fn routing_key(&self) -> RoutingKey {
        Self::routing_key_of(&self.full_key)
    }

    fn full_key(&self) -> &[u8] {
        &self.full_key
    }
}

#[derive(Debug)]
struct Record {
    block: TestBlock,
    data: Bytes,
    header: Bytes,
    old_block: bool,
}

/// In-memory block store.
#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<HashMap<RoutingKey, Record>>,
    collisions_possible: bool,
    record_size: usize,
    write_latency: Duration,

    puts: AtomicUsize,
    fail_writes: AtomicBool,
    fail_keys: Mutex<HashSet<RoutingKey>>,
    last_construct_flags: Mutex<Option<ReadFlags>>,
    corrupt_reads: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Default record size.
    pub const RECORD_SIZE: usize = 1024;

    /// Create an empty store.
    pub fn new(collisions_possible: bool) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            collisions_possible,
            record_size: Self::RECORD_SIZE,
            write_latency: Duration::ZERO,
            puts: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_keys: Mutex::new(HashSet::new()),
            last_construct_flags: Mutex::new(None),
            corrupt_reads: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the size of one record.
    pub fn with_record_size(mut self, record_size: usize) -> Self {
        self.record_size = record_size;
        self
    }

    /// Sleep on every put to simulate a disk.
    pub fn with_write_latency(mut self, write_latency: Duration) -> Self {
        self.write_latency = write_latency;
        self
    }

    /// Fail every put with an I/O error while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Fail every put of the key with an I/O error while set.
    pub fn set_fail_key(&self, routing_key: &RoutingKey, fail: bool) {
        let mut keys = self.fail_keys.lock();
        if fail {
            keys.insert(routing_key.clone());
        } else {
            keys.remove(routing_key);
        }
    }

    /// Flags passed to the latest [`BlockStore::construct`] call.
    pub fn last_construct_flags(&self) -> Option<ReadFlags> {
        *self.last_construct_flags.lock()
    }

    /// Fail every verification in [`BlockStore::construct`] while set.
    pub fn set_corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::Relaxed);
    }

    /// Returns `true` if a record is stored under the key.
    pub fn contains(&self, routing_key: &RoutingKey) -> bool {
        self.records.lock().contains_key(routing_key)
    }

    /// The stored block under the key, without verification.
    pub fn get(&self, routing_key: &RoutingKey) -> Option<TestBlock> {
        self.records.lock().get(routing_key).map(|record| record.block.clone())
    }

    /// Count of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` if no record is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Count of successful puts.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    /// Returns `true` if the store has been started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Returns `true` if the store has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl BlockStore for MemoryStore {
    type Block = TestBlock;

    fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Option<TestBlock>> {
        let (data, header, old_block) = match self.records.lock().get(routing_key) {
            Some(record) => (record.data.clone(), record.header.clone(), record.old_block),
            None => return Ok(None),
        };
        if old_block && flags.contains(ReadFlags::IGNORE_OLD_BLOCKS) {
            return Ok(None);
        }
        let block = self.construct(&data, &header, routing_key, full_key, flags, meta)?;
        Ok(Some(block))
    }

    fn put(&self, block: TestBlock, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        if !self.write_latency.is_zero() {
            thread::sleep(self.write_latency);
        }
        let key = block.routing_key();
        if self.fail_writes.load(Ordering::Relaxed) || self.fail_keys.lock().contains(&key) {
            return Err(std::io::Error::other("injected write failure").into());
        }

        let mut records = self.records.lock();
        if let Some(record) = records.get(&key) {
            if self.collisions_possible && !overwrite && record.block != block {
                return Err(Error::collision(key));
            }
        }
        records.insert(
            key,
            Record {
                block,
                data,
                header,
                old_block,
            },
        );
        drop(records);

        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        self.contains(routing_key)
    }

    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<TestBlock> {
        *self.last_construct_flags.lock() = Some(flags);
        if self.corrupt_reads.load(Ordering::Relaxed) {
            return Err(Error::verify("injected corruption"));
        }
        if digest(data).as_ref() != header {
            return Err(Error::verify("payload digest mismatch"));
        }
        if &TestBlock::routing_key_of(full_key) != routing_key {
            return Err(Error::verify("full key does not match routing key"));
        }
        let old_block = self
            .records
            .lock()
            .get(routing_key)
            .is_some_and(|record| record.old_block && record.data.as_ref() == data);
        if let Some(meta) = meta {
            if old_block {
                meta.set_old_block();
            }
        }
        Ok(TestBlock {
            full_key: Bytes::copy_from_slice(full_key),
            payload: Bytes::copy_from_slice(data),
        })
    }

    fn entry_record_size(&self) -> usize {
        self.record_size
    }

    fn collisions_possible(&self) -> bool {
        self.collisions_possible
    }

    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Gate {
    closed: bool,
    /// Puts still to hold while closed. `None` holds all of them.
    quota: Option<usize>,
    waiting: usize,
}

/// Wraps a store and holds puts at a gate while it is closed.
///
/// Used to keep a write-back in flight while the test races it.
#[derive(Debug)]
pub struct BlockableStore<S> {
    store: S,
    gate: Mutex<Gate>,
    cond: Condvar,
}

impl<S> BlockableStore<S>
where
    S: BlockStore,
{
    /// Wrap a store with an open gate.
    pub fn new(store: S) -> Self {
        Self {
            store,
            gate: Mutex::new(Gate::default()),
            cond: Condvar::new(),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Hold every following put until [`BlockableStore::unblock_writes`].
    pub fn block_writes(&self) {
        let mut gate = self.gate.lock();
        gate.closed = true;
        gate.quota = None;
    }

    /// Hold only the next `n` puts until [`BlockableStore::unblock_writes`]. Later puts pass through.
    pub fn block_next_writes(&self, n: usize) {
        let mut gate = self.gate.lock();
        gate.closed = true;
        gate.quota = Some(n);
    }

    /// Release held puts.
    pub fn unblock_writes(&self) {
        let mut gate = self.gate.lock();
        gate.closed = false;
        gate.quota = None;
        drop(gate);
        self.cond.notify_all();
    }

    /// Wait until at least `n` puts are held at the gate. Returns `false` on timeout.
    pub fn wait_for_blocked_writers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while gate.waiting < n {
            if self.cond.wait_until(&mut gate, deadline).timed_out() {
                return gate.waiting >= n;
            }
        }
        true
    }
}

impl<S> BlockStore for BlockableStore<S>
where
    S: BlockStore,
{
    type Block = S::Block;

    fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Option<Self::Block>> {
        self.store.fetch(routing_key, full_key, flags, meta)
    }

    fn put(&self, block: Self::Block, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Result<()> {
        {
            let mut gate = self.gate.lock();
            let hold = gate.closed
                && match &mut gate.quota {
                    Some(0) => false,
                    Some(n) => {
                        *n -= 1;
                        true
                    }
                    None => true,
                };
            if hold {
                gate.waiting += 1;
                self.cond.notify_all();
                while gate.closed {
                    self.cond.wait(&mut gate);
                }
                gate.waiting -= 1;
            }
        }
        self.store.put(block, data, header, overwrite, old_block)
    }

    fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        self.store.probably_in_store(routing_key)
    }

    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Self::Block> {
        self.store.construct(data, header, routing_key, full_key, flags, meta)
    }

    fn entry_record_size(&self) -> usize {
        self.store.entry_record_size()
    }

    fn collisions_possible(&self) -> bool {
        self.store.collisions_possible()
    }

    fn start(&self) -> Result<()> {
        self.store.start()
    }

    fn close(&self) -> Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_collision() {
        let store = MemoryStore::new(true);
        let a = TestBlock::named("k", "a");
        let b = TestBlock::named("k", "b");
        assert_eq!(a.routing_key(), b.routing_key());

        store.put(a.clone(), a.data(), a.header(), false, false).unwrap();
        store.put(a.clone(), a.data(), a.header(), false, false).unwrap();
        assert!(store
            .put(b.clone(), b.data(), b.header(), false, false)
            .unwrap_err()
            .is_collision());
        store.put(b.clone(), b.data(), b.header(), true, false).unwrap();

        let fetched = store
            .fetch(&b.routing_key(), b.full_key(), ReadFlags::empty(), None)
            .unwrap()
            .unwrap();
        assert_eq!(fetched, b);
    }

    #[test]
    fn test_construct_verifies() {
        let store = MemoryStore::new(false);
        let block = TestBlock::content("payload");
        let key = block.routing_key();

        let rebuilt = store
            .construct(&block.data(), &block.header(), &key, block.full_key(), ReadFlags::empty(), None)
            .unwrap();
        assert_eq!(rebuilt, block);

        assert!(store
            .construct(b"tampered", &block.header(), &key, block.full_key(), ReadFlags::empty(), None)
            .is_err());
        assert!(store
            .construct(&block.data(), &block.header(), &key, b"other", ReadFlags::empty(), None)
            .is_err());
    }

    #[test]
    fn test_old_block_metadata() {
        let store = MemoryStore::new(false);
        let block = TestBlock::content("legacy");
        store.put(block.clone(), block.data(), block.header(), false, true).unwrap();

        let mut meta = BlockMetadata::default();
        let fetched = store
            .fetch(&block.routing_key(), block.full_key(), ReadFlags::empty(), Some(&mut meta))
            .unwrap();
        assert_eq!(fetched, Some(block.clone()));
        assert!(meta.is_old_block());

        let fetched = store
            .fetch(&block.routing_key(), block.full_key(), ReadFlags::IGNORE_OLD_BLOCKS, None)
            .unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn test_fail_key() {
        let store = MemoryStore::new(false);
        let bad = TestBlock::content("bad");
        let good = TestBlock::content("good");
        store.set_fail_key(&bad.routing_key(), true);

        assert!(store.put(bad.clone(), bad.data(), bad.header(), false, false).is_err());
        store.put(good.clone(), good.data(), good.header(), false, false).unwrap();
        assert!(!store.contains(&bad.routing_key()));

        store.set_fail_key(&bad.routing_key(), false);
        store.put(bad.clone(), bad.data(), bad.header(), false, false).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_block_next_writes() {
        let store = BlockableStore::new(MemoryStore::new(false));
        let held = TestBlock::content("held");
        let passed = TestBlock::content("passed");
        store.block_next_writes(1);

        thread::scope(|s| {
            let handle = s.spawn(|| store.put(held.clone(), held.data(), held.header(), false, false));
            assert!(store.wait_for_blocked_writers(1, Duration::from_secs(10)));

            // Beyond the quota, puts pass the closed gate.
            store.put(passed.clone(), passed.data(), passed.header(), false, false).unwrap();
            assert!(store.inner().contains(&passed.routing_key()));
            assert!(!store.inner().contains(&held.routing_key()));

            store.unblock_writes();
            handle.join().unwrap().unwrap();
        });
        assert!(store.inner().contains(&held.routing_key()));
    }
}
