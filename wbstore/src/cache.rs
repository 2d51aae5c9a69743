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
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use mixtrics::{metrics::BoxedRegistry, registry::noop::NoopMetricsRegistry};
use ordered_hash_map::OrderedHashMap;
use parking_lot::{Mutex, RwLock};
use wbstore_common::{
    code::{BlockMetadata, ReadFlags, RoutingKey, StorableBlock},
    error::{Error, Result},
};

use crate::{
    metrics::Metrics,
    shutdown::ShutdownHook,
    store::BlockStore,
    tracker::{Evicted, FlushTarget, TargetId, Tracker},
};

/// One block awaiting write-back.
///
/// Content is never mutated after creation. A newer put of the same key installs a new entry, so identity (not
/// equality) tells whether an entry was replaced while its write-back was in flight.
#[derive(Debug)]
struct CachedEntry<B> {
    block: B,
    data: Bytes,
    header: Bytes,
    overwrite: bool,
    old_block: bool,
    /// Failed write-backs of this entry.
    failures: AtomicUsize,
}

impl<B> CachedEntry<B> {
    fn new(block: B, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Self {
        Self {
            block,
            data,
            header,
            overwrite,
            old_block,
            failures: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug)]
struct CacheState<B> {
    /// Least recently cached first.
    entries: OrderedHashMap<RoutingKey, Arc<CachedEntry<B>>>,
    started: bool,
    shutting_down: bool,
}

impl<B> CacheState<B> {
    /// Install `entry` as the most recently cached one.
    fn push(&mut self, key: RoutingKey, entry: CachedEntry<B>) {
        self.requeue(key, Arc::new(entry));
    }

    /// Move `entry` behind every other entry.
    fn requeue(&mut self, key: RoutingKey, entry: Arc<CachedEntry<B>>) {
        self.entries.remove(&key);
        self.entries.insert(key, entry);
    }

    /// Returns `true` if `entry` is still the cached entry of `key`.
    fn is_current(&self, key: &RoutingKey, entry: &Arc<CachedEntry<B>>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }
}

struct WriteBackCacheInner<S>
where
    S: BlockStore,
{
    name: String,
    store: S,
    tracker: Tracker,

    collisions_possible: bool,
    entry_cost: usize,

    state: RwLock<CacheState<S::Block>>,
    /// Held across a whole write-back, so a drain never returns while an older copy is still being written.
    evicting: Mutex<()>,
    registration: Mutex<Option<TargetId>>,
    closed: AtomicBool,

    metrics: Metrics,
}

/// Write-back cache in front of one backing store.
///
/// Absorbs puts in memory against the budget of a shared [`Tracker`], and writes them back asynchronously when the
/// tracker flushes. Disk I/O never happens while the cache lock is held.
pub struct WriteBackCache<S>
where
    S: BlockStore,
{
    inner: Arc<WriteBackCacheInner<S>>,
}

impl<S> Clone for WriteBackCache<S>
where
    S: BlockStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Debug for WriteBackCache<S>
where
    S: BlockStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBackCache")
            .field("name", &self.inner.name)
            .field("entries", &self.len())
            .field("entry_cost", &self.inner.entry_cost)
            .field("collisions_possible", &self.inner.collisions_possible)
            .finish()
    }
}

/// Builder of [`WriteBackCache`].
pub struct WriteBackCacheBuilder<S>
where
    S: BlockStore,
{
    name: String,
    store: S,
    tracker: Tracker,
    registry: BoxedRegistry,
}

impl<S> WriteBackCacheBuilder<S>
where
    S: BlockStore,
{
    /// Wrap `store` with a write-back cache accounted by `tracker`.
    pub fn new(name: impl Into<String>, store: S, tracker: Tracker) -> Self {
        Self {
            name: name.into(),
            store,
            tracker,
            registry: Box::new(NoopMetricsRegistry),
        }
    }

    /// Set metrics registry.
    ///
    /// Default: [`NoopMetricsRegistry`].
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Build the cache.
    ///
    /// The cache bypasses itself until [`WriteBackCache::start`] is called.
    pub fn build(self) -> WriteBackCache<S> {
        let collisions_possible = self.store.collisions_possible();
        let entry_cost = self.store.entry_record_size();
        let metrics = Metrics::new(self.name.clone(), &self.registry);
        let inner = WriteBackCacheInner {
            name: self.name,
            store: self.store,
            tracker: self.tracker,
            collisions_possible,
            entry_cost,
            state: RwLock::new(CacheState {
                entries: OrderedHashMap::new(),
                started: false,
                shutting_down: false,
            }),
            evicting: Mutex::new(()),
            registration: Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics,
        };
        WriteBackCache { inner: Arc::new(inner) }
    }
}

impl<S> WriteBackCache<S>
where
    S: BlockStore,
{
    /// Wrap `store` with a write-back cache accounted by `tracker`, with no metrics registry.
    ///
    /// The cache bypasses itself until [`WriteBackCache::start`] is called.
    pub fn new(name: impl Into<String>, store: S, tracker: Tracker) -> Self {
        WriteBackCacheBuilder::new(name, store, tracker).build()
    }

    /// Register the cache drain as an early job of `hook`, so cached blocks are persisted before the backing store's
    /// own shutdown job runs.
    pub fn with_shutdown_hook(self, hook: &ShutdownHook) -> Self {
        let this = self.clone();
        hook.add_early_job(format!("close write-back cache {}", self.inner.name), move || {
            this.close_early()
        });
        self
    }

    /// Start accepting cached puts: register with the tracker, then start the backing store.
    ///
    /// Fails with [`Error::Closed`] once the cache has been closed, early or not.
    pub fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        {
            // Shutdown sets the flag before it takes the registration.
            let mut registration = self.inner.registration.lock();
            let mut state = self.inner.state.write();
            if state.shutting_down {
                return Err(Error::Closed);
            }
            if registration.is_none() {
                let target: Weak<dyn FlushTarget> = Arc::downgrade(&self.inner) as Weak<dyn FlushTarget>;
                *registration = Some(self.inner.tracker.register(target));
            }
            state.started = true;
        }
        self.inner.store.start()
    }

    /// Fetch a block, from memory first, falling back to the backing store.
    ///
    /// A cached copy that fails verification is logged and skipped: the cache may miss, but never returns corrupted
    /// data. A cached block put as an old block is reported so in `meta`, as the backing store would.
    pub fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        mut meta: Option<&mut BlockMetadata>,
    ) -> Result<Option<S::Block>> {
        let cached = self.inner.state.read().entries.get(routing_key).cloned();

        if let Some(entry) = cached {
            match self.inner.store.construct(
                &entry.data,
                &entry.header,
                routing_key,
                entry.block.full_key(),
                flags,
                meta.as_deref_mut(),
            ) {
                Ok(block) => {
                    if entry.old_block {
                        if let Some(meta) = meta {
                            meta.set_old_block();
                        }
                    }
                    self.inner.metrics.hit.increase(1);
                    return Ok(Some(block));
                }
                Err(e) => {
                    self.inner.metrics.verify_failure.increase(1);
                    tracing::error!(
                        "[wbc] cached block of {} in {} failed verification, fall back to backing store: {e}",
                        routing_key,
                        self.inner.name
                    );
                }
            }
        } else {
            self.inner.metrics.miss.increase(1);
        }

        self.inner.store.fetch(routing_key, full_key, flags, meta)
    }

    /// Returns `true` if the block is cached, or the backing store reports it probably present.
    pub fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        let cached = self.inner.state.read().entries.get(routing_key).is_some();
        cached || self.inner.store.probably_in_store(routing_key)
    }

    /// Put a block.
    ///
    /// The block is cached if the tracker admits it, otherwise it is written straight to the backing store. In a
    /// collision-possible store without `overwrite`, putting different content under a cached key fails with
    /// [`Error::Collision`], and keys the backing store may already hold are never cached.
    pub fn put(&self, block: S::Block, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Result<()> {
        let key = block.routing_key();
        let entry = CachedEntry::new(block, data, header, overwrite, old_block);

        let Some(entry) = self.try_cache(&key, entry)? else {
            return Ok(());
        };

        self.inner.metrics.bypass.increase(1);
        self.inner
            .store
            .put(entry.block, entry.data, entry.header, entry.overwrite, entry.old_block)
    }

    /// Returns the entry back if it must bypass the cache.
    fn try_cache(
        &self,
        key: &RoutingKey,
        entry: CachedEntry<S::Block>,
    ) -> Result<Option<CachedEntry<S::Block>>> {
        let blind = !self.inner.collisions_possible || entry.overwrite;

        {
            let mut state = self.inner.state.write();
            if !state.started || state.shutting_down {
                return Ok(Some(entry));
            }
            if let Some(current) = state.entries.get(key).cloned() {
                return self.resolve_cached(&mut state, key, &current, entry, blind);
            }
        }

        // Caching a key the backing store may hold could hide a real collision on disk.
        if !blind && self.inner.store.probably_in_store(key) {
            return Ok(Some(entry));
        }

        if !self.inner.tracker.admit(self.inner.entry_cost) {
            return Ok(Some(entry));
        }

        let mut state = self.inner.state.write();
        if state.shutting_down {
            drop(state);
            self.inner.tracker.release(self.inner.entry_cost);
            return Ok(Some(entry));
        }
        if let Some(current) = state.entries.get(key).cloned() {
            // A concurrent put installed the key while the budget was being admitted. The budget stays with that
            // entry.
            let res = self.resolve_cached(&mut state, key, &current, entry, blind);
            drop(state);
            self.inner.tracker.release(self.inner.entry_cost);
            return res;
        }
        state.push(key.clone(), entry);
        drop(state);

        self.inner.metrics.admit.increase(1);
        self.inner.metrics.usage.increase(self.inner.entry_cost as u64);
        Ok(None)
    }

    /// Put over an already cached key. Never needs admission.
    fn resolve_cached(
        &self,
        state: &mut CacheState<S::Block>,
        key: &RoutingKey,
        current: &CachedEntry<S::Block>,
        entry: CachedEntry<S::Block>,
        blind: bool,
    ) -> Result<Option<CachedEntry<S::Block>>> {
        if blind {
            state.push(key.clone(), entry);
            self.inner.metrics.replace.increase(1);
            return Ok(None);
        }
        if current.block == entry.block {
            self.inner.metrics.duplicate.increase(1);
            return Ok(None);
        }
        self.inner.metrics.collision.increase(1);
        Err(Error::collision(key.clone()))
    }

    /// Write back the least recently cached entry, and give the freed bytes back to the tracker.
    ///
    /// An entry the backing store fails is kept and moves behind the others.
    pub fn evict_oldest(&self) -> Evicted {
        let evicted = self.inner.evict_oldest(None);
        if let Evicted::Freed(bytes) | Evicted::Discarded(bytes) = evicted {
            self.inner.tracker.release(bytes);
        }
        evicted
    }

    /// Close the cache without closing the backing store.
    ///
    /// Stops caching new puts and synchronously writes back every cached entry. Runs as the early shutdown job.
    pub fn close_early(&self) {
        self.inner.shutdown();
    }

    /// Close the cache: write back every cached entry, then close the backing store.
    ///
    /// Only the first call has any effect.
    pub fn close(&self) -> Result<()> {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.inner.shutdown();
        tracing::info!("[wbc] {} closed", self.inner.name);
        self.inner.store.close()
    }

    /// Name of the cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Count of cached entries.
    pub fn len(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    /// Returns `true` if no entry is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.state.read().entries.is_empty()
    }

    /// Budget charged for each cached entry.
    pub fn entry_cost(&self) -> usize {
        self.inner.entry_cost
    }

    /// The backing store.
    pub fn backing_store(&self) -> &S {
        &self.inner.store
    }

    /// The tracker the cache is accounted by.
    pub fn tracker(&self) -> &Tracker {
        &self.inner.tracker
    }
}

impl<S> WriteBackCacheInner<S>
where
    S: BlockStore,
{
    fn shutdown(&self) {
        self.state.write().shutting_down = true;
        // Take the registration out of its lock before draining.
        let registration = self.registration.lock().take();
        if let Some(id) = registration {
            self.tracker.unregister(id);
        }
    }
}

impl<S> FlushTarget for WriteBackCacheInner<S>
where
    S: BlockStore,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evict_oldest(&self, max_attempts: Option<usize>) -> Evicted {
        let _evicting = self.evicting.lock();

        let (key, entry) = {
            let state = self.state.read();
            match state.entries.iter().next() {
                Some((key, entry)) => (key.clone(), entry.clone()),
                None => return Evicted::Empty,
            }
        };

        match self.store.put(
            entry.block.clone(),
            entry.data.clone(),
            entry.header.clone(),
            entry.overwrite,
            entry.old_block,
        ) {
            Ok(()) => {}
            Err(e) if e.is_collision() => {
                // The backing store keeps its own content. Nothing left to write for this entry.
                tracing::debug!("[wbc] write back {key} to {}: {e}", self.name);
            }
            Err(e) => return self.write_back_failed(key, entry, max_attempts, e),
        }

        let mut state = self.state.write();
        if state.is_current(&key, &entry) {
            state.entries.remove(&key);
            drop(state);
            self.metrics.evict.increase(1);
            self.metrics.usage.decrease(self.entry_cost as u64);
            Evicted::Freed(self.entry_cost)
        } else {
            drop(state);
            self.metrics.supersede.increase(1);
            Evicted::Superseded
        }
    }

    fn discard_all(&self) -> usize {
        let _evicting = self.evicting.lock();
        let mut state = self.state.write();
        let count = state.entries.len();
        state.entries.clear();
        drop(state);
        self.metrics.discard.increase(count as u64);
        self.metrics.usage.decrease((count * self.entry_cost) as u64);
        count * self.entry_cost
    }
}

impl<S> WriteBackCacheInner<S>
where
    S: BlockStore,
{
    /// Requeue a failed entry behind the others, or drop it once it has failed `max_attempts` times.
    fn write_back_failed(
        &self,
        key: RoutingKey,
        entry: Arc<CachedEntry<S::Block>>,
        max_attempts: Option<usize>,
        e: Error,
    ) -> Evicted {
        self.metrics.write_back_failure.increase(1);
        let attempts = entry.failures.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::error!("[wbc] write back {key} to {} failed, attempts: {attempts}: {e}", self.name);

        let mut state = self.state.write();
        // A replacing entry starts over with its own attempts.
        if !state.is_current(&key, &entry) {
            return Evicted::Failed;
        }
        if max_attempts.is_some_and(|max| attempts >= max) {
            state.entries.remove(&key);
            drop(state);
            self.metrics.discard.increase(1);
            self.metrics.usage.decrease(self.entry_cost as u64);
            tracing::error!(
                "[wbc] discard {key} of {} after {attempts} failed write-backs",
                self.name
            );
            return Evicted::Discarded(self.entry_cost);
        }
        state.requeue(key, entry);
        Evicted::Failed
    }
}

impl<S> Drop for WriteBackCacheInner<S>
where
    S: BlockStore,
{
    fn drop(&mut self) {
        let count = self.state.get_mut().entries.len();
        if count > 0 {
            tracing::warn!(
                "[wbc] {} dropped without close, lost {count} cached entries",
                self.name
            );
            self.tracker.release(count * self.entry_cost);
            self.metrics.usage.decrease((count * self.entry_cost) as u64);
        }
    }
}

impl<S> BlockStore for WriteBackCache<S>
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
        WriteBackCache::fetch(self, routing_key, full_key, flags, meta)
    }

    fn put(&self, block: Self::Block, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Result<()> {
        WriteBackCache::put(self, block, data, header, overwrite, old_block)
    }

    fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        WriteBackCache::probably_in_store(self, routing_key)
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
        self.inner
            .store
            .construct(data, header, routing_key, full_key, flags, meta)
    }

    fn entry_record_size(&self) -> usize {
        self.inner.entry_cost
    }

    fn collisions_possible(&self) -> bool {
        self.inner.collisions_possible
    }

    fn start(&self) -> Result<()> {
        WriteBackCache::start(self)
    }

    fn close(&self) -> Result<()> {
        WriteBackCache::close(self)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use mixtrics::registry::prometheus::PrometheusMetricsRegistry;
    use prometheus::{Encoder, Registry, TextEncoder};

    use super::*;
    use crate::{
        test_utils::{BlockableStore, MemoryStore, TestBlock},
        tracker::TrackerBuilder,
    };

    const RECORD: usize = MemoryStore::RECORD_SIZE;

    fn tracker(max_bytes: usize) -> Tracker {
        TrackerBuilder::new(max_bytes)
            .with_flush_deadline(Duration::from_secs(3600))
            .with_low_threshold_fraction(1.0)
            .build()
            .unwrap()
    }

    fn started_with_registry<S: BlockStore>(store: S, tracker: &Tracker) -> (WriteBackCache<S>, Registry) {
        let registry = Registry::new();
        let cache = WriteBackCacheBuilder::new("test", store, tracker.clone())
            .with_metrics_registry(Box::new(PrometheusMetricsRegistry::new(registry.clone())))
            .build();
        cache.start().unwrap();
        (cache, registry)
    }

    fn started<S: BlockStore>(store: S, tracker: &Tracker) -> WriteBackCache<S> {
        let cache = WriteBackCache::new("test", store, tracker.clone());
        cache.start().unwrap();
        cache
    }

    /// Value of `wbstore_op_total{name="test",op}`.
    fn op_total(registry: &Registry, op: &str) -> u64 {
        let mut buf = vec![];
        TextEncoder::new().encode(&registry.gather(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let prefix = format!(r#"wbstore_op_total{{name="test",op="{op}"}} "#);
        text.lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(|value| value.parse().unwrap())
            .unwrap_or(0)
    }

    fn put<S: BlockStore<Block = TestBlock>>(cache: &WriteBackCache<S>, block: &TestBlock) -> Result<()> {
        cache.put(block.clone(), block.data(), block.header(), false, false)
    }

    fn fetch<S: BlockStore<Block = TestBlock>>(cache: &WriteBackCache<S>, block: &TestBlock) -> Option<TestBlock> {
        cache
            .fetch(&block.routing_key(), block.full_key(), ReadFlags::empty(), None)
            .unwrap()
    }

    #[test_log::test]
    fn test_cached_put_then_write_back() {
        let tracker = tracker(16 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(false), &tracker);

        let block = TestBlock::content("hello");
        put(&cache, &block).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(tracker.size(), RECORD);
        assert!(cache.backing_store().is_empty());
        assert!(cache.probably_in_store(&block.routing_key()));
        assert_eq!(fetch(&cache, &block), Some(block.clone()));

        assert!(tracker.flush());
        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert_eq!(cache.backing_store().get(&block.routing_key()), Some(block.clone()));
        assert_eq!(fetch(&cache, &block), Some(block));

        assert_eq!(op_total(&registry, "admit"), 1);
        assert_eq!(op_total(&registry, "hit"), 1);
        assert_eq!(op_total(&registry, "miss"), 1);
        assert_eq!(op_total(&registry, "evict"), 1);
    }

    #[test_log::test]
    fn test_cache_hit_passes_flags_and_metadata() {
        let tracker = tracker(16 * RECORD);
        let cache = started(MemoryStore::new(false), &tracker);

        let block = TestBlock::content("legacy");
        cache
            .put(block.clone(), block.data(), block.header(), false, true)
            .unwrap();
        assert_eq!(cache.len(), 1);

        let flags = ReadFlags::CAN_READ_CLIENT_CACHE | ReadFlags::DONT_PROMOTE;
        let mut meta = BlockMetadata::default();
        let fetched = cache
            .fetch(&block.routing_key(), block.full_key(), flags, Some(&mut meta))
            .unwrap();
        assert_eq!(fetched, Some(block.clone()));
        assert!(meta.is_old_block());
        assert_eq!(cache.backing_store().last_construct_flags(), Some(flags));

        // The same metadata is reported once the block lives in the backing store.
        assert!(tracker.flush());
        assert!(cache.is_empty());
        let mut meta = BlockMetadata::default();
        let fetched = cache
            .fetch(&block.routing_key(), block.full_key(), ReadFlags::empty(), Some(&mut meta))
            .unwrap();
        assert_eq!(fetched, Some(block));
        assert!(meta.is_old_block());
        assert_eq!(cache.backing_store().last_construct_flags(), Some(ReadFlags::empty()));
    }

    #[test_log::test]
    fn test_bypass_before_start() {
        let tracker = tracker(16 * RECORD);
        let registry = Registry::new();
        let cache = WriteBackCacheBuilder::new("test", MemoryStore::new(false), tracker.clone())
            .with_metrics_registry(Box::new(PrometheusMetricsRegistry::new(registry.clone())))
            .build();

        let block = TestBlock::content("early");
        put(&cache, &block).unwrap();

        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert_eq!(tracker.registered(), 0);
        assert!(cache.backing_store().contains(&block.routing_key()));
        assert_eq!(op_total(&registry, "bypass"), 1);
    }

    #[test_log::test]
    fn test_collision() {
        let tracker = tracker(16 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(true), &tracker);

        let a = TestBlock::named("key", "a");
        let b = TestBlock::named("key", "b");
        put(&cache, &a).unwrap();

        // Identical content is absorbed.
        put(&cache, &a).unwrap();
        assert_eq!(op_total(&registry, "duplicate"), 1);

        let err = put(&cache, &b).unwrap_err();
        assert!(err.is_collision());
        assert_eq!(op_total(&registry, "collision"), 1);
        assert_eq!(fetch(&cache, &a), Some(a.clone()));

        cache.put(b.clone(), b.data(), b.header(), true, false).unwrap();
        assert_eq!(fetch(&cache, &b), Some(b));
        assert_eq!(cache.len(), 1);
        assert_eq!(tracker.size(), RECORD);
    }

    #[test_log::test]
    fn test_blind_replace() {
        let tracker = tracker(16 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(false), &tracker);

        let v1 = TestBlock::named("key", "v1");
        let v2 = TestBlock::named("key", "v2");
        put(&cache, &v1).unwrap();
        put(&cache, &v2).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(tracker.size(), RECORD);
        assert_eq!(fetch(&cache, &v1), Some(v2));
        assert_eq!(op_total(&registry, "replace"), 1);
    }

    #[test_log::test]
    fn test_stored_key_bypasses_when_collisions_possible() {
        let tracker = tracker(16 * RECORD);
        let store = MemoryStore::new(true);
        let old = TestBlock::named("key", "old");
        store.put(old.clone(), old.data(), old.header(), false, false).unwrap();
        let cache = started(store, &tracker);

        let new = TestBlock::named("key", "new");
        assert!(put(&cache, &new).unwrap_err().is_collision());
        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert_eq!(fetch(&cache, &new), Some(old));
    }

    #[test_log::test]
    fn test_refused_admission_bypasses() {
        let tracker = tracker(2 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(false), &tracker);

        let blocks = (0..3).map(|i| TestBlock::content(format!("block-{i}"))).collect::<Vec<_>>();
        for block in &blocks {
            put(&cache, block).unwrap();
        }

        // The third put exceeds the ceiling and goes straight to the backing store.
        assert!(cache.backing_store().contains(&blocks[2].routing_key()));
        assert_eq!(op_total(&registry, "bypass"), 1);
        assert!(tracker.size() <= tracker.max_bytes());
        for block in &blocks {
            assert_eq!(fetch(&cache, block), Some(block.clone()));
        }
    }

    #[test_log::test]
    fn test_verify_failure_falls_through() {
        let tracker = tracker(16 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(false), &tracker);

        let block = TestBlock::content("fragile");
        put(&cache, &block).unwrap();
        cache.backing_store().set_corrupt_reads(true);

        assert_eq!(fetch(&cache, &block), None);
        assert_eq!(op_total(&registry, "verify_failure"), 1);
        assert_eq!(op_total(&registry, "hit"), 0);
    }

    #[test_log::test]
    fn test_eviction_superseded_by_concurrent_put() {
        let tracker = tracker(16 * RECORD);
        let cache = started(BlockableStore::new(MemoryStore::new(false)), &tracker);

        let v1 = TestBlock::named("key", "v1");
        let v2 = TestBlock::named("key", "v2");
        put(&cache, &v1).unwrap();

        cache.backing_store().block_writes();
        let handle = thread::spawn({
            let cache = cache.clone();
            move || cache.evict_oldest()
        });
        assert!(cache
            .backing_store()
            .wait_for_blocked_writers(1, Duration::from_secs(10)));

        put(&cache, &v2).unwrap();
        cache.backing_store().unblock_writes();
        assert_eq!(handle.join().unwrap(), Evicted::Superseded);

        // The newer content is neither lost nor shadowed by the write-back of the older one.
        assert_eq!(cache.len(), 1);
        assert_eq!(tracker.size(), RECORD);
        assert_eq!(fetch(&cache, &v1), Some(v2.clone()));

        assert_eq!(cache.evict_oldest(), Evicted::Freed(RECORD));
        assert_eq!(tracker.size(), 0);
        assert_eq!(cache.backing_store().inner().get(&v2.routing_key()), Some(v2));
        assert_eq!(cache.evict_oldest(), Evicted::Empty);
    }

    #[test_log::test]
    fn test_close_waits_for_background_write_back() {
        let tracker = tracker(16 * RECORD);
        let cache = started(BlockableStore::new(MemoryStore::new(false)), &tracker);

        let v1 = TestBlock::named("key", "v1");
        let v2 = TestBlock::named("key", "v2");
        put(&cache, &v1).unwrap();

        // Hold the background write-back of v1. Any later write passes through.
        cache.backing_store().block_next_writes(1);
        let flusher = thread::spawn({
            let tracker = tracker.clone();
            move || tracker.flush()
        });
        assert!(cache
            .backing_store()
            .wait_for_blocked_writers(1, Duration::from_secs(10)));

        let closer = thread::spawn({
            let cache = cache.clone();
            move || cache.close_early()
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished());

        cache.backing_store().unblock_writes();
        assert!(flusher.join().unwrap());
        closer.join().unwrap();
        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);

        // Bypasses the closed cache. The older write-back has already landed, so it cannot overwrite v2.
        put(&cache, &v2).unwrap();
        assert_eq!(cache.backing_store().inner().get(&v2.routing_key()), Some(v2.clone()));
        assert_eq!(fetch(&cache, &v1), Some(v2));
    }

    #[test_log::test]
    fn test_close_drains() {
        let tracker = tracker(16 * RECORD);
        let cache = started(MemoryStore::new(false), &tracker);

        let blocks = (0..8).map(|i| TestBlock::content(format!("block-{i}"))).collect::<Vec<_>>();
        for block in &blocks {
            put(&cache, block).unwrap();
        }
        assert_eq!(tracker.size(), 8 * RECORD);

        cache.close().unwrap();
        cache.close().unwrap();

        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert_eq!(tracker.registered(), 0);
        assert!(cache.backing_store().is_closed());
        for block in &blocks {
            assert_eq!(cache.backing_store().get(&block.routing_key()), Some(block.clone()));
        }
    }

    #[test_log::test]
    fn test_put_after_close_early_bypasses() {
        let tracker = tracker(16 * RECORD);
        let cache = started(MemoryStore::new(false), &tracker);
        cache.close_early();

        let block = TestBlock::content("late");
        put(&cache, &block).unwrap();
        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert!(cache.backing_store().contains(&block.routing_key()));
    }

    #[test_log::test]
    fn test_start_after_close_early_fails() {
        let tracker = tracker(16 * RECORD);
        let cache = started(MemoryStore::new(false), &tracker);
        cache.close_early();
        assert_eq!(tracker.registered(), 0);

        assert!(matches!(cache.start(), Err(Error::Closed)));
        assert_eq!(tracker.registered(), 0);

        let block = TestBlock::content("late");
        put(&cache, &block).unwrap();
        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert!(cache.backing_store().contains(&block.routing_key()));
    }

    #[test_log::test]
    fn test_close_persists_healthy_entries_behind_failing_one() {
        let tracker = tracker(16 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(false), &tracker);
        let blocks = (0..5).map(|i| TestBlock::content(format!("block-{i}"))).collect::<Vec<_>>();
        for block in &blocks {
            put(&cache, block).unwrap();
        }

        cache.backing_store().set_fail_key(&blocks[0].routing_key(), true);
        cache.close().unwrap();

        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert!(!cache.backing_store().contains(&blocks[0].routing_key()));
        for block in &blocks[1..] {
            assert_eq!(cache.backing_store().get(&block.routing_key()), Some(block.clone()));
        }
        assert_eq!(op_total(&registry, "discard"), 1);
        assert_eq!(op_total(&registry, "evict"), 4);
    }

    #[test_log::test]
    fn test_drain_gives_up_on_failing_store() {
        let tracker = tracker(16 * RECORD);
        let (cache, registry) = started_with_registry(MemoryStore::new(false), &tracker);
        for i in 0..4 {
            put(&cache, &TestBlock::content(format!("block-{i}"))).unwrap();
        }

        cache.backing_store().set_fail_writes(true);
        cache.close_early();

        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        // Three entries are given up on one by one, the last one is discarded with the rest.
        assert_eq!(op_total(&registry, "write_back_failure"), 11);
        assert_eq!(op_total(&registry, "discard"), 4);
    }

    #[test_log::test]
    fn test_failing_entry_does_not_block_background_flush() {
        let tracker = tracker(16 * RECORD);
        let cache = started(MemoryStore::new(false), &tracker);
        let blocks = (0..5).map(|i| TestBlock::content(format!("block-{i}"))).collect::<Vec<_>>();
        for block in &blocks {
            put(&cache, block).unwrap();
        }

        cache.backing_store().set_fail_key(&blocks[0].routing_key(), true);
        assert!(tracker.flush());

        for block in &blocks[1..] {
            assert_eq!(cache.backing_store().get(&block.routing_key()), Some(block.clone()));
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(tracker.size(), RECORD);
        // The stalled flush keeps the entry and re-arms the deadline for a later attempt.
        assert!(tracker.is_flush_scheduled());
        assert_eq!(fetch(&cache, &blocks[0]), Some(blocks[0].clone()));

        cache.backing_store().set_fail_key(&blocks[0].routing_key(), false);
        assert!(tracker.flush());
        assert!(cache.is_empty());
        assert_eq!(tracker.size(), 0);
        assert_eq!(cache.backing_store().get(&blocks[0].routing_key()), Some(blocks[0].clone()));
    }

    #[test_log::test]
    fn test_failed_write_back_keeps_entry() {
        let tracker = tracker(16 * RECORD);
        let cache = started(MemoryStore::new(false), &tracker);
        let block = TestBlock::content("retry");
        put(&cache, &block).unwrap();

        cache.backing_store().set_fail_writes(true);
        for _ in 0..5 {
            assert_eq!(cache.evict_oldest(), Evicted::Failed);
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(tracker.size(), RECORD);

        cache.backing_store().set_fail_writes(false);
        assert_eq!(cache.evict_oldest(), Evicted::Freed(RECORD));
        assert_eq!(tracker.size(), 0);
    }

    #[test_log::test]
    fn test_drop_without_close_releases_budget() {
        let tracker = tracker(16 * RECORD);
        {
            let cache = started(MemoryStore::new(false), &tracker);
            put(&cache, &TestBlock::content("lost")).unwrap();
            assert_eq!(tracker.size(), RECORD);
        }
        assert_eq!(tracker.size(), 0);
        // The dead registration is pruned by the next flush.
        assert!(tracker.flush());
        assert_eq!(tracker.registered(), 0);
    }
}
