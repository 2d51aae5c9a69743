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
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use wbstore_common::{
    error::Result,
    runtime::{Runtime, RuntimeOptions},
    strict_assert,
};

use crate::config::TrackerConfig;

/// Outcome of writing back the least recently cached entry of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evicted {
    /// The entry was persisted and removed, freeing the given bytes.
    Freed(usize),
    /// The entry was persisted but replaced while the write was in flight. Nothing is freed.
    Superseded,
    /// The backing store failed the write. The entry stays cached and moves behind the others for a later attempt.
    Failed,
    /// The backing store failed the entry too many times. It was dropped without being persisted, freeing the given
    /// bytes.
    Discarded(usize),
    /// The cache holds no entries.
    Empty,
}

/// A cache whose entries can be drained by the tracker.
pub trait FlushTarget: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Write back the least recently cached entry.
    ///
    /// With `max_attempts`, an entry whose write-back has failed that many times is dropped and reported as
    /// [`Evicted::Discarded`]. Without it, failed entries are kept forever.
    ///
    /// Must not be called while holding the tracker lock.
    fn evict_oldest(&self, max_attempts: Option<usize>) -> Evicted;

    /// Drop every cached entry without writing it back, returning the bytes released.
    ///
    /// Only used when a closing cache cannot persist its residual entries.
    fn discard_all(&self) -> usize;
}

/// Identifier of a registered [`FlushTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(u64);

/// Write-back attempts of one entry while draining a closing cache.
const DRAIN_ATTEMPTS: usize = 3;
/// Consecutive entries given up on before the backing store is considered dead and the rest is discarded.
const DRAIN_DISCARD_LIMIT: usize = 3;

/// Background flush scheduling state.
///
/// Every timer carries the epoch it was armed with. A timer whose epoch no longer matches the state is stale and
/// does nothing when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Idle,
    Scheduled { epoch: u64, immediate: bool },
    Flushing { deadline: Option<u64> },
}

#[derive(Debug)]
struct TrackerState {
    size: usize,
    flush: FlushState,
    epoch: u64,
    targets: BTreeMap<TargetId, Weak<dyn FlushTarget>>,
}

impl TrackerState {
    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

#[derive(Debug)]
struct TrackerInner {
    max_bytes: usize,
    low_threshold: f64,
    flush_deadline: Duration,
    batch_size: usize,

    state: Mutex<TrackerState>,
    next_target_id: AtomicU64,
    /// Latest epoch whose timer was dropped without firing, `0` if none.
    lost_epoch: AtomicU64,

    runtime: Runtime,
}

/// Shared memory tracker.
///
/// Tracks the bytes held by every registered write-back cache against one hard ceiling, and drives their write-back
/// with at most one background flush running at a time.
#[derive(Debug, Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

/// Builder of [`Tracker`].
#[derive(Debug)]
pub struct TrackerBuilder {
    config: TrackerConfig,
    runtime_options: RuntimeOptions,
    runtime_handle: Option<Handle>,
}

impl TrackerBuilder {
    /// Create a tracker builder with the given hard ceiling.
    pub fn new(max_bytes: usize) -> Self {
        Self::from_config(TrackerConfig {
            max_bytes,
            ..Default::default()
        })
    }

    /// Create a tracker builder from a config.
    pub fn from_config(config: TrackerConfig) -> Self {
        Self {
            config,
            runtime_options: RuntimeOptions::default(),
            runtime_handle: None,
        }
    }

    /// Set the worst-case staleness of a cached block.
    ///
    /// Default: 5 minutes.
    pub fn with_flush_deadline(mut self, flush_deadline: Duration) -> Self {
        self.config.flush_deadline_millis = flush_deadline.as_millis() as u64;
        self
    }

    /// Set the fraction of the ceiling above which an admission triggers an immediate flush.
    ///
    /// Default: `0.9`.
    pub fn with_low_threshold_fraction(mut self, fraction: f64) -> Self {
        self.config.low_threshold_fraction = fraction;
        self
    }

    /// Set the count of entries drained per cache per flush pass.
    ///
    /// Default: `20`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the options of the dedicated runtime that runs background flushes.
    pub fn with_runtime_options(mut self, runtime_options: RuntimeOptions) -> Self {
        self.runtime_options = runtime_options;
        self
    }

    /// Run background flushes on an existing runtime instead of a dedicated one.
    ///
    /// The runtime must have its time driver enabled.
    pub fn with_runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime_handle = Some(handle);
        self
    }

    /// Build the tracker.
    pub fn build(self) -> Result<Tracker> {
        self.config.validate()?;
        let runtime = match self.runtime_handle {
            Some(handle) => Runtime::from_handle(handle),
            None => Runtime::dedicated(&self.runtime_options)?,
        };
        let inner = TrackerInner {
            max_bytes: self.config.max_bytes,
            low_threshold: self.config.low_threshold(),
            flush_deadline: self.config.flush_deadline(),
            batch_size: self.config.batch_size,
            state: Mutex::new(TrackerState {
                size: 0,
                flush: FlushState::Idle,
                epoch: 0,
                targets: BTreeMap::new(),
            }),
            next_target_id: AtomicU64::new(0),
            lost_epoch: AtomicU64::new(0),
            runtime,
        };
        Ok(Tracker { inner: Arc::new(inner) })
    }
}

impl Tracker {
    /// Build a tracker from a config with a dedicated runtime.
    pub fn open(config: TrackerConfig) -> Result<Self> {
        TrackerBuilder::from_config(config).build()
    }

    /// Ask for `cost` bytes of budget for a new cached entry.
    ///
    /// Returns `false` if the admission would exceed the ceiling. The caller must then bypass the cache.
    /// Never blocks on a flush: it only schedules one.
    pub fn admit(&self, cost: usize) -> bool {
        let mut state = self.inner.state.lock();
        let wanted = state.size + cost;

        let mut triggered = false;
        // Nothing to drain yet if the tracker is empty.
        if wanted as f64 > self.inner.low_threshold && state.size > 0 {
            triggered = self.inner.schedule_immediate(&mut state);
        }

        if wanted > self.inner.max_bytes {
            return false;
        }
        state.size = wanted;

        if !triggered {
            self.inner.ensure_deadline(&mut state);
        }
        true
    }

    /// Give back `bytes` of budget without a flush, e.g. for an admission that was not used.
    pub fn release(&self, bytes: usize) {
        let mut state = self.inner.state.lock();
        self.inner.release(&mut state, bytes);
    }

    /// Register a cache. Its entries are drained by background flushes until it is unregistered.
    pub fn register(&self, target: Weak<dyn FlushTarget>) -> TargetId {
        let id = TargetId(self.inner.next_target_id.fetch_add(1, Ordering::Relaxed));
        self.inner.state.lock().targets.insert(id, target);
        id
    }

    /// Synchronously drain a cache on the calling thread, then unregister it.
    ///
    /// Bypasses the background scheduler. Returns the bytes freed.
    pub fn unregister(&self, id: TargetId) -> usize {
        let target = self.inner.state.lock().targets.get(&id).and_then(Weak::upgrade);
        let freed = match target {
            Some(target) => self.inner.drain(target.as_ref()),
            None => 0,
        };
        self.inner.state.lock().targets.remove(&id);
        freed
    }

    /// Run a flush on the calling thread, unless one is already running.
    ///
    /// Returns `false` if another flush is running.
    pub fn flush(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if matches!(state.flush, FlushState::Flushing { .. }) {
                return false;
            }
            // Any armed timer becomes stale.
            state.flush = FlushState::Flushing { deadline: None };
        }
        self.inner.run_flush();
        true
    }

    /// Bytes currently held across all registered caches.
    pub fn size(&self) -> usize {
        self.inner.state.lock().size
    }

    /// The hard ceiling.
    pub fn max_bytes(&self) -> usize {
        self.inner.max_bytes
    }

    /// Returns `true` if a flush is running.
    pub fn is_flushing(&self) -> bool {
        matches!(self.inner.state.lock().flush, FlushState::Flushing { .. })
    }

    /// Returns `true` if a flush is armed on the timer but has not started yet.
    pub fn is_flush_scheduled(&self) -> bool {
        matches!(self.inner.state.lock().flush, FlushState::Scheduled { .. })
    }

    /// Count of registered caches.
    pub fn registered(&self) -> usize {
        self.inner.state.lock().targets.len()
    }
}

/// Moves into an armed timer, and reports the timer lost if it is dropped without firing, e.g. because the runtime
/// shut down.
struct TimerGuard {
    tracker: Weak<TrackerInner>,
    epoch: u64,
    fired: bool,
}

impl TimerGuard {
    fn fire(mut self) {
        self.fired = true;
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.on_timer(self.epoch);
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        // May run inside `arm` with the state lock held, so only the atomic is touched here.
        if let Some(tracker) = self.tracker.upgrade() {
            tracing::error!("[tracker] flush timer of epoch {} dropped without firing", self.epoch);
            tracker.lost_epoch.fetch_max(self.epoch, Ordering::AcqRel);
        }
    }
}

impl TrackerInner {
    fn arm(self: &Arc<Self>, epoch: u64, delay: Duration) {
        let guard = TimerGuard {
            tracker: Arc::downgrade(self),
            epoch,
            fired: false,
        };
        // Detached. A timer that never fires is reported by its guard.
        let _ = self.runtime.spawn_blocking_after(delay, move || guard.fire());
    }

    /// Forget the armed timer if it was lost, so the next admission arms a new one.
    fn reap_lost_timer(&self, state: &mut TrackerState) {
        let lost = self.lost_epoch.swap(0, Ordering::AcqRel);
        if lost == 0 {
            return;
        }
        match state.flush {
            FlushState::Scheduled { epoch, .. } if epoch == lost => state.flush = FlushState::Idle,
            FlushState::Flushing { deadline: Some(epoch) } if epoch == lost => {
                state.flush = FlushState::Flushing { deadline: None }
            }
            _ => {}
        }
    }

    /// Returns `true` if an immediate flush is pending after the call.
    fn schedule_immediate(self: &Arc<Self>, state: &mut TrackerState) -> bool {
        self.reap_lost_timer(state);
        match state.flush {
            FlushState::Flushing { .. } => false,
            FlushState::Scheduled { immediate: true, .. } => true,
            FlushState::Idle | FlushState::Scheduled { immediate: false, .. } => {
                let epoch = state.next_epoch();
                state.flush = FlushState::Scheduled { epoch, immediate: true };
                self.arm(epoch, Duration::ZERO);
                true
            }
        }
    }

    fn ensure_deadline(self: &Arc<Self>, state: &mut TrackerState) {
        self.reap_lost_timer(state);
        match state.flush {
            FlushState::Scheduled { .. } | FlushState::Flushing { deadline: Some(_) } => {}
            FlushState::Idle => {
                let epoch = state.next_epoch();
                state.flush = FlushState::Scheduled { epoch, immediate: false };
                self.arm(epoch, self.flush_deadline);
            }
            FlushState::Flushing { deadline: None } => {
                let epoch = state.next_epoch();
                state.flush = FlushState::Flushing { deadline: Some(epoch) };
                self.arm(epoch, self.flush_deadline);
            }
        }
    }

    fn on_timer(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.state.lock();
            match state.flush {
                FlushState::Scheduled { epoch: armed, .. } if armed == epoch => {
                    state.flush = FlushState::Flushing { deadline: None };
                }
                FlushState::Flushing { deadline: Some(armed) } if armed == epoch => {
                    // The running flush drains to zero, or re-arms a deadline if it cannot.
                    state.flush = FlushState::Flushing { deadline: None };
                    return;
                }
                _ => return,
            }
        }
        self.run_flush();
    }

    /// Drain every registered cache round-robin until the tracker is empty.
    ///
    /// The caller must have moved the state to `Flushing`.
    #[tracing::instrument(skip(self))]
    fn run_flush(self: &Arc<Self>) {
        let start = Instant::now();
        let mut freed = 0;
        let mut passes = 0;

        loop {
            passes += 1;
            let targets = self.snapshot();
            let mut progress = false;

            for target in targets {
                for _ in 0..self.batch_size {
                    match target.evict_oldest(None) {
                        Evicted::Empty => break,
                        // A failed entry is requeued behind the others, so the rest of the batch still gets a turn.
                        Evicted::Failed | Evicted::Superseded => continue,
                        Evicted::Freed(bytes) | Evicted::Discarded(bytes) => {
                            progress = true;
                            freed += bytes;
                            let mut state = self.state.lock();
                            self.release(&mut state, bytes);
                            if state.size == 0 {
                                self.finish_flush(&mut state);
                                drop(state);
                                tracing::debug!(
                                    "[tracker] flush finished, freed: {freed}, passes: {passes}, elapsed: {:?}",
                                    start.elapsed()
                                );
                                return;
                            }
                        }
                    }
                }
            }

            let mut state = self.state.lock();
            if state.size == 0 || !progress {
                let size = state.size;
                self.finish_flush(&mut state);
                drop(state);
                if size > 0 {
                    tracing::warn!(
                        "[tracker] flush stalled with {size} bytes outstanding, freed: {freed}, passes: {passes}"
                    );
                } else {
                    tracing::debug!(
                        "[tracker] flush finished, freed: {freed}, passes: {passes}, elapsed: {:?}",
                        start.elapsed()
                    );
                }
                return;
            }
        }
    }

    fn finish_flush(self: &Arc<Self>, state: &mut TrackerState) {
        strict_assert!(matches!(state.flush, FlushState::Flushing { .. }));
        let deadline = match state.flush {
            FlushState::Flushing { deadline } => deadline,
            _ => None,
        };
        match deadline {
            Some(epoch) => state.flush = FlushState::Scheduled { epoch, immediate: false },
            None => {
                state.flush = FlushState::Idle;
                if state.size > 0 {
                    self.ensure_deadline(state);
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn FlushTarget>> {
        let mut state = self.state.lock();
        state.targets.retain(|_, target| target.strong_count() > 0);
        state.targets.values().filter_map(Weak::upgrade).collect_vec()
    }

    /// Write back every entry of `target`, giving up on entries the backing store keeps failing.
    ///
    /// Returns the bytes persisted.
    fn drain(&self, target: &dyn FlushTarget) -> usize {
        let mut freed = 0;
        let mut discarded = 0;
        let mut given_up_in_row = 0;
        loop {
            match target.evict_oldest(Some(DRAIN_ATTEMPTS)) {
                Evicted::Empty => break,
                Evicted::Superseded | Evicted::Failed => {}
                Evicted::Freed(bytes) => {
                    given_up_in_row = 0;
                    freed += bytes;
                    let mut state = self.state.lock();
                    self.release(&mut state, bytes);
                }
                Evicted::Discarded(bytes) => {
                    given_up_in_row += 1;
                    discarded += bytes;
                    let mut state = self.state.lock();
                    self.release(&mut state, bytes);
                    drop(state);
                    if given_up_in_row >= DRAIN_DISCARD_LIMIT {
                        let rest = target.discard_all();
                        tracing::error!(
                            "[tracker] give up draining {} after {given_up_in_row} entries failed in a row, discarded: {rest} bytes",
                            target.name()
                        );
                        discarded += rest;
                        let mut state = self.state.lock();
                        self.release(&mut state, rest);
                        break;
                    }
                }
            }
        }
        if discarded > 0 {
            tracing::warn!("[tracker] drained {}, freed: {freed}, discarded: {discarded}", target.name());
        } else {
            tracing::info!("[tracker] drained {}, freed: {freed}", target.name());
        }
        freed
    }

    fn release(&self, state: &mut TrackerState, bytes: usize) {
        match state.size.checked_sub(bytes) {
            Some(size) => state.size = size,
            None => {
                tracing::error!(
                    "[tracker] budget invariant violated: release {bytes} bytes with only {} tracked, clamp to 0",
                    state.size
                );
                state.size = 0;
            }
        }
    }
}
