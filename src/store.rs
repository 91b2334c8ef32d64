//! Key-addressed result store consulted by `Fetch` and `FetchShuffle`.
//!
//! Completed chunk tasks publish here; placeholders resolve here. Producers and consumers
//! never share memory directly. The store holds two kinds of entries:
//!
//! - **results**: one payload per chunk key ([`publish`](ResultStore::publish));
//! - **mapper outputs**: `n_reducers` partitions per shuffle mapper
//!   ([`publish_partitions`](ResultStore::publish_partitions)), addressable either by the
//!   mapper's key or by `(shuffle key, mapper index)`.
//!
//! Every blocking call waits on a condition variable (no polling) and wakes on publication,
//! failure, eviction or cancellation. A deadline is optional; cancellation is always
//! honored, so no wait is unbounded without an exit.
//!
//! Payloads are type-erased, matching how partitions travel between stages elsewhere in the
//! crate. [`downcast_chunk`] recovers a concrete type and reports a mismatch as a corrupt
//! partition.

use crate::error::{GraphError, MissingReason, Result, SourceRef};
use crate::key::OpKey;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Type-erased, shareable chunk payload.
pub type ChunkData = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a [`ChunkData`].
pub fn chunk<T: Any + Send + Sync>(value: T) -> ChunkData {
    Arc::new(value)
}

/// Recover a concrete payload type.
///
/// # Errors
///
/// `MissingPartition` with reason `Corrupt` when the payload is not a `T`.
pub fn downcast_chunk<T: Any + Send + Sync>(
    data: ChunkData,
    producer: SourceRef,
) -> Result<Arc<T>> {
    data.downcast::<T>().map_err(|_| GraphError::MissingPartition {
        producer,
        reason: MissingReason::Corrupt(format!(
            "payload is not a {}",
            std::any::type_name::<T>()
        )),
    })
}

/// Position of a mapper inside a shuffle stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapperAddr {
    /// Key identifying the shuffle stage (the proxy key).
    pub shuffle: OpKey,
    /// Structural position in `[0, n_mappers)`.
    pub index: usize,
    /// The mapper chunk's own key.
    pub key: OpKey,
    /// Partitions the mapper must publish, one per reducer.
    pub n_reducers: usize,
}

/// How a reducer names the mappers it gathers from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatherSources {
    /// Explicit mapper keys, assembled in this order.
    ByKey(Vec<OpKey>),
    /// Every mapper position `0..n_mappers` of `shuffle`, assembled by position.
    ByIndex { shuffle: OpKey, n_mappers: usize },
}

/// One reducer's barrier: partition `reducer` from every listed mapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatherRequest {
    pub reducer: usize,
    pub sources: GatherSources,
}

impl GatherRequest {
    fn required(&self) -> usize {
        match &self.sources {
            GatherSources::ByKey(keys) => keys.len(),
            GatherSources::ByIndex { n_mappers, .. } => *n_mappers,
        }
    }
}

enum ResultSlot {
    Ready(ChunkData),
    Failed(String),
    Evicted,
}

enum PartSlot {
    Ready(ChunkData),
    Corrupt(String),
}

enum MapperSlot {
    Ready(Vec<PartSlot>),
    Failed(String),
    Evicted,
}

enum Gathered {
    Complete(Vec<ChunkData>),
    Incomplete {
        available: usize,
        first_missing: SourceRef,
    },
}

#[derive(Default)]
struct StoreInner {
    results: HashMap<OpKey, ResultSlot>,
    mappers: HashMap<OpKey, MapperSlot>,
    positions: HashMap<(OpKey, usize), OpKey>,
    refs: HashMap<OpKey, usize>,
    canceled: HashSet<OpKey>,
    all_canceled: bool,
}

impl StoreInner {
    fn check_canceled<'a>(&self, keys: impl IntoIterator<Item = &'a OpKey>) -> Result<()> {
        for key in keys {
            if self.all_canceled || self.canceled.contains(key) {
                return Err(GraphError::Canceled(key.clone()));
            }
        }
        Ok(())
    }

    fn lookup(&self, key: &OpKey) -> Option<Result<ChunkData>> {
        let missing = |reason| GraphError::MissingPartition {
            producer: SourceRef::Key(key.clone()),
            reason,
        };
        match self.results.get(key)? {
            ResultSlot::Ready(data) => Some(Ok(Arc::clone(data))),
            ResultSlot::Failed(msg) => {
                Some(Err(missing(MissingReason::ProducerFailed(msg.clone()))))
            }
            ResultSlot::Evicted => Some(Err(missing(MissingReason::Evicted))),
        }
    }

    fn gather(&self, req: &GatherRequest) -> Result<Gathered> {
        let addressed: Vec<(SourceRef, Option<&OpKey>)> = match &req.sources {
            GatherSources::ByKey(keys) => keys
                .iter()
                .map(|k| (SourceRef::Key(k.clone()), Some(k)))
                .collect(),
            GatherSources::ByIndex { shuffle, n_mappers } => (0..*n_mappers)
                .map(|i| {
                    (
                        SourceRef::MapperIndex(i),
                        self.positions.get(&(shuffle.clone(), i)),
                    )
                })
                .collect(),
        };

        let mut parts = Vec::with_capacity(addressed.len());
        let mut first_missing = None;
        for (source, key) in addressed {
            let missing = |reason| GraphError::MissingPartition {
                producer: source.clone(),
                reason,
            };
            match key.and_then(|k| self.mappers.get(k)) {
                Some(MapperSlot::Ready(slots)) => match slots.get(req.reducer) {
                    Some(PartSlot::Ready(data)) => parts.push(Arc::clone(data)),
                    Some(PartSlot::Corrupt(msg)) => {
                        return Err(missing(MissingReason::Corrupt(msg.clone())));
                    }
                    None => {
                        return Err(missing(MissingReason::Corrupt(format!(
                            "mapper published {} partitions, reducer {} requested",
                            slots.len(),
                            req.reducer
                        ))));
                    }
                },
                Some(MapperSlot::Failed(msg)) => {
                    return Err(missing(MissingReason::ProducerFailed(msg.clone())));
                }
                Some(MapperSlot::Evicted) => return Err(missing(MissingReason::Evicted)),
                None => {
                    if first_missing.is_none() {
                        first_missing = Some(source);
                    }
                }
            }
        }

        Ok(match first_missing {
            None => Gathered::Complete(parts),
            Some(first_missing) => Gathered::Incomplete {
                available: parts.len(),
                first_missing,
            },
        })
    }

    fn watched_keys(&self, req: &GatherRequest) -> Vec<OpKey> {
        match &req.sources {
            GatherSources::ByKey(keys) => keys.clone(),
            GatherSources::ByIndex { shuffle, n_mappers } => {
                let mappers = (0..*n_mappers)
                    .filter_map(|i| self.positions.get(&(shuffle.clone(), i)).cloned());
                std::iter::once(shuffle.clone()).chain(mappers).collect()
            }
        }
    }
}

/// Shared promise store for one execution.
#[derive(Default)]
pub struct ResultStore {
    inner: Mutex<StoreInner>,
    changed: Condvar,
}

impl ResultStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the single result of `key`.
    pub fn publish(&self, key: OpKey, data: ChunkData) {
        debug!(key = %key, "publish result");
        self.inner.lock().results.insert(key, ResultSlot::Ready(data));
        self.changed.notify_all();
    }

    /// Publish a mapper's partitions; element `j` is addressed to reducer `j`.
    ///
    /// # Errors
    ///
    /// `InvalidShuffle` unless there is exactly one partition per reducer; nothing is
    /// published in that case.
    pub fn publish_partitions(
        &self,
        mapper: &MapperAddr,
        partitions: Vec<ChunkData>,
    ) -> Result<()> {
        if partitions.len() != mapper.n_reducers {
            return Err(GraphError::InvalidShuffle(format!(
                "mapper `{}` published {} partitions for {} reducers",
                mapper.key,
                partitions.len(),
                mapper.n_reducers
            )));
        }
        debug!(
            mapper = %mapper.key,
            shuffle = %mapper.shuffle,
            index = mapper.index,
            partitions = partitions.len(),
            "publish mapper partitions"
        );
        let mut g = self.inner.lock();
        g.positions
            .insert((mapper.shuffle.clone(), mapper.index), mapper.key.clone());
        g.mappers.insert(
            mapper.key.clone(),
            MapperSlot::Ready(partitions.into_iter().map(PartSlot::Ready).collect()),
        );
        drop(g);
        self.changed.notify_all();
        Ok(())
    }

    /// Mark a single-result producer as permanently failed.
    pub fn fail(&self, key: &OpKey, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(key = %key, reason = %reason, "producer failed");
        self.inner
            .lock()
            .results
            .insert(key.clone(), ResultSlot::Failed(reason));
        self.changed.notify_all();
    }

    /// Mark a mapper as permanently failed; every reducer waiting on it unblocks with
    /// `MissingPartition`.
    pub fn fail_mapper(&self, mapper: &MapperAddr, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(mapper = %mapper.key, index = mapper.index, reason = %reason, "mapper failed");
        let mut g = self.inner.lock();
        g.positions
            .insert((mapper.shuffle.clone(), mapper.index), mapper.key.clone());
        g.mappers
            .insert(mapper.key.clone(), MapperSlot::Failed(reason));
        drop(g);
        self.changed.notify_all();
    }

    /// Flag one published partition as unreadable.
    pub fn mark_corrupt(&self, mapper: &OpKey, reducer: usize, reason: impl Into<String>) {
        let mut g = self.inner.lock();
        if let Some(MapperSlot::Ready(slots)) = g.mappers.get_mut(mapper)
            && let Some(slot) = slots.get_mut(reducer)
        {
            *slot = PartSlot::Corrupt(reason.into());
        }
        drop(g);
        self.changed.notify_all();
    }

    /// Non-blocking read of a published result.
    ///
    /// # Errors
    ///
    /// `NotFound` if nothing was published under `key`, `MissingPartition` if the producer
    /// failed or the result was evicted, `Canceled` if `key` was canceled.
    pub fn get(&self, key: &OpKey) -> Result<ChunkData> {
        let g = self.inner.lock();
        g.check_canceled([key])?;
        g.lookup(key)
            .unwrap_or_else(|| Err(GraphError::NotFound(key.clone())))
    }

    /// Block until `key` is published, failed, canceled or `deadline` passes.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get); `NotFound` when the deadline passes first.
    pub fn wait(&self, key: &OpKey, deadline: Option<Instant>) -> Result<ChunkData> {
        self.wait_for(key, &[], deadline)
    }

    /// [`wait`](Self::wait) on behalf of `consumers`: canceling any of them also ends the
    /// wait, even when `key` belongs to no canceled plan.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait); `Canceled` naming the first canceled consumer.
    pub fn wait_for(
        &self,
        key: &OpKey,
        consumers: &[OpKey],
        deadline: Option<Instant>,
    ) -> Result<ChunkData> {
        let mut g = self.inner.lock();
        loop {
            g.check_canceled(std::iter::once(key).chain(consumers))?;
            if let Some(found) = g.lookup(key) {
                return found;
            }
            match deadline {
                Some(d) => {
                    if Instant::now() >= d {
                        return Err(GraphError::NotFound(key.clone()));
                    }
                    self.changed.wait_until(&mut g, d);
                }
                None => self.changed.wait(&mut g),
            }
        }
    }

    /// Non-blocking barrier check.
    ///
    /// # Errors
    ///
    /// `IncompleteShuffle` while some mapper has not published; `MissingPartition` naming
    /// the mapper whose partition failed, is corrupt or was evicted; `Canceled`.
    pub fn try_gather(&self, req: &GatherRequest) -> Result<Vec<ChunkData>> {
        let g = self.inner.lock();
        g.check_canceled(&g.watched_keys(req))?;
        match g.gather(req)? {
            Gathered::Complete(parts) => Ok(parts),
            Gathered::Incomplete { available, .. } => Err(GraphError::IncompleteShuffle {
                reducer: req.reducer,
                available,
                required: req.required(),
            }),
        }
    }

    /// Block until every addressed mapper has published partition `req.reducer`.
    ///
    /// Partitions are returned in mapper order (key order or index order), independent of
    /// the order in which mappers completed.
    ///
    /// # Errors
    ///
    /// `MissingPartition` for a failed, corrupt or evicted mapper partition, or, with
    /// reason `DeadlineElapsed`, for the first mapper still missing at the deadline;
    /// `Canceled` when any watched key is canceled.
    pub fn gather(
        &self,
        req: &GatherRequest,
        deadline: Option<Instant>,
    ) -> Result<Vec<ChunkData>> {
        self.gather_for(req, &[], deadline)
    }

    /// [`gather`](Self::gather) on behalf of `consumers`, which are watched for
    /// cancellation alongside the mappers.
    ///
    /// # Errors
    ///
    /// As [`gather`](Self::gather).
    pub fn gather_for(
        &self,
        req: &GatherRequest,
        consumers: &[OpKey],
        deadline: Option<Instant>,
    ) -> Result<Vec<ChunkData>> {
        let mut g = self.inner.lock();
        loop {
            g.check_canceled(g.watched_keys(req).iter().chain(consumers))?;
            match g.gather(req)? {
                Gathered::Complete(parts) => return Ok(parts),
                Gathered::Incomplete {
                    available,
                    first_missing,
                } => {
                    debug!(
                        reducer = req.reducer,
                        available,
                        required = req.required(),
                        "shuffle barrier waiting"
                    );
                    match deadline {
                        Some(d) => {
                            if Instant::now() >= d {
                                return Err(GraphError::MissingPartition {
                                    producer: first_missing,
                                    reason: MissingReason::DeadlineElapsed,
                                });
                            }
                            self.changed.wait_until(&mut g, d);
                        }
                        None => self.changed.wait(&mut g),
                    }
                }
            }
        }
    }

    /// Cancel `keys`; waiters on any of them unblock with `Canceled`.
    pub fn cancel<'a>(&self, keys: impl IntoIterator<Item = &'a OpKey>) {
        let mut g = self.inner.lock();
        let before = g.canceled.len();
        g.canceled.extend(keys.into_iter().cloned());
        info!(keys = g.canceled.len() - before, "canceled keys");
        drop(g);
        self.changed.notify_all();
    }

    /// Cancel every current and future wait.
    pub fn cancel_all(&self) {
        info!("canceled all waits");
        self.inner.lock().all_canceled = true;
        self.changed.notify_all();
    }

    #[must_use]
    pub fn is_canceled(&self, key: &OpKey) -> bool {
        let g = self.inner.lock();
        g.all_canceled || g.canceled.contains(key)
    }

    /// Declare how many consumers will [`release`](Self::release) `key`.
    pub fn retain(&self, key: &OpKey, consumers: usize) {
        self.inner.lock().refs.insert(key.clone(), consumers);
    }

    /// Drop one consumer reference; the data is evicted once no consumer remains.
    ///
    /// Keys that were never [`retain`](Self::retain)ed are evicted on first release.
    pub fn release(&self, key: &OpKey) {
        let mut g = self.inner.lock();
        let remaining = match g.refs.get_mut(key) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }
        g.refs.remove(key);
        let mut evicted = false;
        if let Some(slot) = g.results.get_mut(key)
            && matches!(slot, ResultSlot::Ready(_))
        {
            *slot = ResultSlot::Evicted;
            evicted = true;
        }
        if let Some(slot) = g.mappers.get_mut(key)
            && matches!(slot, MapperSlot::Ready(_))
        {
            *slot = MapperSlot::Evicted;
            evicted = true;
        }
        drop(g);
        if evicted {
            debug!(key = %key, "evicted");
            self.changed.notify_all();
        }
    }

    /// Drop the tombstones of evicted results and mapper outputs, together with the
    /// shuffle positions pointing at them. Returns how many entries were dropped.
    ///
    /// Tombstones let late readers fail with `Evicted` instead of waiting; purge them once
    /// no reader of those keys can still be running. Later reads see `NotFound`.
    pub fn purge_evicted(&self) -> usize {
        let mut g = self.inner.lock();
        let before = g.results.len() + g.mappers.len();
        g.results.retain(|_, slot| !matches!(slot, ResultSlot::Evicted));
        g.mappers.retain(|_, slot| !matches!(slot, MapperSlot::Evicted));
        let StoreInner {
            mappers, positions, ..
        } = &mut *g;
        positions.retain(|_, key| mappers.contains_key(key));
        let purged = before - (g.results.len() + g.mappers.len());
        if purged > 0 {
            debug!(purged, "purged evicted entries");
        }
        purged
    }

    /// Remove everything recorded about `keys`: results, mapper outputs, their shuffle
    /// positions, reference counts and cancellation flags.
    pub fn forget<'a>(&self, keys: impl IntoIterator<Item = &'a OpKey>) {
        let mut g = self.inner.lock();
        for key in keys {
            g.results.remove(key);
            g.mappers.remove(key);
            g.refs.remove(key);
            g.canceled.remove(key);
            g.positions.retain(|_, mapper| *mapper != *key);
        }
    }

    /// Whether a readable result or mapper output is held under `key`.
    #[must_use]
    pub fn contains(&self, key: &OpKey) -> bool {
        let g = self.inner.lock();
        matches!(g.results.get(key), Some(ResultSlot::Ready(_)))
            || matches!(g.mappers.get(key), Some(MapperSlot::Ready(_)))
    }

    /// Number of readable results and mapper outputs.
    #[must_use]
    pub fn live_entries(&self) -> usize {
        let g = self.inner.lock();
        g.results
            .values()
            .filter(|s| matches!(s, ResultSlot::Ready(_)))
            .count()
            + g.mappers
                .values()
                .filter(|s| matches!(s, MapperSlot::Ready(_)))
                .count()
    }
}

/// Cancels every key of one plan in a shared store.
#[derive(Clone)]
pub struct CancelHandle {
    store: Arc<ResultStore>,
    keys: Arc<Vec<OpKey>>,
}

impl CancelHandle {
    #[must_use]
    pub fn new(store: Arc<ResultStore>, keys: Vec<OpKey>) -> Self {
        Self {
            store,
            keys: Arc::new(keys),
        }
    }

    pub fn cancel(&self) {
        self.store.cancel(self.keys.iter());
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.keys.iter().any(|k| self.store.is_canceled(k))
    }
}
