//! Execution of a physical plan.
//!
//! The runner splits a plan into subtasks, groups them into dependency waves and runs each
//! wave on a rayon pool. Subtasks never share memory: placeholders resolve against the
//! shared [`ResultStore`], and each subtask publishes its outputs there when it finishes.
//! Because a wave only depends on earlier waves, no pool thread ever blocks on work that
//! is queued behind it.
//!
//! What an operator actually computes is up to the [`ChunkExecutor`].

use crate::error::GraphError;
use crate::exchange::{Fetch, FetchShuffle};
use crate::key::OpKey;
use crate::operator::{OpKind, Operator};
use crate::planner::{PhysicalPlan, Planner, Subtask, dependency_waves};
use crate::store::{CancelHandle, ChunkData, MapperAddr, ResultStore};
use anyhow::{Context, Result, anyhow, bail};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Input handed to a [`ChunkExecutor`] for one operator input.
#[derive(Clone, Debug)]
pub enum ChunkInput {
    /// A single upstream result.
    Chunk(ChunkData),
    /// One partition per mapper, in mapper order (reducer inputs).
    Partitions(Vec<ChunkData>),
}

/// What a [`ChunkExecutor`] produced for one operator.
#[derive(Clone, Debug)]
pub enum ChunkOutput {
    Chunk(ChunkData),
    /// One partition per reducer (mapper outputs).
    Partitions(Vec<ChunkData>),
}

impl From<ChunkOutput> for ChunkInput {
    fn from(out: ChunkOutput) -> Self {
        match out {
            ChunkOutput::Chunk(data) => Self::Chunk(data),
            ChunkOutput::Partitions(parts) => Self::Partitions(parts),
        }
    }
}

/// Computes one chunk operator from its resolved inputs.
///
/// `ShuffleMap` operators must return exactly `n_reducers` partitions and must route
/// records using only their fields and the record content, so a retried mapper reproduces
/// identical partitions. Every other kind returns a single chunk.
pub trait ChunkExecutor: Send + Sync {
    /// # Errors
    ///
    /// Any failure; the runner retries it up to `max_attempts`.
    fn execute(&self, op: &Operator, inputs: &[ChunkInput]) -> Result<ChunkOutput>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
    /// How long a placeholder waits for its producer; `None` waits until canceled.
    pub fetch_timeout_ms: Option<u64>,
    /// Attempts per subtask, including the first.
    pub max_attempts: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            threads: None,
            fetch_timeout_ms: Some(30_000),
            max_attempts: 2,
        }
    }
}

impl RunnerConfig {
    /// Parse a JSON object; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Malformed JSON or mistyped values.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("parsing runner config")
    }
}

/// Results of the logical sinks of a plan, by logical key.
#[derive(Debug, Default)]
pub struct RunOutput {
    results: BTreeMap<OpKey, Vec<ChunkData>>,
}

impl RunOutput {
    /// Chunk results of a logical sink, in partition order.
    #[must_use]
    pub fn get(&self, logical: &OpKey) -> Option<&[ChunkData]> {
        self.results.get(logical).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &OpKey> {
        self.results.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

pub struct Runner {
    pub config: RunnerConfig,
    store: Arc<ResultStore>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl Runner {
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_store(config, Arc::new(ResultStore::new()))
    }

    /// Run against an existing store, e.g. one holding results of an earlier plan.
    #[must_use]
    pub fn with_store(config: RunnerConfig, store: Arc<ResultStore>) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// Handle canceling every chunk of `plan`; pending and future waits unblock with
    /// `Canceled`.
    #[must_use]
    pub fn cancel_handle(&self, plan: &PhysicalPlan) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.store), plan.chunk_keys())
    }

    /// Execute `plan` and return the results of its logical sinks.
    ///
    /// # Errors
    ///
    /// The first permanent subtask failure, in wave order. Outputs of failed subtasks are
    /// marked failed in the store, so dependents fail fast with `MissingPartition`.
    pub fn run(
        &self,
        planner: &Planner,
        plan: &PhysicalPlan,
        executor: &dyn ChunkExecutor,
    ) -> Result<RunOutput> {
        let subtasks = planner.split_subtasks(plan)?;
        let waves = dependency_waves(&subtasks)?;

        let keep: HashSet<&OpKey> = plan
            .terminals
            .iter()
            .filter_map(|t| plan.chunks_of(t))
            .flatten()
            .collect();
        let mut consumers: HashMap<&OpKey, usize> = HashMap::new();
        for st in &subtasks {
            for key in &st.fetches {
                *consumers.entry(key).or_insert(0) += 1;
            }
        }
        for (key, n) in &consumers {
            if !keep.contains(key) {
                self.store.retain(key, *n);
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads.unwrap_or(0))
            .build()
            .context("building runner thread pool")?;

        info!(subtasks = subtasks.len(), waves = waves.len(), "running plan");
        let mut first_error = None;
        for (w, wave) in waves.iter().enumerate() {
            debug!(wave = w, subtasks = wave.len(), "dispatching wave");
            let results: Vec<(usize, Result<()>)> = pool.install(|| {
                wave.par_iter()
                    .map(|&i| (i, self.run_with_retry(&subtasks[i], executor)))
                    .collect()
            });
            for (i, result) in results {
                let st = &subtasks[i];
                match result {
                    Ok(()) => {
                        for key in st.fetches.iter().filter(|k| !keep.contains(k)) {
                            self.store.release(key);
                        }
                    }
                    Err(e) => {
                        warn!(subtask = %st.key, error = %e, "subtask failed");
                        self.fail_outputs(st, &format!("{e:#}"));
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut output = RunOutput::default();
        for terminal in &plan.terminals {
            let chunks = plan
                .chunks_of(terminal)
                .ok_or_else(|| anyhow!("terminal `{terminal}` was not tiled"))?;
            let data = chunks
                .iter()
                .map(|k| self.store.get(k))
                .collect::<Result<Vec<_>, GraphError>>()?;
            output.results.insert(terminal.clone(), data);
        }
        // Every consumer of this plan's intermediates has finished.
        self.store.purge_evicted();
        Ok(output)
    }

    fn run_with_retry(&self, st: &Subtask, executor: &dyn ChunkExecutor) -> Result<()> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run_subtask(st, executor) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!(subtask = %st.key, attempt, error = %e, "retrying subtask");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn run_subtask(&self, st: &Subtask, executor: &dyn ChunkExecutor) -> Result<()> {
        if let Some(key) = st.outputs.iter().find(|k| self.store.is_canceled(k)) {
            return Err(GraphError::Canceled(key.clone()).into());
        }
        let deadline = self
            .config
            .fetch_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        // Placeholders may wait on keys outside this plan; canceling any chunk of the
        // subtask must still end the wait.
        let consumers: Vec<OpKey> = st
            .graph
            .operators()
            .iter()
            .map(|op| op.key().clone())
            .collect();

        let mut values: HashMap<&OpKey, ChunkInput> = HashMap::new();
        for op in st.graph.operators() {
            let value = match op.kind() {
                OpKind::Fetch => ChunkInput::Chunk(Fetch::from_operator(op)?.resolve_for(
                    &self.store,
                    &consumers,
                    deadline,
                )?),
                OpKind::FetchShuffle => {
                    let reducer = st.reducer_index.ok_or_else(|| {
                        GraphError::InvalidShuffle(format!(
                            "subtask `{}` gathers without a reducer",
                            st.key
                        ))
                    })?;
                    let shuffle = FetchShuffle::from_operator(op)?;
                    ChunkInput::Partitions(shuffle.resolve_for(
                        &self.store,
                        op.key(),
                        reducer,
                        &consumers,
                        deadline,
                    )?)
                }
                _ => {
                    let inputs = op
                        .inputs()
                        .iter()
                        .map(|k| {
                            values.get(k).cloned().ok_or_else(|| {
                                anyhow!("input `{k}` of `{}` was not computed", op.key())
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let out = executor
                        .execute(op, &inputs)
                        .with_context(|| format!("executing {} `{}`", op.kind(), op.key()))?;
                    checked_output(op, out)?
                }
            };
            values.insert(op.key(), value);
        }

        for key in &st.outputs {
            let op = st
                .graph
                .get(key)
                .ok_or_else(|| anyhow!("output `{key}` is not in subtask `{}`", st.key))?;
            match values.remove(key) {
                Some(ChunkInput::Partitions(parts)) if op.kind() == OpKind::ShuffleMap => {
                    self.store.publish_partitions(&mapper_addr(op)?, parts)?;
                }
                Some(ChunkInput::Chunk(data)) => self.store.publish(key.clone(), data),
                _ => bail!("subtask `{}` produced no result for `{key}`", st.key),
            }
        }
        debug!(subtask = %st.key, outputs = st.outputs.len(), "subtask done");
        Ok(())
    }

    fn fail_outputs(&self, st: &Subtask, reason: &str) {
        for key in &st.outputs {
            match st.graph.get(key).map(|op| (op.kind(), mapper_addr(op))) {
                Some((OpKind::ShuffleMap, Ok(addr))) => self.store.fail_mapper(&addr, reason),
                _ => self.store.fail(key, reason),
            }
        }
    }
}

/// Executor failures are retried; graph conditions are not, except a transient barrier.
fn retryable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<GraphError>()
        .is_none_or(GraphError::is_transient)
}

fn checked_output(op: &Operator, out: ChunkOutput) -> Result<ChunkInput> {
    let execution = |message: String| GraphError::Execution {
        key: op.key().clone(),
        message,
    };
    match (op.kind(), out) {
        (OpKind::ShuffleMap, ChunkOutput::Partitions(parts)) => {
            let expected = usize::try_from(op.fields().get_i32("n_reducers")?)
                .map_err(|_| execution("negative n_reducers".into()))?;
            if parts.len() != expected {
                return Err(execution(format!(
                    "mapper produced {} partitions for {expected} reducers",
                    parts.len()
                ))
                .into());
            }
            Ok(ChunkInput::Partitions(parts))
        }
        (OpKind::ShuffleMap, ChunkOutput::Chunk(_)) => {
            Err(execution("mapper must produce partitions".into()).into())
        }
        (_, ChunkOutput::Chunk(data)) => Ok(ChunkInput::Chunk(data)),
        (kind, ChunkOutput::Partitions(_)) => {
            Err(execution(format!("{kind} must produce a single chunk")).into())
        }
    }
}

fn mapper_addr(op: &Operator) -> Result<MapperAddr, GraphError> {
    let shuffle = op.fields().get_string("shuffle_key")?.ok_or_else(|| {
        GraphError::InvalidShuffle(format!("mapper `{}` has no shuffle_key", op.key()))
    })?;
    let count = |field: &str| -> Result<usize, GraphError> {
        usize::try_from(op.fields().get_i32(field)?).map_err(|_| {
            GraphError::InvalidShuffle(format!("mapper `{}` has a negative {field}", op.key()))
        })
    };
    Ok(MapperAddr {
        shuffle: OpKey::from(shuffle),
        index: count("mapper_index")?,
        key: op.key().clone(),
        n_reducers: count("n_reducers")?,
    })
}
