//! Physical planning: logical graph → chunk graph → executable subtasks.
//!
//! The planner runs in two phases:
//!
//! 1. **Tile** ([`Planner::tile`]) -- walk the logical graph in topological order, tile each
//!    operator from its inputs' tiled metadata and register the emitted chunk operators in a
//!    fresh chunk graph. Shuffle stages are inserted wherever partition counts change. Plans
//!    are cached by a content digest of the logical graph; with `verify_determinism` a cache
//!    hit is re-tiled and compared before it is returned.
//! 2. **Split** ([`Planner::split_subtasks`]) -- cut the chunk graph into [`Subtask`]s.
//!    Single-consumer chains are fused. Every edge that crosses a subtask boundary becomes a
//!    `Fetch` placeholder; every proxy → reducer edge becomes a `FetchShuffle` placeholder.
//!    Placeholders adopt the key they stand in for, so edges inside a subtask keep their
//!    keys. `ShuffleProxy` operators exist only to describe the barrier and are never run.
//!
//! [`PhysicalPlan::explain`] renders what was decided.

use crate::error::{GraphError, Result};
use crate::exchange::{Fetch, FetchShuffle, Partitioner, ShuffleFetchType};
use crate::graph::{Graph, GraphBuilder};
use crate::key::{OpKey, digest_hex};
use crate::operator::{OpKind, Operator, OutputMeta};
use crate::tileable::{self, TileContext, TiledTileable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::Arc;
use tracing::{debug, info};

/// Planner knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Addressing mode given to every `FetchShuffle` placeholder.
    pub shuffle_fetch_type: ShuffleFetchType,
    /// Upper bound on reducers for grouped reductions.
    pub max_reducers: usize,
    /// Re-tile cached plans and compare fingerprints.
    pub verify_determinism: bool,
    /// Fuse single-consumer chains into one subtask.
    pub fuse_chains: bool,
    /// Plans kept in the cache; the oldest is dropped beyond this. `0` disables caching.
    pub max_cached_plans: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            shuffle_fetch_type: ShuffleFetchType::FetchByIndex,
            max_reducers: num_cpus::get().max(2),
            verify_determinism: true,
            fuse_chains: true,
            max_cached_plans: 64,
        }
    }
}

impl PlannerConfig {
    /// Parse a JSON object; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// `Schema` for malformed JSON or mistyped values.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| GraphError::Schema(format!("planner config: {e}")))
    }
}

/// A decision the tiler made for one logical operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanDecision {
    /// A mapper → proxy → reducer stage was inserted.
    InsertedShuffle {
        origin: OpKey,
        n_mappers: usize,
        n_reducers: usize,
        partitioner: Partitioner,
    },
    /// Partition count already matched; input chunks were reused.
    PassThrough { origin: OpKey },
}

/// The tiled form of one logical graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalPlan {
    pub chunk_graph: Graph,
    /// Tiled metadata of every logical operator, by logical key.
    pub tiled: BTreeMap<OpKey, TiledTileable>,
    /// Logical sinks, in logical topological order.
    pub terminals: Vec<OpKey>,
    pub decisions: Vec<PlanDecision>,
    /// [`Graph::fingerprint`] of `chunk_graph`.
    pub fingerprint: String,
}

impl PhysicalPlan {
    /// Chunk keys of a logical operator, in partition order.
    #[must_use]
    pub fn chunks_of(&self, logical: &OpKey) -> Option<&[OpKey]> {
        self.tiled.get(logical).map(|t| t.chunks.as_slice())
    }

    /// Every chunk key in the plan.
    #[must_use]
    pub fn chunk_keys(&self) -> Vec<OpKey> {
        self.chunk_graph
            .operators()
            .iter()
            .map(|op| op.key().clone())
            .collect()
    }

    #[must_use]
    pub fn explain(&self) -> PlanExplanation {
        let mut kinds: BTreeMap<OpKind, usize> = BTreeMap::new();
        for op in self.chunk_graph.operators() {
            *kinds.entry(op.kind()).or_insert(0) += 1;
        }
        let shuffles = self
            .decisions
            .iter()
            .filter(|d| matches!(d, PlanDecision::InsertedShuffle { .. }))
            .count();
        PlanExplanation {
            logical_ops: self.tiled.len(),
            chunk_ops: self.chunk_graph.len(),
            shuffles,
            kinds: kinds.into_iter().collect(),
            decisions: self.decisions.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Summary of a [`PhysicalPlan`].
#[derive(Debug, Clone)]
pub struct PlanExplanation {
    pub logical_ops: usize,
    pub chunk_ops: usize,
    pub shuffles: usize,
    /// Chunk operator count per kind.
    pub kinds: Vec<(OpKind, usize)>,
    pub decisions: Vec<PlanDecision>,
    pub fingerprint: String,
}

impl Display for PlanExplanation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        writeln!(
            f,
            "╔═══════════════════════════════════════════════════════════════╗"
        )?;
        writeln!(
            f,
            "║              PHYSICAL PLAN EXPLANATION                        ║"
        )?;
        writeln!(
            f,
            "╚═══════════════════════════════════════════════════════════════╝"
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "┌─ SUMMARY ────────────────────────────────────────────────────┐"
        )?;
        writeln!(f, "│ Logical Ops:       {:>10}", self.logical_ops)?;
        writeln!(f, "│ Chunk Ops:         {:>10}", self.chunk_ops)?;
        writeln!(f, "│ Shuffle Stages:    {:>10}", self.shuffles)?;
        let short = &self.fingerprint[..16.min(self.fingerprint.len())];
        writeln!(f, "│ Fingerprint:       {short}")?;
        writeln!(
            f,
            "└──────────────────────────────────────────────────────────────┘"
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "┌─ CHUNK OPERATORS ────────────────────────────────────────────┐"
        )?;
        for (kind, count) in &self.kinds {
            let barrier = if *kind == OpKind::ShuffleProxy { " [BARRIER]" } else { "" };
            writeln!(f, "│ {:<16} {count:>6}{barrier}", kind.name())?;
        }
        writeln!(
            f,
            "└──────────────────────────────────────────────────────────────┘"
        )?;

        if !self.decisions.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "┌─ TILING DECISIONS ───────────────────────────────────────────┐"
            )?;
            for decision in &self.decisions {
                match decision {
                    PlanDecision::InsertedShuffle {
                        origin,
                        n_mappers,
                        n_reducers,
                        partitioner,
                    } => {
                        writeln!(f, "│ • Shuffle for {origin}")?;
                        let route = format!("{n_mappers} mappers → {n_reducers} reducers");
                        writeln!(f, "│   {route} ({partitioner:?} partitioning)")?;
                    }
                    PlanDecision::PassThrough { origin } => {
                        writeln!(f, "│ • Pass-through for {origin}")?;
                        writeln!(f, "│   Partition count unchanged, chunks reused")?;
                    }
                }
            }
            writeln!(
                f,
                "└──────────────────────────────────────────────────────────────┘"
            )?;
        }
        Ok(())
    }
}

/// One schedulable fragment of a chunk graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subtask {
    pub key: OpKey,
    /// Placeholders first, then the fused chunk operators in topological order.
    pub graph: Graph,
    /// Chunk keys whose results leave this subtask (consumed elsewhere, or terminal).
    pub outputs: Vec<OpKey>,
    /// Keys of the subtasks this one fetches from.
    pub depends_on: Vec<OpKey>,
    /// Set when the subtask contains a shuffle reducer.
    pub reducer_index: Option<usize>,
    /// Upstream chunk or mapper keys read through placeholders.
    pub fetches: Vec<OpKey>,
}

/// Logical → physical planner with a plan cache.
#[derive(Debug, Default)]
pub struct Planner {
    pub config: PlannerConfig,
    cache: HashMap<String, Arc<PhysicalPlan>>,
    /// Cache digests, oldest first.
    order: VecDeque<String>,
}

impl Planner {
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Number of cached plans.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached plan.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.order.clear();
    }

    /// Tile `logical` into a physical plan, reusing a cached plan for identical input.
    ///
    /// # Errors
    ///
    /// `Tiling` or `Graph` when a logical operator cannot be tiled;
    /// `NonDeterministicTiling` when a verified cache hit re-tiles differently.
    pub fn tile(&mut self, logical: &Graph) -> Result<Arc<PhysicalPlan>> {
        let digest = digest_hex([logical.to_json()?.as_slice()]);
        if let Some(hit) = self.cache.get(&digest) {
            let hit = Arc::clone(hit);
            if self.config.verify_determinism {
                let fresh = self.tile_uncached(logical)?;
                verify_same(&hit, &fresh)?;
            }
            debug!(fingerprint = %hit.fingerprint, "plan cache hit");
            return Ok(hit);
        }
        let plan = Arc::new(self.tile_uncached(logical)?);
        info!(
            logical = logical.len(),
            chunks = plan.chunk_graph.len(),
            shuffles = plan.explain().shuffles,
            "tiled logical graph"
        );
        self.remember(digest, &plan);
        Ok(plan)
    }

    fn remember(&mut self, digest: String, plan: &Arc<PhysicalPlan>) {
        let cap = self.config.max_cached_plans;
        if cap == 0 {
            return;
        }
        while self.cache.len() >= cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.cache.remove(&oldest);
        }
        self.order.push_back(digest.clone());
        self.cache.insert(digest, Arc::clone(plan));
    }

    fn tile_uncached(&self, logical: &Graph) -> Result<PhysicalPlan> {
        let cx = TileContext {
            max_reducers: self.config.max_reducers.max(1),
        };
        let mut builder = GraphBuilder::new();
        let mut tiled: BTreeMap<OpKey, TiledTileable> = BTreeMap::new();
        let mut decisions = Vec::new();

        for op in logical.operators() {
            if op.kind().is_chunk_only() {
                return Err(GraphError::tiling(
                    op.key(),
                    format!("{} cannot appear in a logical graph", op.kind()),
                ));
            }
            let inputs = op
                .inputs()
                .iter()
                .map(|k| {
                    tiled.get(k).ok_or_else(|| {
                        GraphError::tiling(op.key(), format!("input `{k}` not tiled"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let out = tileable::tile(op, &inputs, &cx)?;
            for chunk in out.ops {
                builder.add(
                    chunk.op,
                    chunk.inputs,
                    vec![OutputMeta::new(chunk.index, chunk.shape)],
                )?;
            }
            if let Some(d) = out.decision {
                decisions.push(d);
            }
            tiled.insert(op.key().clone(), out.tiled);
        }

        let terminals = logical.sinks().into_iter().map(|op| op.key().clone()).collect();
        let chunk_graph = builder.finish();
        let fingerprint = chunk_graph.fingerprint();
        Ok(PhysicalPlan {
            chunk_graph,
            tiled,
            terminals,
            decisions,
            fingerprint,
        })
    }

    /// Cut a plan's chunk graph into subtasks, in dependency-respecting order.
    ///
    /// # Errors
    ///
    /// `Graph` for a malformed chunk graph; `InvalidShuffle` for a reducer whose counts do
    /// not describe a valid shuffle.
    pub fn split_subtasks(&self, plan: &PhysicalPlan) -> Result<Vec<Subtask>> {
        let g = &plan.chunk_graph;
        let counts = g.consumer_counts();

        // Group assignment. Proxies belong to no group.
        let mut group_of: HashMap<&OpKey, usize> = HashMap::new();
        let mut groups: Vec<Vec<&Operator>> = Vec::new();
        for op in g.operators() {
            if op.kind() == OpKind::ShuffleProxy {
                continue;
            }
            let target = if self.config.fuse_chains {
                fusion_target(g, &counts, &group_of, op)
            } else {
                None
            };
            let gi = match target {
                Some(gi) => {
                    groups[gi].push(op);
                    gi
                }
                None => {
                    groups.push(vec![op]);
                    groups.len() - 1
                }
            };
            group_of.insert(op.key(), gi);
        }

        let mut leaving: HashSet<&OpKey> = HashSet::new();
        for op in g.operators() {
            for input in op.inputs() {
                if group_of.get(input) != group_of.get(op.key()) {
                    leaving.insert(input);
                }
            }
        }
        for sink in g.sinks() {
            leaving.insert(sink.key());
        }
        // Terminal chunks may be reused upstream chunks (pass-through), so they are
        // published even when a fused consumer also reads them.
        for terminal in &plan.terminals {
            leaving.extend(plan.chunks_of(terminal).unwrap_or_default());
        }

        let keys: Vec<OpKey> = groups
            .iter()
            .map(|ops| ops[0].key().derive("subtask", &[]))
            .collect();

        let mut subtasks = Vec::with_capacity(groups.len());
        for (gi, ops) in groups.iter().enumerate() {
            let members: HashSet<&OpKey> = ops.iter().map(|op| op.key()).collect();
            let mut builder = GraphBuilder::new();
            let mut depends_on: Vec<OpKey> = Vec::new();
            let mut fetches = Vec::new();
            let mut reducer_index = None;
            let mut depend = |producer: &OpKey| -> Result<()> {
                let &pg = group_of.get(producer).ok_or_else(|| {
                    GraphError::Graph(format!("`{producer}` belongs to no subtask"))
                })?;
                if !depends_on.contains(&keys[pg]) {
                    depends_on.push(keys[pg].clone());
                }
                Ok(())
            };

            for op in ops {
                for input in op.inputs() {
                    if members.contains(input) || builder.get(input).is_some() {
                        continue;
                    }
                    let producer = g
                        .get(input)
                        .ok_or_else(|| GraphError::Graph(format!("dangling input `{input}`")))?;
                    let placeholder = if producer.kind() == OpKind::ShuffleProxy {
                        let mappers = producer.inputs().to_vec();
                        for m in &mappers {
                            depend(m)?;
                        }
                        fetches.extend(mappers.iter().cloned());
                        let n_reducers = count(op, "n_reducers")?;
                        let shuffle = match self.config.shuffle_fetch_type {
                            ShuffleFetchType::FetchByKey => {
                                FetchShuffle::by_key(mappers, n_reducers)?
                            }
                            ShuffleFetchType::FetchByIndex => {
                                FetchShuffle::by_index(mappers.len(), n_reducers)?
                            }
                        };
                        shuffle.placeholder(input.clone())?
                    } else {
                        depend(input)?;
                        fetches.push(input.clone());
                        Fetch::new(input.clone()).placeholder()?
                    };
                    builder.add(placeholder, Vec::new(), producer.outputs().to_vec())?;
                }
                if op.kind() == OpKind::ShuffleReduce {
                    reducer_index = Some(count(op, "reducer_index")?);
                }
                builder.add_bound((*op).clone())?;
            }

            let outputs = ops
                .iter()
                .map(|op| op.key())
                .filter(|k| leaving.contains(k))
                .cloned()
                .collect();
            debug!(subtask = %keys[gi], ops = ops.len(), deps = depends_on.len(), "split subtask");
            subtasks.push(Subtask {
                key: keys[gi].clone(),
                graph: builder.finish(),
                outputs,
                depends_on,
                reducer_index,
                fetches,
            });
        }
        Ok(subtasks)
    }
}

/// The group `op` can be fused into: its single producer's, when that producer has no other
/// consumer and is not a shuffle operator.
fn fusion_target(
    g: &Graph,
    counts: &HashMap<&OpKey, usize>,
    group_of: &HashMap<&OpKey, usize>,
    op: &Operator,
) -> Option<usize> {
    let [input] = op.inputs() else {
        return None;
    };
    let producer = g.get(input)?;
    if matches!(producer.kind(), OpKind::ShuffleMap | OpKind::ShuffleProxy) {
        return None;
    }
    if counts.get(input).copied() != Some(1) {
        return None;
    }
    group_of.get(input).copied()
}

fn count(op: &Operator, field: &str) -> Result<usize> {
    let v = op.fields().get_i32(field)?;
    usize::try_from(v).map_err(|_| {
        GraphError::InvalidShuffle(format!("`{}` has negative {field}: {v}", op.key()))
    })
}

fn verify_same(cached: &PhysicalPlan, fresh: &PhysicalPlan) -> Result<()> {
    if cached.fingerprint != fresh.fingerprint || cached.chunk_keys() != fresh.chunk_keys() {
        return Err(GraphError::NonDeterministicTiling {
            expected: cached.fingerprint.clone(),
            actual: fresh.fingerprint.clone(),
        });
    }
    Ok(())
}

/// Group subtasks into levels: every subtask in wave `n` depends only on waves `< n`.
///
/// Returned indices point into `subtasks`, which must be in dependency-respecting order
/// (as [`Planner::split_subtasks`] returns them).
///
/// # Errors
///
/// `Graph` when a subtask depends on one that is absent or listed after it.
pub fn dependency_waves(subtasks: &[Subtask]) -> Result<Vec<Vec<usize>>> {
    let mut level_of: HashMap<&OpKey, usize> = HashMap::new();
    let mut waves: Vec<Vec<usize>> = Vec::new();
    for (i, st) in subtasks.iter().enumerate() {
        let mut level = 0;
        for dep in &st.depends_on {
            let &l = level_of.get(dep).ok_or_else(|| {
                GraphError::Graph(format!("subtask `{}` depends on unscheduled `{dep}`", st.key))
            })?;
            level = level.max(l + 1);
        }
        level_of.insert(&st.key, level);
        if waves.len() <= level {
            waves.resize_with(level + 1, Vec::new);
        }
        waves[level].push(i);
    }
    Ok(waves)
}
